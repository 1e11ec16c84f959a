use std::io::Cursor;

use dicom_dimse::pdu::{
    read_pdu, write_pdu, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, Pdu, PDataValue,
    PDataValueType, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserVariableItem, DEFAULT_MAX_PDU,
};
use matches::matches;

fn round_trip(pdu: &Pdu) -> Pdu {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu).unwrap();
    let parsed = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)
        .unwrap()
        .unwrap();

    // re-serialization must be byte-identical
    let mut bytes_again = Vec::new();
    write_pdu(&mut bytes_again, &parsed).unwrap();
    assert_eq!(bytes, bytes_again);

    parsed
}

#[test]
fn associate_rq_round_trip() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-PACS".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.826.0.1.3680043.2.1396.999".to_string()),
            UserVariableItem::ImplementationVersionName("TEST-SCU-1".to_string()),
            UserVariableItem::AsyncOperationsWindow {
                max_operations_invoked: 1,
                max_operations_performed: 1,
            },
            UserVariableItem::RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: true,
                scp_role: false,
            },
        ],
    });

    let parsed = round_trip(&association_rq);
    let Pdu::AssociationRQ(parsed) = parsed else {
        panic!("expected A-ASSOCIATE-RQ, got {:?}", parsed);
    };

    assert_eq!(parsed.protocol_version, 1);
    assert_eq!(parsed.calling_ae_title, "STORE-SCU");
    assert_eq!(parsed.called_ae_title, "MAIN-PACS");
    assert_eq!(parsed.application_context_name, "1.2.840.10008.3.1.1.1");
    assert_eq!(parsed.presentation_contexts.len(), 2);
    assert_eq!(parsed.presentation_contexts[0].id, 1);
    assert_eq!(
        parsed.presentation_contexts[0].transfer_syntaxes,
        vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"]
    );
    assert_eq!(parsed.presentation_contexts[1].id, 3);
    assert_eq!(parsed.user_variables.len(), 5);
    assert!(matches!(
        parsed.user_variables[0],
        UserVariableItem::MaxLength(16_384)
    ));
    assert!(matches!(
        &parsed.user_variables[4],
        UserVariableItem::RoleSelection { sop_class_uid, scu_role: true, scp_role: false }
            if sop_class_uid == "1.2.840.10008.5.1.4.1.1.2"
    ));
}

#[test]
fn associate_rq_preserves_unknown_user_items() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "A".to_string(),
        called_ae_title: "B".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(4096),
            // baggage of a sub-item type this implementation does not know
            UserVariableItem::Unknown(0x77, vec![0xDE, 0xAD, 0xBE, 0xEF]),
        ],
    });

    let parsed = round_trip(&association_rq);
    let Pdu::AssociationRQ(parsed) = parsed else {
        panic!("expected A-ASSOCIATE-RQ");
    };
    assert!(matches!(
        &parsed.user_variables[1],
        UserVariableItem::Unknown(0x77, data) if data == &[0xDE, 0xAD, 0xBE, 0xEF]
    ));
}

#[test]
fn associate_ac_round_trip_with_rejected_context() {
    let association_ac = Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-PACS".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                // rejected contexts carry an empty transfer syntax
                transfer_syntax: String::new(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.826.0.1.3680043.2.1396.999".to_string()),
        ],
    });

    let parsed = round_trip(&association_ac);
    let Pdu::AssociationAC(parsed) = parsed else {
        panic!("expected A-ASSOCIATE-AC");
    };
    assert_eq!(parsed.presentation_contexts.len(), 2);
    assert_eq!(
        parsed.presentation_contexts[0].reason,
        PresentationContextResultReason::Acceptance
    );
    assert_eq!(
        parsed.presentation_contexts[1].reason,
        PresentationContextResultReason::TransferSyntaxesNotSupported
    );
    assert_eq!(parsed.presentation_contexts[1].transfer_syntax, "");
}

#[test]
fn associate_rj_round_trip() {
    let association_rj = Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    });
    let parsed = round_trip(&association_rj);
    assert_eq!(parsed, association_rj);
}

#[test]
fn pdata_round_trip() {
    let pdata = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x10, 0x20, 0x30],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0x40; 100],
            },
        ],
    };
    let parsed = round_trip(&pdata);
    assert_eq!(parsed, pdata);
}

#[test]
fn release_round_trips() {
    assert_eq!(round_trip(&Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(round_trip(&Pdu::ReleaseRP), Pdu::ReleaseRP);
}

#[test]
fn ae_titles_are_space_padded_to_16_bytes() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "X".to_string(),
        called_ae_title: String::new(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![],
    });

    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &association_rq).unwrap();

    // header (6) + version (2) + reserved (2), then called AE and calling AE
    let called = &bytes[10..26];
    let calling = &bytes[26..42];
    assert_eq!(called, &[b' '; 16]);
    assert_eq!(&calling[..1], b"X");
    assert_eq!(&calling[1..], &[b' '; 15]);

    // round-trip brings the unpadded titles back
    let parsed = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)
        .unwrap()
        .unwrap();
    let Pdu::AssociationRQ(parsed) = parsed else {
        panic!("expected A-ASSOCIATE-RQ");
    };
    assert_eq!(parsed.called_ae_title, "");
    assert_eq!(parsed.calling_ae_title, "X");
}

#[test]
fn pdu_length_field_covers_exactly_the_body() {
    let association_rq = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-PACS".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![UserVariableItem::MaxLength(16_384)],
    });

    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &association_rq).unwrap();

    let length = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    assert_eq!(length, bytes.len() - 6);
}

#[test]
fn end_of_stream_before_a_pdu_is_not_an_error() {
    let empty: &[u8] = &[];
    let outcome = read_pdu(&mut Cursor::new(empty), DEFAULT_MAX_PDU, true).unwrap();
    assert!(outcome.is_none());
}

#[test]
fn truncated_pdu_is_an_error() {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &Pdu::ReleaseRQ).unwrap();
    bytes.truncate(bytes.len() - 2);
    let outcome = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true);
    assert!(outcome.is_err());
}

#[test]
fn oversized_pdu_is_refused_in_strict_mode() {
    let pdata = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 8000],
        }],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdata).unwrap();

    // strict: over the maximum is an error
    assert!(read_pdu(&mut Cursor::new(&bytes), 4096, true).is_err());
    // lenient: tolerated with a warning
    assert!(read_pdu(&mut Cursor::new(&bytes), 4096, false)
        .unwrap()
        .is_some());
}
