//! Support for decoding PDUs from a byte stream.
use std::io::{Cursor, ErrorKind, Read};

use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::warn;

use crate::pdu::*;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU body"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "incoming PDU is too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid presentation data value length {} (must be >= 2)", length))]
    InvalidPDataValueLength { length: u32, backtrace: Backtrace },

    #[snafu(display("could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display("unknown item type {:#04x} in {}", item_type, pdu_name))]
    UnknownVariableItem {
        item_type: u8,
        pdu_name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected item `{:?}` in {}", var_item, pdu_name))]
    UnexpectedVariableItem {
        var_item: Box<PduVariableItem>,
        pdu_name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown sub-item type {:#04x} in presentation context", item_type))]
    UnknownPresentationContextSubItem { item_type: u8, backtrace: Backtrace },

    /// missing application context name
    MissingApplicationContextName { backtrace: Backtrace },

    /// missing abstract syntax in presentation context
    MissingAbstractSyntax { backtrace: Backtrace },

    /// missing transfer syntax in presentation context
    MissingTransferSyntax { backtrace: Backtrace },

    /// presentation context result carries more than one transfer syntax
    MultipleTransferSyntaxes { backtrace: Backtrace },

    #[snafu(display("invalid association rejection: result {}, source {}, reason {}", result, source_code, reason))]
    InvalidRejection {
        result: u8,
        source_code: u8,
        reason: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid abort: source {}, reason {}", source_code, reason))]
    InvalidAbort {
        source_code: u8,
        reason: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid presentation context result reason {}", code))]
    InvalidResultReason { code: u8, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read one PDU from the given stream.
///
/// Returns `Ok(None)` when the stream is cleanly closed
/// before the first byte of a PDU arrives.
/// An end of stream in the middle of a PDU is an error.
///
/// In strict mode, a PDU longer than `max_pdu_length`
/// is refused outright;
/// otherwise it is tolerated up to [`MAXIMUM_PDU_SIZE`]
/// with a warning, which is lenient towards peers
/// that do not honor the negotiated maximum.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // PDU type byte plus the reserved byte.
    // Failing to read these two means no PDU was started,
    // which callers may treat as a clean end of association.
    let mut head = [0u8; 2];
    if let Err(e) = reader.read_exact(&mut head) {
        if e.kind() == ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }
    let pdu_type = head[0];

    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "incoming PDU of {} bytes exceeds the negotiated maximum of {}",
            pdu_length, max_pdu_length
        );
    }

    let body = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    let mut cursor = Cursor::new(&body[..]);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => read_association_rq(&mut cursor, &codec).map(Some),
        0x02 => read_association_ac(&mut cursor, &codec).map(Some),
        0x03 => {
            // 1 reserved byte, then result, source, reason
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;
            let result_code = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Result" })?;
            let source_code = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Source" })?;
            let reason_code = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Reason/Diag.",
            })?;

            let invalid = InvalidRejectionSnafu {
                result: result_code,
                source_code,
                reason: reason_code,
            };
            let result = AssociationRJResult::from_code(result_code).context(invalid)?;
            let source =
                AssociationRJSource::from_codes(source_code, reason_code).context(invalid)?;
            Ok(Some(Pdu::AssociationRJ(AssociationRJ { result, source })))
        }
        0x04 => {
            let mut values = Vec::new();
            while cursor.position() < body.len() as u64 {
                // each PDV: length (u32), pc-id, message control header, payload
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;
                ensure!(
                    item_length >= 2,
                    InvalidPDataValueLengthSnafu {
                        length: item_length
                    }
                );

                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;

                // bit 0: 1 = command stream, 0 = data stream;
                // bit 1: 1 = last fragment of its stream
                let value_type = if header & 0x01 != 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = header & 0x02 != 0;

                let data = read_n(&mut cursor, item_length as usize - 2).context(
                    ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    },
                )?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                });
            }
            Ok(Some(Pdu::PData { data: values }))
        }
        0x05 => {
            let mut reserved = [0u8; 4];
            cursor
                .read_exact(&mut reserved)
                .context(ReadReservedSnafu { bytes: 4_u32 })?;
            Ok(Some(Pdu::ReleaseRQ))
        }
        0x06 => {
            let mut reserved = [0u8; 4];
            cursor
                .read_exact(&mut reserved)
                .context(ReadReservedSnafu { bytes: 4_u32 })?;
            Ok(Some(Pdu::ReleaseRP))
        }
        0x07 => {
            let mut reserved = [0u8; 2];
            cursor
                .read_exact(&mut reserved)
                .context(ReadReservedSnafu { bytes: 2_u32 })?;
            let source_code = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Source" })?;
            let reason_code = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Reason/Diag",
            })?;
            let source =
                AbortRQSource::from_codes(source_code, reason_code).context(InvalidAbortSnafu {
                    source_code,
                    reason: reason_code,
                })?;
            Ok(Some(Pdu::AbortRQ { source }))
        }
        _ => Ok(Some(Pdu::Unknown {
            pdu_type,
            data: body,
        })),
    }
}

/// Protocol version, 2 reserved bytes, called AE title,
/// calling AE title and 32 reserved bytes:
/// the fixed leading block shared by A-ASSOCIATE-RQ and -AC.
fn read_association_header<R>(
    reader: &mut R,
    codec: &dyn TextCodec,
) -> Result<(u16, String, String)>
where
    R: Read,
{
    let protocol_version = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;
    let mut reserved = [0u8; 2];
    reader
        .read_exact(&mut reserved)
        .context(ReadReservedSnafu { bytes: 2_u32 })?;

    let called_ae_title = read_ae_title(reader, codec, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(reader, codec, "Calling-AE-title")?;

    let mut reserved = [0u8; 32];
    reader
        .read_exact(&mut reserved)
        .context(ReadReservedSnafu { bytes: 32_u32 })?;

    Ok((protocol_version, called_ae_title, calling_ae_title))
}

/// Read exactly 16 bytes of AE title,
/// trimming both padding spaces and stray NULs.
fn read_ae_title<R>(reader: &mut R, codec: &dyn TextCodec, field: &'static str) -> Result<String>
where
    R: Read,
{
    let mut ae_bytes = [0u8; 16];
    reader
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    let decoded = codec.decode(&ae_bytes).context(DecodeTextSnafu { field })?;
    Ok(decoded.trim_matches(|c| c == ' ' || c == '\0').to_string())
}

fn read_association_rq(cursor: &mut Cursor<&[u8]>, codec: &dyn TextCodec) -> Result<Pdu> {
    let (protocol_version, called_ae_title, calling_ae_title) =
        read_association_header(cursor, codec)?;

    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while cursor.position() < cursor.get_ref().len() as u64 {
        match read_variable_item(cursor, codec, "A-ASSOCIATE-RQ")? {
            PduVariableItem::ApplicationContext(name) => {
                application_context_name = Some(name);
            }
            PduVariableItem::PresentationContextProposed(pc) => {
                presentation_contexts.push(pc);
            }
            PduVariableItem::UserVariables(vars) => {
                user_variables = vars;
            }
            var_item => {
                return UnexpectedVariableItemSnafu {
                    var_item: Box::new(var_item),
                    pdu_name: "A-ASSOCIATE-RQ",
                }
                .fail();
            }
        }
    }

    Ok(Pdu::AssociationRQ(AssociationRQ {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    }))
}

fn read_association_ac(cursor: &mut Cursor<&[u8]>, codec: &dyn TextCodec) -> Result<Pdu> {
    let (protocol_version, called_ae_title, calling_ae_title) =
        read_association_header(cursor, codec)?;

    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while cursor.position() < cursor.get_ref().len() as u64 {
        match read_variable_item(cursor, codec, "A-ASSOCIATE-AC")? {
            PduVariableItem::ApplicationContext(name) => {
                application_context_name = Some(name);
            }
            PduVariableItem::PresentationContextResult(pc) => {
                presentation_contexts.push(pc);
            }
            PduVariableItem::UserVariables(vars) => {
                user_variables = vars;
            }
            var_item => {
                return UnexpectedVariableItemSnafu {
                    var_item: Box::new(var_item),
                    pdu_name: "A-ASSOCIATE-AC",
                }
                .fail();
            }
        }
    }

    Ok(Pdu::AssociationAC(AssociationAC {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    }))
}

/// Read one variable item, dispatching on its item type byte.
///
/// An item type unknown at this level is a protocol error
/// and the enclosing association must be torn down.
fn read_variable_item(
    reader: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
    pdu_name: &'static str,
) -> Result<PduVariableItem> {
    let (item_type, body) = read_item(reader)?;
    let mut cursor = Cursor::new(&body[..]);

    match item_type {
        ITEM_APPLICATION_CONTEXT => {
            let name = decode_uid(&body, codec, "Application-context-name")?;
            Ok(PduVariableItem::ApplicationContext(name))
        }
        ITEM_PRESENTATION_CONTEXT_RQ => {
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            let mut reserved = [0u8; 3];
            cursor
                .read_exact(&mut reserved)
                .context(ReadReservedSnafu { bytes: 3_u32 })?;

            let mut abstract_syntax = None;
            let mut transfer_syntaxes = Vec::new();
            while cursor.position() < body.len() as u64 {
                let (sub_type, sub_body) = read_item(&mut cursor)?;
                match sub_type {
                    ITEM_ABSTRACT_SYNTAX => {
                        abstract_syntax =
                            Some(decode_uid(&sub_body, codec, "Abstract-syntax-name")?);
                    }
                    ITEM_TRANSFER_SYNTAX => {
                        transfer_syntaxes.push(decode_uid(
                            &sub_body,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu {
                            item_type: sub_type,
                        }
                        .fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        ITEM_PRESENTATION_CONTEXT_AC => {
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            let mut reserved = [0u8; 1];
            cursor
                .read_exact(&mut reserved)
                .context(ReadReservedSnafu { bytes: 1_u32 })?;
            let reason_code = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Result/Reason",
            })?;
            let reason = PresentationContextResultReason::from_code(reason_code)
                .context(InvalidResultReasonSnafu { code: reason_code })?;
            let mut reserved = [0u8; 1];
            cursor
                .read_exact(&mut reserved)
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // exactly one transfer syntax sub-item follows;
            // its UID is empty when the context was rejected
            let mut transfer_syntax = None;
            while cursor.position() < body.len() as u64 {
                let (sub_type, sub_body) = read_item(&mut cursor)?;
                match sub_type {
                    ITEM_TRANSFER_SYNTAX => {
                        ensure!(transfer_syntax.is_none(), MultipleTransferSyntaxesSnafu);
                        transfer_syntax =
                            Some(decode_uid(&sub_body, codec, "Transfer-syntax-name")?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu {
                            item_type: sub_type,
                        }
                        .fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        ITEM_USER_INFORMATION => {
            let mut user_variables = Vec::new();
            while cursor.position() < body.len() as u64 {
                let (sub_type, sub_body) = read_item(&mut cursor)?;
                user_variables.push(read_user_variable(sub_type, &sub_body, codec)?);
            }
            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => UnknownVariableItemSnafu {
            item_type,
            pdu_name,
        }
        .fail(),
    }
}

fn read_user_variable(
    item_type: u8,
    body: &[u8],
    codec: &dyn TextCodec,
) -> Result<UserVariableItem> {
    let mut cursor = Cursor::new(body);
    match item_type {
        ITEM_MAXIMUM_LENGTH => {
            let max_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-length-received",
            })?;
            Ok(UserVariableItem::MaxLength(max_length))
        }
        ITEM_IMPLEMENTATION_CLASS_UID => Ok(UserVariableItem::ImplementationClassUID(decode_uid(
            body,
            codec,
            "Implementation-class-uid",
        )?)),
        ITEM_IMPLEMENTATION_VERSION_NAME => Ok(UserVariableItem::ImplementationVersionName(
            decode_uid(body, codec, "Implementation-version-name")?,
        )),
        ITEM_ASYNC_OPERATIONS_WINDOW => {
            let max_operations_invoked =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Maximum-number-operations-invoked",
                })?;
            let max_operations_performed =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Maximum-number-operations-performed",
                })?;
            Ok(UserVariableItem::AsyncOperationsWindow {
                max_operations_invoked,
                max_operations_performed,
            })
        }
        ITEM_ROLE_SELECTION => {
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "SOP-class-uid-length",
            })?;
            let uid_bytes = read_n(&mut cursor, uid_length as usize).context(ReadPduFieldSnafu {
                field: "SOP-class-uid",
            })?;
            let sop_class_uid = decode_uid(&uid_bytes, codec, "SOP-class-uid")?;
            let scu_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCU-role" })?;
            let scp_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCP-role" })?;
            Ok(UserVariableItem::RoleSelection {
                sop_class_uid,
                scu_role: scu_role != 0,
                scp_role: scp_role != 0,
            })
        }
        _ => {
            // unrecognized user information baggage is carried, not dropped,
            // so that it can be written back verbatim
            Ok(UserVariableItem::Unknown(item_type, body.to_vec()))
        }
    }
}

/// Read an item or sub-item header
/// (type byte, reserved byte, u16 length)
/// followed by its body.
fn read_item<R>(reader: &mut R) -> Result<(u8, Vec<u8>)>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    let mut reserved = [0u8; 1];
    reader
        .read_exact(&mut reserved)
        .context(ReadReservedSnafu { bytes: 1_u32 })?;
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;
    let body = reader_take(reader, item_length as usize)?;
    Ok((item_type, body))
}

fn reader_take<R>(reader: &mut R, length: usize) -> Result<Vec<u8>>
where
    R: Read,
{
    read_n(reader, length).context(ReadPduFieldSnafu { field: "Item" })
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut buf = vec![0u8; bytes_to_read];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn decode_uid(bytes: &[u8], codec: &dyn TextCodec, field: &'static str) -> Result<String> {
    let decoded = codec.decode(bytes).context(DecodeTextSnafu { field })?;
    Ok(decoded
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}
