//! End-to-end SCU/SCP scenarios over localhost TCP,
//! one thread per side.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_dimse::association::server::ServerAssociationOptions;
use dicom_dimse::association::{Association, Error as AssociationError};
use dicom_dimse::dimse::commands::SubOperationReport;
use dicom_dimse::dimse::{scu, status, DimseServer, ServiceHandler};
use dicom_dimse::pdu::{
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, Pdu,
};
use dicom_dimse::ClientAssociationOptions;
use dicom_object::InMemDicomObject;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static JPEG_2000: &str = "1.2.840.10008.1.2.4.90";
static VERIFICATION: &str = "1.2.840.10008.1.1";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static PATIENT_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
static PATIENT_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";

/// Spawn a server that serves exactly one connection
/// through the DIMSE dispatcher.
fn spawn_scp<H>(server: DimseServer<H>) -> Result<(JoinHandle<dicom_dimse::dimse::Result<()>>, SocketAddr)>
where
    H: ServiceHandler + Send + Sync + 'static,
{
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let handle = std::thread::spawn(move || {
        let (stream, _addr) = listener.accept().expect("could not accept connection");
        server.serve_connection(stream)
    });
    Ok((handle, addr))
}

struct EchoOnly;
impl ServiceHandler for EchoOnly {}

#[test]
fn c_echo_happy_path() -> Result<()> {
    let scp = DimseServer::new(EchoOnly)
        .ae_title("ECHO-SCP")
        .with_abstract_syntax(VERIFICATION);
    let (handle, addr) = spawn_scp(scp)?;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("ECHO-SCP")
        .with_abstract_syntax(VERIFICATION)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .establish(addr)?;

    assert_eq!(association.presentation_context_id(), 1);
    assert_eq!(
        association.transfer_syntax_for(1),
        Some(IMPLICIT_VR_LE)
    );

    let status = scu::echo(&mut association, 1)?;
    assert_eq!(status, status::SUCCESS);

    association.release()?;
    handle.join().unwrap()?;
    Ok(())
}

struct RefuseEverything;
impl ServiceHandler for RefuseEverything {
    fn on_association_request(&self, _request: &AssociationRQ) -> bool {
        false
    }
}

#[test]
fn rejected_association_is_reported() -> Result<()> {
    let scp = DimseServer::new(RefuseEverything).with_abstract_syntax(VERIFICATION);
    let (handle, addr) = spawn_scp(scp)?;

    let outcome = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION)
        .establish(addr);

    match outcome {
        Err(AssociationError::Rejected { association_rj, .. }) => {
            // result 1 (permanent), source 1 (service user), reason 7
            assert_eq!(association_rj.result, AssociationRJResult::Permanent);
            assert_eq!(
                association_rj.source,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized
                )
            );
        }
        Ok(_) => panic!("association should have been rejected"),
        Err(e) => panic!("unexpected error: {:?}", e),
    }

    // the server side surfaces the rejection as an error as well
    assert!(handle.join().unwrap().is_err());
    Ok(())
}

#[derive(Default)]
struct CaptureStore {
    seen: Arc<Mutex<Option<(String, Vec<u8>)>>>,
}

impl ServiceHandler for CaptureStore {
    fn on_c_store(&self, _request: &AssociationRQ, object: &InMemDicomObject) -> u16 {
        let instance_uid = object
            .element(tags::SOP_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches('\0')
            .to_string();
        let pixel_data = object
            .element(tags::PIXEL_DATA)
            .unwrap()
            .to_bytes()
            .unwrap()
            .to_vec();
        *self.seen.lock().unwrap() = Some((instance_uid, pixel_data));
        status::SUCCESS
    }
}

fn sample_ct_instance(pixel_data: Vec<u8>) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(CT_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from("1.2.3.4.5.6.7.8"),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from("DOE^JOHN"),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        PrimitiveValue::from(pixel_data),
    ));
    obj
}

#[test]
fn c_store_with_fragmentation() -> Result<()> {
    let handler = CaptureStore::default();
    let seen = Arc::clone(&handler.seen);
    let scp = DimseServer::new(handler)
        .ae_title("STORE-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE);
    let (handle, addr) = spawn_scp(scp)?;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .with_transfer_syntax(EXPLICIT_VR_LE)
        .establish(addr)?;

    assert_eq!(
        association.transfer_syntax_for(association.presentation_context_id()),
        Some(EXPLICIT_VR_LE)
    );

    // a payload well above the maximum PDU length forces fragmentation
    let pixel_data: Vec<u8> = (0..40 * 1024).map(|i| (i % 251) as u8).collect();
    let object = sample_ct_instance(pixel_data.clone());

    let status = scu::store(&mut association, 1, &object)?;
    assert_eq!(status, status::SUCCESS);

    association.release()?;
    handle.join().unwrap()?;

    let stored = seen.lock().unwrap().take().expect("nothing was stored");
    assert_eq!(stored.0, "1.2.3.4.5.6.7.8");
    assert_eq!(stored.1, pixel_data);
    Ok(())
}

#[test]
fn no_common_transfer_syntax_rejects_the_association() -> Result<()> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let handle = std::thread::spawn(move || {
        let scp = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let (stream, _addr) = listener.accept().expect("could not accept connection");
        scp.establish(stream)
    });

    let outcome = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION)
        .with_transfer_syntax(JPEG_2000)
        .establish(addr);

    assert!(matches!(
        outcome,
        Err(AssociationError::Rejected { .. })
    ));
    assert!(matches!(
        handle.join().unwrap(),
        Err(AssociationError::NoAcceptedPresentationContexts { .. })
    ));
    Ok(())
}

struct OnePatient {
    observed_level: Arc<Mutex<Option<String>>>,
}

impl ServiceHandler for OnePatient {
    fn on_c_find(
        &self,
        _request: &AssociationRQ,
        level: &str,
        query: &InMemDicomObject,
    ) -> Vec<InMemDicomObject> {
        *self.observed_level.lock().unwrap() = Some(level.to_string());

        let wanted = query
            .element(tags::PATIENT_NAME)
            .ok()
            .and_then(|e| e.to_str().ok())
            .unwrap_or_default()
            .trim()
            .to_string();

        let mut identifier = InMemDicomObject::new_empty();
        identifier.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("PATIENT"),
        ));
        identifier.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from(wanted.as_str()),
        ));
        identifier.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from("P-000123"),
        ));
        vec![identifier]
    }
}

#[test]
fn c_find_returns_a_single_match() -> Result<()> {
    let observed_level = Arc::new(Mutex::new(None));
    let scp = DimseServer::new(OnePatient {
        observed_level: Arc::clone(&observed_level),
    })
    .ae_title("QUERY-SCP")
    .with_abstract_syntax(PATIENT_ROOT_QR_FIND);
    let (handle, addr) = spawn_scp(scp)?;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("FIND-SCU")
        .called_ae_title("QUERY-SCP")
        .with_abstract_syntax(PATIENT_ROOT_QR_FIND)
        .establish(addr)?;

    let mut query = InMemDicomObject::new_empty();
    query.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from("PATIENT"),
    ));
    query.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from("DOE^JOHN"),
    ));

    let matches = scu::find(&mut association, 1, PATIENT_ROOT_QR_FIND, &query)?;
    assert_eq!(matches.len(), 1);
    let name = matches[0]
        .element(tags::PATIENT_NAME)?
        .to_str()?
        .trim()
        .to_string();
    assert_eq!(name, "DOE^JOHN");

    association.release()?;
    handle.join().unwrap()?;

    assert_eq!(observed_level.lock().unwrap().as_deref(), Some("PATIENT"));
    Ok(())
}

struct CountingMover;
impl ServiceHandler for CountingMover {
    fn on_c_move(
        &self,
        _request: &AssociationRQ,
        level: &str,
        destination_ae_title: &str,
        _identifier: &InMemDicomObject,
    ) -> SubOperationReport {
        assert_eq!(level, "STUDY");
        assert_eq!(destination_ae_title, "OTHER-SCP");
        SubOperationReport {
            remaining: 0,
            completed: 2,
            failed: 0,
            warnings: 0,
        }
    }
}

#[test]
fn c_move_reports_sub_operations() -> Result<()> {
    let scp = DimseServer::new(CountingMover)
        .ae_title("MOVE-SCP")
        .with_abstract_syntax(PATIENT_ROOT_QR_MOVE);
    let (handle, addr) = spawn_scp(scp)?;

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("MOVE-SCU")
        .called_ae_title("MOVE-SCP")
        .with_abstract_syntax(PATIENT_ROOT_QR_MOVE)
        .establish(addr)?;

    let mut identifier = InMemDicomObject::new_empty();
    identifier.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from("STUDY"),
    ));
    identifier.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from("1.2.3.4"),
    ));

    let report = scu::move_to(&mut association, 1, PATIENT_ROOT_QR_MOVE, "OTHER-SCP", &identifier)?;
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);

    association.release()?;
    handle.join().unwrap()?;
    Ok(())
}

#[test]
fn release_during_an_operation_cancels_it() -> Result<()> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let handle = std::thread::spawn(move || -> Result<()> {
        let scp = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        // release out of turn, while the client is mid-operation
        association.send(&Pdu::ReleaseRQ)?;
        loop {
            match association.receive()? {
                Pdu::ReleaseRP => break,
                // data the client had in flight
                Pdu::PData { .. } => continue,
                pdu => panic!("unexpected PDU {:?}", pdu),
            }
        }
        let _ = association.close();
        Ok(())
    });

    let mut association = ClientAssociationOptions::new()
        .with_abstract_syntax(VERIFICATION)
        .establish(addr)?;

    let outcome = scu::echo(&mut association, 1);
    assert!(matches!(
        outcome,
        Err(dicom_dimse::dimse::Error::OperationCancelled { .. })
    ));

    handle.join().unwrap()?;
    Ok(())
}
