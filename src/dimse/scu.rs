//! Client-side DIMSE operations.
//!
//! These helpers drive one synchronous operation at a time
//! over an established association:
//! the request goes out,
//! responses are consumed until the operation concludes,
//! and the outcome is returned to the caller.

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use snafu::OptionExt;
use tracing::debug;

use crate::association::Association;
use crate::dimse::commands::{
    CEchoRq, CFindRq, CMoveRq, CStoreRq, SubOperationReport, VERIFICATION_SOP_CLASS,
};
use crate::dimse::{
    read_message, status, write_message, CommandField, DimseMessage, MissingAttributeSnafu,
    NoPresentationContextSnafu, OperationCancelledSnafu, OperationFailedSnafu, Priority,
    ReadOutcome, Result, UnexpectedResponseCommandSnafu,
};
use crate::pdu::PresentationContextResultReason;

/// Perform a C-ECHO (verification) round trip,
/// returning the response status.
pub fn echo<A: Association>(association: &mut A, message_id: u16) -> Result<u16> {
    let presentation_context_id =
        presentation_context_for(association, VERIFICATION_SOP_CLASS)?;
    write_message(
        association,
        presentation_context_id,
        &CEchoRq { message_id },
        None,
    )?;

    let response = expect_response(association, CommandField::CEchoRsp)?;
    response.command.status().map_err(invalid_response)
}

/// Store one composite object on the peer,
/// returning the response status.
///
/// The SOP class and instance UIDs are taken from the object itself;
/// the presentation context is selected by the SOP class.
pub fn store<A: Association>(
    association: &mut A,
    message_id: u16,
    object: &InMemDicomObject,
) -> Result<u16> {
    let sop_class_uid = text_attribute(object, "SOPClassUID", tags::SOP_CLASS_UID)?;
    let sop_instance_uid = text_attribute(object, "SOPInstanceUID", tags::SOP_INSTANCE_UID)?;
    let presentation_context_id = presentation_context_for(association, &sop_class_uid)?;

    let command = CStoreRq {
        message_id,
        affected_sop_class_uid: sop_class_uid,
        affected_sop_instance_uid: sop_instance_uid,
        priority: Priority::Medium,
    };
    write_message(association, presentation_context_id, &command, Some(object))?;

    let response = expect_response(association, CommandField::CStoreRsp)?;
    response.command.status().map_err(invalid_response)
}

/// Query the peer with a C-FIND identifier,
/// collecting every pending match until the final response.
///
/// A non-success final status surfaces as
/// [`Error::OperationFailed`](crate::dimse::Error::OperationFailed).
pub fn find<A: Association>(
    association: &mut A,
    message_id: u16,
    sop_class_uid: &str,
    query: &InMemDicomObject,
) -> Result<Vec<InMemDicomObject>> {
    let presentation_context_id = presentation_context_for(association, sop_class_uid)?;
    let command = CFindRq {
        message_id,
        affected_sop_class_uid: sop_class_uid.to_string(),
        priority: Priority::Medium,
    };
    write_message(association, presentation_context_id, &command, Some(query))?;

    let mut matches = Vec::new();
    loop {
        let response = expect_response(association, CommandField::CFindRsp)?;
        let code = response.command.status().map_err(invalid_response)?;
        match code {
            status::PENDING | 0xFF01 => {
                if let Some(data) = response.data {
                    matches.push(data);
                }
            }
            status::SUCCESS => {
                debug!("C-FIND complete: {} match(es)", matches.len());
                return Ok(matches);
            }
            code => return OperationFailedSnafu { code }.fail(),
        }
    }
}

/// Ask the peer to move an identifier to another application entity,
/// waiting through pending responses until the final one,
/// and returning the final sub-operation counters.
pub fn move_to<A: Association>(
    association: &mut A,
    message_id: u16,
    sop_class_uid: &str,
    destination_ae_title: &str,
    identifier: &InMemDicomObject,
) -> Result<SubOperationReport> {
    let presentation_context_id = presentation_context_for(association, sop_class_uid)?;
    let command = CMoveRq {
        message_id,
        affected_sop_class_uid: sop_class_uid.to_string(),
        priority: Priority::Medium,
        move_destination: destination_ae_title.to_string(),
    };
    write_message(association, presentation_context_id, &command, Some(identifier))?;

    loop {
        let response = expect_response(association, CommandField::CMoveRsp)?;
        let code = response.command.status().map_err(invalid_response)?;
        match code {
            status::PENDING | 0xFF01 => continue,
            status::SUCCESS => {
                let report = response.command.sub_operations();
                debug!(
                    "C-MOVE complete: {} sub-operation(s), {} failed",
                    report.completed, report.failed
                );
                return Ok(report);
            }
            code => return OperationFailedSnafu { code }.fail(),
        }
    }
}

/// Find the accepted presentation context proposing the given SOP class.
fn presentation_context_for<A: Association>(
    association: &A,
    abstract_syntax: &str,
) -> Result<u8> {
    association
        .presentation_contexts()
        .iter()
        .find(|pc| {
            pc.reason == PresentationContextResultReason::Acceptance
                && pc.abstract_syntax == abstract_syntax
        })
        .map(|pc| pc.id)
        .context(NoPresentationContextSnafu {
            sop_class_uid: abstract_syntax,
        })
}

/// Receive one message and check that it answers the given operation.
fn expect_response<A: Association>(
    association: &mut A,
    expected: CommandField,
) -> Result<DimseMessage> {
    let message = match read_message(association)? {
        ReadOutcome::Message(message) => message,
        // a release in the middle of an operation cancels it
        ReadOutcome::Released => return OperationCancelledSnafu.fail(),
    };
    let got = message.command.command_field().map_err(invalid_response)?;
    snafu::ensure!(
        got == expected,
        UnexpectedResponseCommandSnafu { expected, got }
    );
    Ok(message)
}

fn invalid_response(source: crate::dimse::commands::CommandSetError) -> crate::dimse::Error {
    crate::dimse::Error::DecodeCommandSet { source }
}

fn text_attribute(
    object: &InMemDicomObject,
    name: &'static str,
    tag: dicom_core::Tag,
) -> Result<String> {
    let element = object.element(tag).ok().context(MissingAttributeSnafu { name })?;
    let value = element
        .to_str()
        .ok()
        .context(MissingAttributeSnafu { name })?;
    Ok(value
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}
