//! Command set construction and inspection.
//!
//! Each request and response of the supported composite services
//! is a small struct implementing [`Command`],
//! which knows how to lay itself out
//! as a group-0000 data set.
//! Incoming command sets are wrapped in [`CommandSet`],
//! which offers typed accessors over the group-0000 attributes.

use dicom_core::header::HasLength;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use super::{CommandField, Priority, DATA_SET_ABSENT, DATA_SET_PRESENT};

/// The SOP class UID of the verification service (C-ECHO).
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum EncodeError {
    /// could not serialize the command set
    WriteCommandSet { source: dicom_object::WriteError },
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CommandSetError {
    /// could not parse the command set
    ParseCommandSet { source: dicom_object::ReadError },

    #[snafu(display("missing attribute `{}` in command set", name))]
    MissingField {
        name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid value for attribute `{}` in command set", name))]
    InvalidField {
        name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("unsupported command field {:#06x}", code))]
    UnsupportedCommand { code: u16, backtrace: Backtrace },
}

/// A DIMSE command that can lay itself out as a command set.
pub trait Command {
    /// The command field value identifying this command.
    fn command_field(&self) -> CommandField;

    /// Build the command set attributes specific to this command,
    /// without command field, data set type or group length.
    fn to_object(&self) -> InMemDicomObject;

    /// Encode the full command set in Implicit VR Little Endian,
    /// announcing whether a data set follows.
    ///
    /// The command group length is computed
    /// over the encoded remainder of the group.
    fn encode(&self, with_data_set: bool) -> Result<Vec<u8>, EncodeError> {
        let mut obj = self.to_object();
        obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            PrimitiveValue::from(self.command_field().code()),
        ));
        obj.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(if with_data_set {
                DATA_SET_PRESENT
            } else {
                DATA_SET_ABSENT
            }),
        ));

        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut body = Vec::new();
        obj.write_dataset_with_ts(&mut body, &ts)
            .context(WriteCommandSetSnafu)?;

        obj.put(DataElement::new(
            tags::COMMAND_GROUP_LENGTH,
            VR::UL,
            PrimitiveValue::from(body.len() as u32),
        ));
        let mut out = Vec::with_capacity(body.len() + 12);
        obj.write_dataset_with_ts(&mut out, &ts)
            .context(WriteCommandSetSnafu)?;
        Ok(out)
    }
}

/// C-ECHO request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEchoRq {
    pub message_id: u16,
}

impl Command for CEchoRq {
    fn command_field(&self) -> CommandField {
        CommandField::CEchoRq
    }

    fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(uid_element(tags::AFFECTED_SOP_CLASS_UID, VERIFICATION_SOP_CLASS));
        obj.put(us_element(tags::MESSAGE_ID, self.message_id));
        obj
    }
}

/// C-ECHO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEchoRsp {
    pub message_id_being_responded_to: u16,
    pub status: u16,
}

impl Command for CEchoRsp {
    fn command_field(&self) -> CommandField {
        CommandField::CEchoRsp
    }

    fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(uid_element(tags::AFFECTED_SOP_CLASS_UID, VERIFICATION_SOP_CLASS));
        obj.put(us_element(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        ));
        obj.put(us_element(tags::STATUS, self.status));
        obj
    }
}

/// C-STORE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStoreRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub priority: Priority,
}

impl Command for CStoreRq {
    fn command_field(&self) -> CommandField {
        CommandField::CStoreRq
    }

    fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(uid_element(
            tags::AFFECTED_SOP_CLASS_UID,
            &self.affected_sop_class_uid,
        ));
        obj.put(us_element(tags::MESSAGE_ID, self.message_id));
        obj.put(us_element(tags::PRIORITY, self.priority as u16));
        obj.put(uid_element(
            tags::AFFECTED_SOP_INSTANCE_UID,
            &self.affected_sop_instance_uid,
        ));
        obj
    }
}

/// C-STORE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStoreRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub status: u16,
}

impl Command for CStoreRsp {
    fn command_field(&self) -> CommandField {
        CommandField::CStoreRsp
    }

    fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(uid_element(
            tags::AFFECTED_SOP_CLASS_UID,
            &self.affected_sop_class_uid,
        ));
        obj.put(us_element(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        ));
        obj.put(us_element(tags::STATUS, self.status));
        obj.put(uid_element(
            tags::AFFECTED_SOP_INSTANCE_UID,
            &self.affected_sop_instance_uid,
        ));
        obj
    }
}

/// C-FIND request; the data set carries the query identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CFindRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: Priority,
}

impl Command for CFindRq {
    fn command_field(&self) -> CommandField {
        CommandField::CFindRq
    }

    fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(uid_element(
            tags::AFFECTED_SOP_CLASS_UID,
            &self.affected_sop_class_uid,
        ));
        obj.put(us_element(tags::MESSAGE_ID, self.message_id));
        obj.put(us_element(tags::PRIORITY, self.priority as u16));
        obj
    }
}

/// C-FIND response;
/// pending responses carry one match in the data set,
/// the final response has no data set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CFindRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub status: u16,
}

impl Command for CFindRsp {
    fn command_field(&self) -> CommandField {
        CommandField::CFindRsp
    }

    fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(uid_element(
            tags::AFFECTED_SOP_CLASS_UID,
            &self.affected_sop_class_uid,
        ));
        obj.put(us_element(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        ));
        obj.put(us_element(tags::STATUS, self.status));
        obj
    }
}

/// C-MOVE request; the data set carries the identifier to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CMoveRq {
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub priority: Priority,
    /// AE title of the destination node for the C-STORE sub-operations
    pub move_destination: String,
}

impl Command for CMoveRq {
    fn command_field(&self) -> CommandField {
        CommandField::CMoveRq
    }

    fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(uid_element(
            tags::AFFECTED_SOP_CLASS_UID,
            &self.affected_sop_class_uid,
        ));
        obj.put(us_element(tags::MESSAGE_ID, self.message_id));
        obj.put(us_element(tags::PRIORITY, self.priority as u16));
        obj.put(DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(self.move_destination.as_str()),
        ));
        obj
    }
}

/// Counters over the C-STORE sub-operations of a C-MOVE.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubOperationReport {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warnings: u16,
}

/// C-MOVE response, carrying the sub-operation counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CMoveRsp {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: String,
    pub status: u16,
    pub sub_operations: SubOperationReport,
}

impl Command for CMoveRsp {
    fn command_field(&self) -> CommandField {
        CommandField::CMoveRsp
    }

    fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(uid_element(
            tags::AFFECTED_SOP_CLASS_UID,
            &self.affected_sop_class_uid,
        ));
        obj.put(us_element(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        ));
        obj.put(us_element(tags::STATUS, self.status));
        obj.put(us_element(
            tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
            self.sub_operations.remaining,
        ));
        obj.put(us_element(
            tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            self.sub_operations.completed,
        ));
        obj.put(us_element(
            tags::NUMBER_OF_FAILED_SUBOPERATIONS,
            self.sub_operations.failed,
        ));
        obj.put(us_element(
            tags::NUMBER_OF_WARNING_SUBOPERATIONS,
            self.sub_operations.warnings,
        ));
        obj
    }
}

fn us_element<I, P>(tag: Tag, value: u16) -> DataElement<I, P>
where
    I: HasLength,
{
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

fn uid_element<I, P>(tag: Tag, value: &str) -> DataElement<I, P>
where
    I: HasLength,
{
    DataElement::new(tag, VR::UI, PrimitiveValue::from(value))
}

/// A decoded command set,
/// with typed accessors over the group-0000 attributes.
#[derive(Debug, Clone)]
pub struct CommandSet {
    obj: InMemDicomObject,
}

impl CommandSet {
    /// Parse a command set from its Implicit VR Little Endian encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, CommandSetError> {
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let obj =
            InMemDicomObject::read_dataset_with_ts(bytes, &ts).context(ParseCommandSetSnafu)?;
        Ok(CommandSet { obj })
    }

    /// The command field, which identifies the operation.
    pub fn command_field(&self) -> Result<CommandField, CommandSetError> {
        let code = self.ushort("CommandField", tags::COMMAND_FIELD)?;
        CommandField::from_code(code).context(UnsupportedCommandSnafu { code })
    }

    /// The raw command field code.
    pub fn command_field_code(&self) -> Result<u16, CommandSetError> {
        self.ushort("CommandField", tags::COMMAND_FIELD)
    }

    /// Whether the command announces a data set.
    ///
    /// Any command-data-set-type other than the null sentinel
    /// means a data set follows.
    pub fn has_data_set(&self) -> bool {
        self.ushort("CommandDataSetType", tags::COMMAND_DATA_SET_TYPE)
            .map(|value| value != DATA_SET_ABSENT)
            .unwrap_or(false)
    }

    pub fn message_id(&self) -> Result<u16, CommandSetError> {
        self.ushort("MessageID", tags::MESSAGE_ID)
    }

    pub fn message_id_being_responded_to(&self) -> Result<u16, CommandSetError> {
        self.ushort(
            "MessageIDBeingRespondedTo",
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
        )
    }

    pub fn status(&self) -> Result<u16, CommandSetError> {
        self.ushort("Status", tags::STATUS)
    }

    pub fn priority(&self) -> Option<u16> {
        self.ushort_opt(tags::PRIORITY)
    }

    pub fn affected_sop_class_uid(&self) -> Result<String, CommandSetError> {
        self.text("AffectedSOPClassUID", tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Result<String, CommandSetError> {
        self.text("AffectedSOPInstanceUID", tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn move_destination(&self) -> Result<String, CommandSetError> {
        self.text("MoveDestination", tags::MOVE_DESTINATION)
    }

    /// The C-MOVE sub-operation counters,
    /// defaulting each absent counter to zero.
    pub fn sub_operations(&self) -> SubOperationReport {
        SubOperationReport {
            remaining: self
                .ushort_opt(tags::NUMBER_OF_REMAINING_SUBOPERATIONS)
                .unwrap_or(0),
            completed: self
                .ushort_opt(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)
                .unwrap_or(0),
            failed: self
                .ushort_opt(tags::NUMBER_OF_FAILED_SUBOPERATIONS)
                .unwrap_or(0),
            warnings: self
                .ushort_opt(tags::NUMBER_OF_WARNING_SUBOPERATIONS)
                .unwrap_or(0),
        }
    }

    /// Access the underlying data set.
    pub fn as_object(&self) -> &InMemDicomObject {
        &self.obj
    }

    fn ushort(&self, name: &'static str, tag: Tag) -> Result<u16, CommandSetError> {
        let element = self.obj.element(tag).ok().context(MissingFieldSnafu { name })?;
        element
            .to_int::<u16>()
            .ok()
            .context(InvalidFieldSnafu { name })
    }

    fn ushort_opt(&self, tag: Tag) -> Option<u16> {
        self.obj
            .element(tag)
            .ok()
            .and_then(|element| element.to_int::<u16>().ok())
    }

    fn text(&self, name: &'static str, tag: Tag) -> Result<String, CommandSetError> {
        let element = self.obj.element(tag).ok().context(MissingFieldSnafu { name })?;
        let value = element.to_str().ok().context(InvalidFieldSnafu { name })?;
        Ok(value
            .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::status;

    #[test]
    fn echo_request_round_trip() {
        let bytes = CEchoRq { message_id: 1 }.encode(false).unwrap();
        let command = CommandSet::decode(&bytes).unwrap();

        assert_eq!(command.command_field().unwrap(), CommandField::CEchoRq);
        assert_eq!(command.message_id().unwrap(), 1);
        assert_eq!(
            command.affected_sop_class_uid().unwrap(),
            VERIFICATION_SOP_CLASS
        );
        assert!(!command.has_data_set());
    }

    #[test]
    fn store_request_announces_its_data_set() {
        let bytes = CStoreRq {
            message_id: 42,
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            affected_sop_instance_uid: "1.2.3.4.5.6".to_string(),
            priority: Priority::Medium,
        }
        .encode(true)
        .unwrap();
        let command = CommandSet::decode(&bytes).unwrap();

        assert_eq!(command.command_field().unwrap(), CommandField::CStoreRq);
        assert_eq!(command.message_id().unwrap(), 42);
        assert_eq!(
            command.affected_sop_class_uid().unwrap(),
            "1.2.840.10008.5.1.4.1.1.2"
        );
        assert_eq!(command.affected_sop_instance_uid().unwrap(), "1.2.3.4.5.6");
        assert_eq!(command.priority(), Some(Priority::Medium as u16));
        assert!(command.has_data_set());
    }

    #[test]
    fn group_length_matches_encoded_remainder() {
        let bytes = CEchoRsp {
            message_id_being_responded_to: 7,
            status: status::SUCCESS,
        }
        .encode(false)
        .unwrap();

        // implicit VR LE: tag (4), length (4), then the value
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[4..8], &[0x04, 0x00, 0x00, 0x00]);
        let group_length =
            u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        assert_eq!(group_length, bytes.len() - 12);
    }

    #[test]
    fn move_response_counters_default_to_zero() {
        let bytes = CFindRsp {
            message_id_being_responded_to: 9,
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.2.1.1".to_string(),
            status: status::PENDING,
        }
        .encode(true)
        .unwrap();
        let command = CommandSet::decode(&bytes).unwrap();
        assert_eq!(command.sub_operations(), SubOperationReport::default());

        let bytes = CMoveRsp {
            message_id_being_responded_to: 9,
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.2.1.2".to_string(),
            status: status::SUCCESS,
            sub_operations: SubOperationReport {
                remaining: 0,
                completed: 3,
                failed: 1,
                warnings: 0,
            },
        }
        .encode(false)
        .unwrap();
        let command = CommandSet::decode(&bytes).unwrap();
        let report = command.sub_operations();
        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 1);
    }
}
