//! DICOM message service element (DIMSE) module.
//!
//! This layer turns an established [association](crate::association)
//! into a transport of DIMSE messages:
//! a command set plus an optional data set,
//! fragmented into presentation data values on the wire.
//! [`commands`] builds and inspects the command sets
//! of the composite services
//! (C-ECHO, C-STORE, C-FIND and C-MOVE),
//! [`scu`] offers the client-side operations
//! and [`scp`] the server front-end with its service callbacks.
//!
//! Command sets are always encoded in Implicit VR Little Endian,
//! regardless of the negotiated transfer syntax;
//! data sets follow the transfer syntax
//! accepted for their presentation context.

use std::io::Write;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::association::machine::{self, Action, State};
use crate::association::pdata::{AssemblyError, MessageAssembler};
use crate::association::Association;
use crate::pdu::{PDataValueType, Pdu};

pub mod commands;
pub mod scp;
pub mod scu;

pub use commands::{Command, CommandSet};
pub use scp::{DimseServer, ServiceHandler};

/// The command field values of the composite services
/// supported by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
}

impl CommandField {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(CommandField::CStoreRq),
            0x8001 => Some(CommandField::CStoreRsp),
            0x0020 => Some(CommandField::CFindRq),
            0x8020 => Some(CommandField::CFindRsp),
            0x0021 => Some(CommandField::CMoveRq),
            0x8021 => Some(CommandField::CMoveRsp),
            0x0030 => Some(CommandField::CEchoRq),
            0x8030 => Some(CommandField::CEchoRsp),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

/// The priority of a composite service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Priority {
    Medium = 0x0000,
    High = 0x0001,
    Low = 0x0002,
}

/// Command-data-set-type value for a message without a data set.
pub const DATA_SET_ABSENT: u16 = 0x0101;
/// Command-data-set-type value announcing that a data set follows.
pub const DATA_SET_PRESENT: u16 = 0x0102;

/// Well-known DIMSE status codes.
pub mod status {
    /// operation completed
    pub const SUCCESS: u16 = 0x0000;
    /// one match or sub-operation delivered, more to follow
    pub const PENDING: u16 = 0xFF00;
    /// operation terminated by a cancel request
    pub const CANCEL: u16 = 0xFE00;
    /// general failure to process the operation
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    /// the operation is not recognized by this node
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// association-level failure
    Association {
        #[snafu(backtrace)]
        source: crate::association::Error,
    },

    /// the peer aborted the association
    Aborted { backtrace: Backtrace },

    /// the peer released the association during an operation
    OperationCancelled { backtrace: Backtrace },

    #[snafu(display("unexpected PDU {} during data transfer", pdu.short_description()))]
    UnexpectedPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    /// could not reassemble the DIMSE message
    Assemble {
        #[snafu(backtrace)]
        source: AssemblyError,
    },

    /// could not read the command set of the incoming message
    DecodeCommandSet {
        #[snafu(backtrace)]
        source: commands::CommandSetError,
    },

    /// could not encode the outgoing command set
    EncodeCommandSet {
        #[snafu(backtrace)]
        source: commands::EncodeError,
    },

    #[snafu(display("no presentation context with id {} was accepted", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    #[snafu(display("no accepted presentation context for SOP class {}", sop_class_uid))]
    NoPresentationContext {
        sop_class_uid: String,
        backtrace: Backtrace,
    },

    #[snafu(display("transfer syntax {} is not supported for data sets", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    /// could not decode the data set of the incoming message
    DecodeDataSet {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },

    /// could not encode the data set of the outgoing message
    EncodeDataSet {
        source: dicom_object::WriteError,
        backtrace: Backtrace,
    },

    /// could not send a message fragment
    SendFragment {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the incoming message is missing its data set
    MissingDataSet { backtrace: Backtrace },

    #[snafu(display("unsupported command field {:#06x}", code))]
    UnsupportedCommand { code: u16, backtrace: Backtrace },

    #[snafu(display(
        "unexpected command field {:?} in response to {:?}",
        got,
        expected
    ))]
    UnexpectedResponseCommand {
        expected: CommandField,
        got: CommandField,
        backtrace: Backtrace,
    },

    #[snafu(display("operation failed with status {:#06x}", code))]
    OperationFailed { code: u16, backtrace: Backtrace },

    #[snafu(display("missing attribute `{}` in data set", name))]
    MissingAttribute {
        name: &'static str,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One fully reassembled DIMSE message.
#[derive(Debug)]
pub struct DimseMessage {
    /// the presentation context that carried the message
    pub presentation_context_id: u8,
    /// the decoded command set
    pub command: CommandSet,
    /// the decoded data set, when the command announced one
    pub data: Option<InMemDicomObject>,
}

/// The outcome of waiting for a DIMSE message.
#[derive(Debug)]
pub enum ReadOutcome {
    /// a complete message arrived
    Message(DimseMessage),
    /// the peer released the association in an orderly fashion;
    /// the release has already been acknowledged
    Released,
}

/// Receive one complete DIMSE message from the association.
///
/// P-DATA-TF PDUs are consumed and reassembled
/// until the command set is complete and,
/// when the command set announces one,
/// the data set as well.
/// Upper layer control PDUs received in the meantime
/// are dispatched through the association state machine:
/// an orderly release is acknowledged
/// and surfaced as [`ReadOutcome::Released`],
/// an abort or a protocol violation becomes an error.
pub fn read_message<A: Association>(association: &mut A) -> Result<ReadOutcome> {
    let mut assembler = MessageAssembler::default();
    let mut command: Option<CommandSet> = None;

    loop {
        let pdu = association.receive().context(AssociationSnafu)?;
        let transition = machine::next(State::Established, &pdu);
        match transition.action {
            Action::Deliver => {
                let data = match pdu {
                    Pdu::PData { data } => data,
                    Pdu::AbortRQ { .. } => return AbortedSnafu.fail(),
                    pdu => return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
                };
                for pdv in &data {
                    assembler.push(pdv).context(AssembleSnafu)?;
                }

                if command.is_none() && assembler.command_complete() {
                    let bytes = assembler.take_command();
                    command =
                        Some(CommandSet::decode(bytes.as_ref()).context(DecodeCommandSetSnafu)?);
                }

                if let Some(command_set) = command.take() {
                    let presentation_context_id =
                        assembler.presentation_context_id().unwrap_or_default();
                    if !command_set.has_data_set() {
                        return Ok(ReadOutcome::Message(DimseMessage {
                            presentation_context_id,
                            command: command_set,
                            data: None,
                        }));
                    }
                    if assembler.data_complete() {
                        let data_bytes = assembler.take_data();
                        let object = decode_data_set(
                            association,
                            presentation_context_id,
                            data_bytes.as_ref(),
                        )?;
                        return Ok(ReadOutcome::Message(DimseMessage {
                            presentation_context_id,
                            command: command_set,
                            data: Some(object),
                        }));
                    }
                    // waiting on more data fragments
                    command = Some(command_set);
                }
            }
            Action::Reply(reply) => {
                association.send(&reply).context(AssociationSnafu)?;
                if transition.state == State::Closed {
                    return Ok(ReadOutcome::Released);
                }
            }
            Action::ReplyAndFail(reply) => {
                let _ = association.send(&reply);
                let _ = association.close();
                return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
            }
            Action::Fail => {
                let _ = association.close();
                return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
            }
        }
    }
}

/// Send one DIMSE message through the given presentation context:
/// the command set, then the data set when one is given.
///
/// Both parts are fragmented to the negotiated maximum PDU length
/// (clamped at the transmission ceiling),
/// the data set being serialized straight into the fragment writer
/// with the transfer syntax accepted for the presentation context.
pub fn write_message<A, C>(
    association: &mut A,
    presentation_context_id: u8,
    command: &C,
    data: Option<&InMemDicomObject>,
) -> Result<()>
where
    A: Association,
    C: Command + ?Sized,
{
    let command_bytes = command
        .encode(data.is_some())
        .context(EncodeCommandSetSnafu)?;

    {
        let mut writer = association.send_pdata(presentation_context_id, PDataValueType::Command);
        writer.write_all(&command_bytes).context(SendFragmentSnafu)?;
        writer.finish().context(SendFragmentSnafu)?;
    }

    if let Some(object) = data {
        let ts_uid = association
            .transfer_syntax_for(presentation_context_id)
            .context(UnknownPresentationContextSnafu {
                id: presentation_context_id,
            })?
            .to_string();
        let registry = TransferSyntaxRegistry;
        let ts = registry
            .get(&ts_uid)
            .filter(|ts| !ts.is_unsupported())
            .context(UnsupportedTransferSyntaxSnafu { uid: &*ts_uid })?;

        let mut writer = association.send_pdata(presentation_context_id, PDataValueType::Data);
        object
            .write_dataset_with_ts(&mut writer, ts)
            .context(EncodeDataSetSnafu)?;
        writer.finish().context(SendFragmentSnafu)?;
    }

    Ok(())
}

fn decode_data_set<A: Association>(
    association: &A,
    presentation_context_id: u8,
    bytes: &[u8],
) -> Result<InMemDicomObject> {
    let ts_uid = association
        .transfer_syntax_for(presentation_context_id)
        .context(UnknownPresentationContextSnafu {
            id: presentation_context_id,
        })?;
    let registry = TransferSyntaxRegistry;
    let ts = registry
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .context(UnsupportedTransferSyntaxSnafu { uid: ts_uid })?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts).context(DecodeDataSetSnafu)
}
