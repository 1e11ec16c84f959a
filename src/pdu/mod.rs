//! Protocol data unit module.
//!
//! This module contains the data structures for the seven PDUs
//! of the DICOM upper layer protocol,
//! plus the sub-items which the association PDUs carry.
//! The codec proper lives in the [`reader`] and [`writer`] submodules:
//! PDUs are plain values,
//! reading and writing them are free functions over byte streams.

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size,
/// used when the peer does not announce one.
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size admitted by this implementation.
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size admitted by this implementation.
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// Hard ceiling on the length of any P-DATA-TF PDU written to the wire,
/// applied at the send path regardless of what the peer announced.
pub const TRANSMIT_MAX_PDU: u32 = 16_384;

/// The length of the PDU header in bytes:
/// PDU type (1), reserved (1) and PDU length (4).
pub const PDU_HEADER_SIZE: u32 = 6;

// Item type bytes of the variable items and sub-items
// in A-ASSOCIATE-RQ and A-ASSOCIATE-AC.
pub(crate) const ITEM_APPLICATION_CONTEXT: u8 = 0x10;
pub(crate) const ITEM_PRESENTATION_CONTEXT_RQ: u8 = 0x20;
pub(crate) const ITEM_PRESENTATION_CONTEXT_AC: u8 = 0x21;
pub(crate) const ITEM_ABSTRACT_SYNTAX: u8 = 0x30;
pub(crate) const ITEM_TRANSFER_SYNTAX: u8 = 0x40;
pub(crate) const ITEM_USER_INFORMATION: u8 = 0x50;
pub(crate) const ITEM_MAXIMUM_LENGTH: u8 = 0x51;
pub(crate) const ITEM_IMPLEMENTATION_CLASS_UID: u8 = 0x52;
pub(crate) const ITEM_ASYNC_OPERATIONS_WINDOW: u8 = 0x53;
pub(crate) const ITEM_ROLE_SELECTION: u8 = 0x54;
pub(crate) const ITEM_IMPLEMENTATION_VERSION_NAME: u8 = 0x55;

/// An upper layer protocol data unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    /// A PDU of a type not recognized by this implementation,
    /// retained with its raw body
    Unknown {
        /// the PDU type byte found on the wire
        pdu_type: u8,
        /// the PDU body, unparsed
        data: Vec<u8>,
    },
    /// A-ASSOCIATE-RQ (type 0x01)
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC (type 0x02)
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ (type 0x03)
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF (type 0x04)
    PData {
        /// the presentation data values carried by this PDU
        data: Vec<PDataValue>,
    },
    /// A-RELEASE-RQ (type 0x05)
    ReleaseRQ,
    /// A-RELEASE-RP (type 0x06)
    ReleaseRP,
    /// A-ABORT (type 0x07)
    AbortRQ {
        /// the source of the abort
        source: AbortRQSource,
    },
}

impl Pdu {
    /// A short name for the PDU kind, suitable for log lines.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::Unknown { .. } => "unknown PDU",
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
        }
    }
}

/// An association request from a calling application entity.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRQ {
    /// the protocol version, which should identify version 1
    pub protocol_version: u16,
    /// the application entity title of the requesting node
    pub calling_ae_title: String,
    /// the application entity title of the destination node
    pub called_ae_title: String,
    /// the application context name proposed (a UID)
    pub application_context_name: String,
    /// the proposed presentation contexts
    pub presentation_contexts: Vec<PresentationContextProposed>,
    /// user information sub-items
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An association acknowledgement from an accepting application entity.
///
/// The AE title fields are formally reserved in the AC PDU,
/// but are sent back with the values from the request
/// and retained here for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationAC {
    /// the protocol version, which should identify version 1
    pub protocol_version: u16,
    /// the application entity title of the requesting node
    pub calling_ae_title: String,
    /// the application entity title of the destination node
    pub called_ae_title: String,
    /// the accepted application context name (a UID)
    pub application_context_name: String,
    /// the outcome of each proposed presentation context, by pc-id
    pub presentation_contexts: Vec<PresentationContextResult>,
    /// user information sub-items
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An association rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRJ {
    /// whether the rejection is permanent or transient
    pub result: AssociationRJResult,
    /// the source of the rejection, with the respective reason
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// A single proposed presentation context:
/// one abstract syntax and the transfer syntaxes
/// the requester is willing to use with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposed {
    /// the presentation context identifier (an odd integer)
    pub id: u8,
    /// the abstract syntax UID
    pub abstract_syntax: String,
    /// the proposed transfer syntax UIDs, at least one
    pub transfer_syntaxes: Vec<String>,
}

/// The acceptor's verdict on one proposed presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResult {
    /// the presentation context identifier from the proposal
    pub id: u8,
    /// acceptance or the reason for rejection
    pub reason: PresentationContextResultReason,
    /// the accepted transfer syntax UID;
    /// empty when the context was rejected
    pub transfer_syntax: String,
}

/// A fully negotiated presentation context,
/// as tracked by an established association:
/// the result correlated back to the abstract syntax it was proposed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextNegotiated {
    /// the presentation context identifier
    pub id: u8,
    /// acceptance or the reason for rejection
    pub reason: PresentationContextResultReason,
    /// the abstract syntax UID from the proposal
    pub abstract_syntax: String,
    /// the accepted transfer syntax UID;
    /// empty when the context was rejected
    pub transfer_syntax: String,
}

/// The result field of a presentation context in an A-ASSOCIATE-AC.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PresentationContextResultReason {
    /// acceptance
    Acceptance = 0,
    /// user rejection
    UserRejection = 1,
    /// provider rejection, no reason given
    NoReason = 2,
    /// abstract syntax not supported
    AbstractSyntaxNotSupported = 3,
    /// no proposed transfer syntax supported
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// The result field of an A-ASSOCIATE-RJ.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AssociationRJResult {
    /// rejected-permanent
    Permanent,
    /// rejected-transient
    Transient,
}

impl AssociationRJResult {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            AssociationRJResult::Permanent => 1,
            AssociationRJResult::Transient => 2,
        }
    }
}

/// The source of an association rejection,
/// carrying the reason given by that source.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AssociationRJSource {
    /// DICOM UL service-user
    ServiceUser(AssociationRJServiceUserReason),
    /// DICOM UL service-provider, ACSE related function
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    /// DICOM UL service-provider, presentation related function
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match source {
            1 => {
                let reason = match reason {
                    1 => AssociationRJServiceUserReason::NoReasonGiven,
                    2 => AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                    3 => AssociationRJServiceUserReason::CallingAETitleNotRecognized,
                    7 => AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                    r @ (4..=6 | 8..=10) => AssociationRJServiceUserReason::Reserved(r),
                    _ => return None,
                };
                Some(AssociationRJSource::ServiceUser(reason))
            }
            2 => {
                let reason = match reason {
                    1 => AssociationRJServiceProviderAcseReason::NoReasonGiven,
                    2 => AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
                    _ => return None,
                };
                Some(AssociationRJSource::ServiceProviderAcse(reason))
            }
            3 => {
                let reason = match reason {
                    1 => AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
                    2 => AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
                    r @ (0 | 3..=7) => AssociationRJServiceProviderPresentationReason::Reserved(r),
                    _ => return None,
                };
                Some(AssociationRJSource::ServiceProviderPresentation(reason))
            }
            _ => None,
        }
    }

    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(r) => {
                let reason = match r {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(r) => r,
                };
                (1, reason)
            }
            AssociationRJSource::ServiceProviderAcse(r) => {
                let reason = match r {
                    AssociationRJServiceProviderAcseReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => 2,
                };
                (2, reason)
            }
            AssociationRJSource::ServiceProviderPresentation(r) => {
                let reason = match r {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(r) => r,
                };
                (3, reason)
            }
        }
    }
}

/// Rejection reasons given by the service user.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AssociationRJServiceUserReason {
    /// no-reason-given
    NoReasonGiven,
    /// application-context-name-not-supported
    ApplicationContextNameNotSupported,
    /// calling-AE-title-not-recognized
    CallingAETitleNotRecognized,
    /// called-AE-title-not-recognized
    CalledAETitleNotRecognized,
    /// reserved code
    Reserved(u8),
}

/// Rejection reasons given by the service provider (ACSE).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AssociationRJServiceProviderAcseReason {
    /// no-reason-given
    NoReasonGiven,
    /// protocol-version-not-supported
    ProtocolVersionNotSupported,
}

/// Rejection reasons given by the service provider (presentation).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AssociationRJServiceProviderPresentationReason {
    /// temporary-congestion
    TemporaryCongestion,
    /// local-limit-exceeded
    LocalLimitExceeded,
    /// reserved code
    Reserved(u8),
}

/// A single presentation data value fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PDataValue {
    /// the presentation context through which this fragment travels
    pub presentation_context_id: u8,
    /// whether the fragment belongs to the command set or the data set
    pub value_type: PDataValueType,
    /// whether this is the last fragment of its stream
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// The kind of stream a presentation data value belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PDataValueType {
    /// message command information
    Command,
    /// message data set information
    Data,
}

/// The source field of an A-ABORT.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AbortRQSource {
    /// DICOM UL service-user initiated abort
    ServiceUser,
    /// reserved source code
    Reserved,
    /// DICOM UL service-provider initiated abort
    ServiceProvider(AbortRQServiceProviderReason),
}

impl AbortRQSource {
    pub fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }

    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(r) => {
                let reason = match r {
                    AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                    AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                    AbortRQServiceProviderReason::UnexpectedPdu => 2,
                    AbortRQServiceProviderReason::Reserved => 3,
                    AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                    AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                    AbortRQServiceProviderReason::InvalidPduParameter => 6,
                };
                (2, reason)
            }
        }
    }
}

/// Abort reasons given by the service provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AbortRQServiceProviderReason {
    /// reason-not-specified
    ReasonNotSpecified,
    /// unrecognized-PDU
    UnrecognizedPdu,
    /// unexpected-PDU
    UnexpectedPdu,
    /// reserved code
    Reserved,
    /// unrecognized-PDU parameter
    UnrecognizedPduParameter,
    /// unexpected-PDU parameter
    UnexpectedPduParameter,
    /// invalid-PDU-parameter value
    InvalidPduParameter,
}

/// A top-level variable item of an association PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum PduVariableItem {
    /// application context item (0x10)
    ApplicationContext(String),
    /// proposed presentation context item (0x20)
    PresentationContextProposed(PresentationContextProposed),
    /// presentation context result item (0x21)
    PresentationContextResult(PresentationContextResult),
    /// user information item (0x50)
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserVariableItem {
    /// maximum length sub-item (0x51):
    /// the largest P-DATA-TF body the emitter is willing to receive
    MaxLength(u32),
    /// implementation class UID sub-item (0x52)
    ImplementationClassUID(String),
    /// implementation version name sub-item (0x55)
    ImplementationVersionName(String),
    /// asynchronous operations window sub-item (0x53)
    AsyncOperationsWindow {
        /// maximum number of outstanding operations invoked
        max_operations_invoked: u16,
        /// maximum number of outstanding operations performed
        max_operations_performed: u16,
    },
    /// SCP/SCU role selection sub-item (0x54)
    RoleSelection {
        /// the SOP class the role selection applies to
        sop_class_uid: String,
        /// whether the emitter proposes to act as an SCU
        scu_role: bool,
        /// whether the emitter proposes to act as an SCP
        scp_role: bool,
    },
    /// a sub-item not interpreted by this implementation,
    /// kept verbatim so that it survives a round-trip
    Unknown(u8, Vec<u8>),
}
