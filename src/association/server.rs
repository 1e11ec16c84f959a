//! Association acceptor module.
//!
//! The module provides an abstraction for negotiating an association
//! as the accepting application entity,
//! which usually takes the role of a service class provider (SCP).
//! See [`ServerAssociationOptions`] for details;
//! unlike the client options,
//! a value of this type can be reused for multiple connections.
use std::borrow::Cow;
use std::net::TcpStream;
use std::time::Duration;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, ResultExt};
use tracing::info;

use crate::association::machine::{self, Action, State};
use crate::association::uid::trim_uid;
use crate::association::{
    receive_from_stream, send_to_stream, AbortedSnafu, Association, MissingAbstractSyntaxSnafu,
    NoAcceptedPresentationContextsSnafu, RejectedSnafu, Result, SocketOptions,
    UnexpectedPduSnafu, EXPLICIT_VR_LE, IMPLICIT_VR_LE,
};
use crate::association::{Error, DICOM_APPLICATION_CONTEXT_NAME};
use crate::pdu::{
    AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason,
    AssociationRJServiceProviderAcseReason, AssociationRJSource, AssociationRQ, Pdu,
    PresentationContextNegotiated, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// Common interface for application entity access control policies.
///
/// The policy inspects the full association request,
/// so it can decide on AE titles as well as on the proposed contexts.
/// Returning an error carries the rejection reason sent to the peer.
pub trait AccessControl {
    /// Decide whether to accept an incoming association request.
    fn check_access(
        &self,
        this_ae_title: &str,
        request: &AssociationRQ,
    ) -> std::result::Result<(), AssociationRJServiceUserReason>;
}

/// An access control policy that accepts any association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _request: &AssociationRQ,
    ) -> std::result::Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control policy that accepts an association request
/// only when the called AE title matches this node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        request: &AssociationRQ,
    ) -> std::result::Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == request.called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// A DICOM association builder for an accepting node.
///
/// Transfer syntax negotiation prefers
/// _Explicit VR Little Endian_ over _Implicit VR Little Endian_;
/// other syntaxes are only accepted when registered
/// through [`with_transfer_syntax`](Self::with_transfer_syntax)
/// and supported by the transfer syntax registry.
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use dicom_dimse::association::server::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// # let listener: TcpListener = unimplemented!();
/// let scp_options = ServerAssociationOptions::new()
///     .accept_called_ae_title()
///     .ae_title("MY-STORE-SCP")
///     .with_abstract_syntax("1.2.840.10008.1.1");
///
/// let (stream, _address) = listener.accept()?;
/// scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<A> {
    /// the access control policy
    ae_access_control: A,
    /// the AE title of this node
    ae_title: Cow<'static, str>,
    /// the application context name to accept
    application_context_name: Cow<'static, str>,
    /// the abstract syntaxes this node provides
    abstract_syntax_uids: Vec<Cow<'static, str>>,
    /// additional transfer syntaxes to accept beyond the native two
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    /// the protocol version to announce and expect
    protocol_version: u16,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// whether to refuse PDUs above the announced maximum
    strict: bool,
    /// whether to accept any abstract syntax
    promiscuous: bool,
    /// timeouts for the underlying socket
    socket_options: SocketOptions,
    /// the implementation class UID announced in the user information
    implementation_class_uid: Cow<'static, str>,
    /// the implementation version name announced in the user information
    implementation_version_name: Cow<'static, str>,
}

impl Default for ServerAssociationOptions<AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            socket_options: SocketOptions::default(),
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.into(),
            implementation_version_name: IMPLEMENTATION_VERSION_NAME.into(),
        }
    }
}

impl ServerAssociationOptions<AcceptAny> {
    /// Create a new set of options for accepting associations.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<A> ServerAssociationOptions<A>
where
    A: AccessControl,
{
    /// Change the access control policy to accept any association request.
    ///
    /// This is the default behavior.
    pub fn accept_any(self) -> ServerAssociationOptions<AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association request
    /// only when the called AE title matches this node's.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_access_control: _,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            socket_options,
            implementation_class_uid,
            implementation_version_name,
        } = self;
        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            socket_options,
            implementation_class_uid,
            implementation_version_name,
        }
    }

    /// Define the application entity title of this node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Provide one more abstract syntax.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Accept this transfer syntax when proposed,
    /// in addition to the native little-endian ones.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Override the maximum PDU length to announce.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether to refuse incoming PDUs
    /// larger than the announced maximum.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Override promiscuous mode:
    /// whether to accept presentation contexts
    /// of any abstract syntax.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Set the timeout for each read on the socket.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self
    }

    /// Set the timeout for each write on the socket.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.write_timeout = Some(timeout);
        self
    }

    /// Override the implementation class UID
    /// announced in the user information.
    pub fn implementation_class_uid<T>(mut self, uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.implementation_class_uid = uid.into();
        self
    }

    /// Override the implementation version name
    /// announced in the user information.
    pub fn implementation_version_name<T>(mut self, name: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.implementation_version_name = name.into();
        self
    }

    /// Negotiate an association over the given TCP stream.
    pub fn establish(&self, mut socket: TcpStream) -> Result<ServerAssociation> {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );

        socket
            .set_read_timeout(self.socket_options.read_timeout)
            .context(crate::association::SetReadTimeoutSnafu)?;
        socket
            .set_write_timeout(self.socket_options.write_timeout)
            .context(crate::association::SetWriteTimeoutSnafu)?;

        let mut write_buffer = Vec::with_capacity(self.max_pdu_length as usize);

        let pdu = receive_from_stream(&mut socket, self.max_pdu_length, self.strict)?;
        let transition = machine::next(State::AwaitingRq, &pdu);
        let request = match transition.action {
            Action::Deliver => match pdu {
                Pdu::AssociationRQ(request) => request,
                Pdu::AbortRQ { .. } => return AbortedSnafu.fail(),
                pdu => return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
            },
            Action::ReplyAndFail(reply) => {
                let _ = send_to_stream(&mut socket, &mut write_buffer, &reply, MAXIMUM_PDU_SIZE);
                return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
            }
            Action::Reply(_) | Action::Fail => {
                return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
            }
        };

        match self.negotiate(request) {
            Ok((reply, negotiated)) => {
                send_to_stream(&mut socket, &mut write_buffer, &reply, MAXIMUM_PDU_SIZE)?;
                info!(
                    "association established with {} ({} presentation context(s) accepted)",
                    negotiated.request.calling_ae_title,
                    negotiated
                        .presentation_contexts
                        .iter()
                        .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                        .count(),
                );
                Ok(ServerAssociation {
                    request: negotiated.request,
                    presentation_contexts: negotiated.presentation_contexts,
                    peer_max_pdu_length: negotiated.peer_max_pdu_length,
                    local_max_pdu_length: self.max_pdu_length,
                    strict: self.strict,
                    socket,
                    write_buffer,
                })
            }
            Err((reply, err)) => {
                let _ = send_to_stream(&mut socket, &mut write_buffer, &reply, MAXIMUM_PDU_SIZE);
                Err(err)
            }
        }
    }

    /// Apply the negotiation rules to one association request,
    /// producing either the A-ASSOCIATE-AC to send back
    /// plus the negotiated session parameters,
    /// or the PDU that refuses the request plus the error to surface.
    #[allow(clippy::result_large_err)]
    fn negotiate(
        &self,
        request: AssociationRQ,
    ) -> std::result::Result<(Pdu, Negotiated), (Pdu, Error)> {
        if request.protocol_version != self.protocol_version {
            return Err(reject(AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            )));
        }

        if trim_uid(Cow::from(request.application_context_name.as_str()))
            != self.application_context_name
        {
            return Err(reject(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )));
        }

        if let Err(reason) = self
            .ae_access_control
            .check_access(&self.ae_title, &request)
        {
            return Err(reject(AssociationRJSource::ServiceUser(reason)));
        }

        let peer_max_pdu_length = request
            .user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::MaxLength(len) => Some(*len),
                _ => None,
            })
            .unwrap_or(DEFAULT_MAX_PDU);
        // 0 means the peer imposes no maximum
        let peer_max_pdu_length = if peer_max_pdu_length == 0 {
            u32::MAX
        } else {
            peer_max_pdu_length
        };

        let presentation_contexts: Vec<_> = request
            .presentation_contexts
            .iter()
            .map(|pc| {
                let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax.as_str()));
                if !self.promiscuous
                    && !self
                        .abstract_syntax_uids
                        .iter()
                        .any(|uid| uid.as_ref() == abstract_syntax.as_ref())
                {
                    return PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                        abstract_syntax: abstract_syntax.to_string(),
                        transfer_syntax: String::new(),
                    };
                }

                match self.choose_transfer_syntax(&pc.transfer_syntaxes) {
                    Some(transfer_syntax) => PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::Acceptance,
                        abstract_syntax: abstract_syntax.to_string(),
                        transfer_syntax,
                    },
                    None => PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                        abstract_syntax: abstract_syntax.to_string(),
                        transfer_syntax: String::new(),
                    },
                }
            })
            .collect();

        if !presentation_contexts
            .iter()
            .any(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        {
            let association_rj = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::NoReasonGiven,
                ),
            };
            return Err((
                Pdu::AssociationRJ(association_rj),
                NoAcceptedPresentationContextsSnafu.build(),
            ));
        }

        let reply = Pdu::AssociationAC(AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: request.calling_ae_title.clone(),
            called_ae_title: request.called_ae_title.clone(),
            application_context_name: request.application_context_name.clone(),
            presentation_contexts: presentation_contexts
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: pc.reason,
                    transfer_syntax: pc.transfer_syntax.clone(),
                })
                .collect(),
            // the user information is overridden with this node's identity
            user_variables: vec![
                UserVariableItem::MaxLength(self.max_pdu_length),
                UserVariableItem::ImplementationClassUID(
                    self.implementation_class_uid.to_string(),
                ),
                UserVariableItem::ImplementationVersionName(
                    self.implementation_version_name.to_string(),
                ),
            ],
        });

        Ok((
            reply,
            Negotiated {
                request,
                presentation_contexts,
                peer_max_pdu_length,
            },
        ))
    }

    /// Pick a transfer syntax from a proposal:
    /// Explicit VR LE wins over Implicit VR LE,
    /// which wins over any explicitly registered syntax
    /// that the transfer syntax registry can decode.
    fn choose_transfer_syntax(&self, proposed: &[String]) -> Option<String> {
        let native = [EXPLICIT_VR_LE, IMPLICIT_VR_LE];
        let extras = self
            .transfer_syntax_uids
            .iter()
            .map(|uid| uid.as_ref())
            .filter(|uid| is_supported(uid));

        for wanted in native.into_iter().chain(extras) {
            if proposed
                .iter()
                .any(|ts| trim_uid(Cow::from(ts.as_str())) == wanted)
            {
                return Some(wanted.to_string());
            }
        }
        None
    }
}

fn reject(source: AssociationRJSource) -> (Pdu, Error) {
    let association_rj = AssociationRJ {
        result: AssociationRJResult::Permanent,
        source,
    };
    (
        Pdu::AssociationRJ(association_rj.clone()),
        RejectedSnafu { association_rj }.build(),
    )
}

/// Parameters settled by a successful negotiation.
struct Negotiated {
    request: AssociationRQ,
    presentation_contexts: Vec<PresentationContextNegotiated>,
    peer_max_pdu_length: u32,
}

/// A DICOM upper level association
/// from the perspective of the accepting application entity.
///
/// When the value falls out of scope,
/// the underlying TCP connection is shut down.
#[derive(Debug)]
pub struct ServerAssociation {
    /// the association request this session was negotiated from
    request: AssociationRQ,
    /// the outcome of every proposed presentation context
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the maximum PDU length the peer admits
    peer_max_pdu_length: u32,
    /// the maximum PDU length this node admits
    local_max_pdu_length: u32,
    /// whether to refuse incoming PDUs above the announced maximum
    strict: bool,
    /// the TCP stream to the peer node
    socket: TcpStream,
    /// reusable buffer so each PDU reaches the wire in one write
    write_buffer: Vec<u8>,
}

impl ServerAssociation {
    /// The association request this session was negotiated from.
    pub fn request(&self) -> &AssociationRQ {
        &self.request
    }

    /// The user information sub-items announced by the peer.
    pub fn user_variables(&self) -> &[UserVariableItem] {
        &self.request.user_variables
    }
}

impl Association for ServerAssociation {
    type Stream = TcpStream;

    fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    fn peer_ae_title(&self) -> &str {
        &self.request.calling_ae_title
    }

    fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    fn local_max_pdu_length(&self) -> u32 {
        self.local_max_pdu_length
    }

    fn send(&mut self, pdu: &Pdu) -> Result<()> {
        let limit = match pdu {
            Pdu::PData { .. } => self.send_max_pdu_length(),
            _ => MAXIMUM_PDU_SIZE,
        };
        send_to_stream(&mut self.socket, &mut self.write_buffer, pdu, limit)
    }

    fn receive(&mut self) -> Result<Pdu> {
        receive_from_stream(&mut self.socket, self.local_max_pdu_length, self.strict)
    }

    fn inner_stream(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.socket.shutdown(std::net::Shutdown::Both)
    }
}

/// Check that a transfer syntax repository supports the given
/// transfer syntax, meaning that it can decode its data sets.
///
/// ```
/// # use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
/// # use dicom_dimse::association::server::is_supported_with_repo;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported_with_repo(TransferSyntaxRegistry, "1.2.840.10008.1.2"));
/// ```
pub fn is_supported_with_repo<R>(ts_repo: R, ts_uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    ts_repo
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// Check that the main transfer syntax registry supports the given
/// transfer syntax, meaning that it can decode its data sets.
///
/// ```
/// # use dicom_dimse::association::server::is_supported;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(ts_uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, ts_uid)
}
