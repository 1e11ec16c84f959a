//! Association requester module.
//!
//! The module provides an abstraction for establishing an association
//! with another DICOM node as the requesting application entity,
//! which usually takes the role of a service class user (SCU).
//! See [`ClientAssociationOptions`] for details.
use std::borrow::Cow;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};

use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::address::FullAeAddr;
use crate::association::machine::{self, Action, State};
use crate::association::uid::trim_uid;
use crate::association::{
    receive_from_stream, send_to_stream, AbortedSnafu, Association, ConnectSnafu,
    MissingAbstractSyntaxSnafu, NoAcceptedPresentationContextsSnafu,
    ProtocolVersionMismatchSnafu, RejectedSnafu, Result, SocketOptions, UnexpectedPduSnafu,
    DICOM_APPLICATION_CONTEXT_NAME, EXPLICIT_VR_LE, IMPLICIT_VR_LE,
};
use crate::pdu::{
    AssociationAC, AssociationRQ, Pdu, PresentationContextNegotiated,
    PresentationContextProposed, PresentationContextResultReason, UserVariableItem,
    DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// A DICOM association builder for a requesting node.
/// The outcome of a successful negotiation is a [`ClientAssociation`].
///
/// # Example
///
/// ```no_run
/// # use dicom_dimse::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut association = ClientAssociationOptions::new()
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .calling_ae_title("ECHO-SCU")
///     .establish_with("MAIN-STORAGE@10.0.0.100:104")?;
/// # Ok(())
/// # }
/// ```
///
/// When no transfer syntax is added explicitly,
/// each presentation context proposes
/// _Explicit VR Little Endian_ and _Implicit VR Little Endian_,
/// in that order of preference.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    /// the AE title of this node
    calling_ae_title: Cow<'static, str>,
    /// the AE title of the peer node
    called_ae_title: Cow<'static, str>,
    /// the application context name to propose
    application_context_name: Cow<'static, str>,
    /// the abstract syntaxes, one proposed presentation context each
    abstract_syntax_uids: Vec<Cow<'static, str>>,
    /// the transfer syntaxes proposed in every presentation context
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    /// the protocol version to announce and expect
    protocol_version: u16,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// whether to refuse PDUs above the announced maximum
    strict: bool,
    /// timeouts for the underlying socket
    socket_options: SocketOptions,
    /// the implementation class UID announced in the user information
    implementation_class_uid: Cow<'static, str>,
    /// the implementation version name announced in the user information
    implementation_version_name: Cow<'static, str>,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            socket_options: SocketOptions::default(),
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.into(),
            implementation_version_name: IMPLEMENTATION_VERSION_NAME.into(),
        }
    }
}

impl ClientAssociationOptions {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title,
    /// which refers to this node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title,
    /// which refers to the target node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose one more presentation context with this abstract syntax.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Propose this transfer syntax in every presentation context.
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

    /// Set the timeout for each read and write on the socket.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self.socket_options.write_timeout = Some(timeout);
        self
    }

    /// Set the timeout for establishing the TCP connection.
    pub fn connection_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.connection_timeout = Some(timeout);
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

    /// Initiate the TCP connection and negotiate the association
    /// with the node at the given socket address.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation> {
        self.establish_impl(address)
    }

    /// Like [`establish`](Self::establish),
    /// but accepting a full AE address (`AET@host:port`),
    /// in which case the AE title part overrides the called AE title.
    /// A plain socket address is also accepted.
    pub fn establish_with(self, ae_address: &str) -> Result<ClientAssociation> {
        match ae_address.parse::<FullAeAddr>() {
            Ok(addr) => {
                let called = addr.ae_title().to_string();
                self.called_ae_title(called)
                    .establish_impl(addr.socket_addr())
            }
            Err(_) => self.establish_impl(ae_address),
        }
    }

    fn establish_impl<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation> {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            abstract_syntax_uids,
            mut transfer_syntax_uids,
            protocol_version,
            max_pdu_length,
            strict,
            socket_options,
            implementation_class_uid,
            implementation_version_name,
        } = self;

        // abstract syntaxes represent intent, they cannot be defaulted
        ensure!(!abstract_syntax_uids.is_empty(), MissingAbstractSyntaxSnafu);

        if transfer_syntax_uids.is_empty() {
            transfer_syntax_uids.push(EXPLICIT_VR_LE.into());
            transfer_syntax_uids.push(IMPLICIT_VR_LE.into());
        }

        // presentation context identifiers are odd integers
        let presentation_contexts: Vec<_> = abstract_syntax_uids
            .into_iter()
            .enumerate()
            .map(|(i, abstract_syntax)| PresentationContextProposed {
                id: (i as u8) * 2 + 1,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntax_uids
                    .iter()
                    .map(|uid| uid.to_string())
                    .collect(),
            })
            .collect();

        let msg = Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts: presentation_contexts.clone(),
            user_variables: vec![
                UserVariableItem::MaxLength(max_pdu_length),
                UserVariableItem::ImplementationClassUID(implementation_class_uid.to_string()),
                UserVariableItem::ImplementationVersionName(
                    implementation_version_name.to_string(),
                ),
            ],
        });

        let mut socket = connect(address, &socket_options)?;
        socket
            .set_read_timeout(socket_options.read_timeout)
            .context(crate::association::SetReadTimeoutSnafu)?;
        socket
            .set_write_timeout(socket_options.write_timeout)
            .context(crate::association::SetWriteTimeoutSnafu)?;

        let mut write_buffer = Vec::with_capacity(max_pdu_length as usize);
        send_to_stream(&mut socket, &mut write_buffer, &msg, MAXIMUM_PDU_SIZE)?;

        let pdu = receive_from_stream(&mut socket, max_pdu_length, strict)?;
        let transition = machine::next(State::AwaitingAc, &pdu);
        let ac = match (transition.state, transition.action) {
            (State::Established, Action::Deliver) => match pdu {
                Pdu::AssociationAC(ac) => ac,
                pdu => return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
            },
            (State::Closed, Action::Deliver) => {
                return match pdu {
                    Pdu::AssociationRJ(association_rj) => {
                        RejectedSnafu { association_rj }.fail()
                    }
                    pdu => UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
                };
            }
            (State::Aborted, _) => return AbortedSnafu.fail(),
            _ => return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
        };

        let AssociationAC {
            protocol_version: protocol_version_scp,
            presentation_contexts: presentation_context_results,
            user_variables,
            calling_ae_title: _,
            called_ae_title: ac_called_ae_title,
            application_context_name: _,
        } = ac;

        ensure!(
            protocol_version == protocol_version_scp,
            ProtocolVersionMismatchSnafu {
                expected: protocol_version,
                got: protocol_version_scp,
            }
        );

        // correlate each result with the abstract syntax it was proposed for
        let mut negotiated = Vec::with_capacity(presentation_context_results.len());
        for result in presentation_context_results {
            match presentation_contexts.iter().find(|pc| pc.id == result.id) {
                Some(proposed) => negotiated.push(PresentationContextNegotiated {
                    id: result.id,
                    reason: result.reason,
                    abstract_syntax: proposed.abstract_syntax.clone(),
                    transfer_syntax: result.transfer_syntax,
                }),
                None => {
                    warn!(
                        "ignoring presentation context result for unproposed id {}",
                        result.id
                    );
                }
            }
        }

        let selected_presentation_context_id = select_default_context(&negotiated)
            .context(NoAcceptedPresentationContextsSnafu)?;

        let peer_max_pdu_length = user_variables
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

        debug!(
            "association established with {}: {} presentation context(s) accepted",
            ac_called_ae_title,
            negotiated
                .iter()
                .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                .count()
        );

        Ok(ClientAssociation {
            presentation_contexts: negotiated,
            selected_presentation_context_id,
            peer_ae_title: ac_called_ae_title,
            peer_max_pdu_length,
            local_max_pdu_length: max_pdu_length,
            strict,
            socket,
            write_buffer,
            closed: false,
        })
    }
}

fn connect<A: ToSocketAddrs>(address: A, options: &SocketOptions) -> Result<TcpStream> {
    match options.connection_timeout {
        None => TcpStream::connect(address).context(ConnectSnafu),
        Some(timeout) => {
            let addresses = address.to_socket_addrs().context(ConnectSnafu)?;
            let mut last_error = std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "could not resolve any socket address",
            );
            for addr in addresses {
                match TcpStream::connect_timeout(&addr, timeout) {
                    Ok(socket) => return Ok(socket),
                    Err(e) => last_error = e,
                }
            }
            Err(last_error).context(ConnectSnafu)
        }
    }
}

/// Pick the default presentation context for sending:
/// the first accepted with Explicit VR LE,
/// then the first with Implicit VR LE,
/// then any accepted context.
fn select_default_context(contexts: &[PresentationContextNegotiated]) -> Option<u8> {
    let accepted = |pc: &&PresentationContextNegotiated| {
        pc.reason == PresentationContextResultReason::Acceptance
    };
    contexts
        .iter()
        .filter(accepted)
        .find(|pc| pc.transfer_syntax == EXPLICIT_VR_LE)
        .or_else(|| {
            contexts
                .iter()
                .filter(accepted)
                .find(|pc| pc.transfer_syntax == IMPLICIT_VR_LE)
        })
        .or_else(|| contexts.iter().find(accepted))
        .map(|pc| pc.id)
}

/// A DICOM upper level association
/// from the perspective of the requesting application entity.
///
/// When the value falls out of scope without an explicit release,
/// a release is attempted
/// and the underlying TCP connection is shut down.
#[derive(Debug)]
pub struct ClientAssociation {
    /// the outcome of every proposed presentation context
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the default presentation context for outgoing messages
    selected_presentation_context_id: u8,
    /// the AE title of the peer node
    peer_ae_title: String,
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
    /// whether the transport has already been shut down
    closed: bool,
}

impl ClientAssociation {
    /// The identifier of the default presentation context for sending.
    pub fn presentation_context_id(&self) -> u8 {
        self.selected_presentation_context_id
    }

    /// Gracefully release the association.
    pub fn release(&mut self) -> Result<()> {
        let out = self.release_impl();
        let _ = self.close();
        out
    }

    fn release_impl(&mut self) -> Result<()> {
        self.send(&Pdu::ReleaseRQ)?;
        let mut state = State::Releasing;
        loop {
            let pdu = self.receive()?;
            let transition = machine::next(state, &pdu);
            match transition.action {
                Action::Deliver => match transition.state {
                    State::Closed => return Ok(()),
                    State::Aborted => return AbortedSnafu.fail(),
                    // data still in flight from the peer; drop it
                    _ => state = transition.state,
                },
                Action::Reply(reply) => {
                    self.send(&reply)?;
                    if transition.state == State::Closed {
                        return Ok(());
                    }
                    state = transition.state;
                }
                Action::ReplyAndFail(reply) => {
                    let _ = self.send(&reply);
                    return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
                }
                Action::Fail => {
                    return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
                }
            }
        }
    }
}

impl Association for ClientAssociation {
    type Stream = TcpStream;

    fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
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
            // association control PDUs are not subject to the data clamp
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
        self.closed = true;
        self.socket.flush()?;
        self.socket.shutdown(std::net::Shutdown::Both)
    }
}

impl Drop for ClientAssociation {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.release();
        }
    }
}
