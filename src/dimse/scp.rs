//! Service class provider front-end.
//!
//! [`DimseServer`] listens for TCP connections
//! and runs one association per connection on its own thread:
//! negotiation, then a loop of DIMSE messages
//! dispatched on the command field
//! to the [`ServiceHandler`] callbacks of the embedding application.
//!
//! Callbacks run on the thread of the association that received
//! the request; an application serving multiple associations
//! must synchronize its own state.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, error, info, warn};

use crate::association::server::{AccessControl, ServerAssociation, ServerAssociationOptions};
use crate::association::Association;
use crate::dimse::commands::{
    CEchoRsp, CFindRsp, CMoveRsp, CStoreRsp, SubOperationReport,
};
use crate::dimse::{
    read_message, status, write_message, CommandField, DecodeCommandSetSnafu, DimseMessage,
    MissingDataSetSnafu, ReadOutcome, Result, UnsupportedCommandSnafu,
};
use crate::pdu::{AssociationRJServiceUserReason, AssociationRQ, DEFAULT_MAX_PDU};

/// The callbacks through which the embedding application
/// provides the actual services.
///
/// Every method has a default:
/// associations are accepted,
/// stores fail with a processing failure status,
/// queries return no matches
/// and moves report zero sub-operations.
/// Implement the ones the application serves.
pub trait ServiceHandler {
    /// Decide whether to accept an incoming association request.
    ///
    /// Returning `false` rejects the association.
    fn on_association_request(&self, request: &AssociationRQ) -> bool {
        let _ = request;
        true
    }

    /// Handle a C-STORE request:
    /// persist the composite object and return the response status.
    fn on_c_store(&self, request: &AssociationRQ, object: &InMemDicomObject) -> u16 {
        let _ = (request, object);
        status::PROCESSING_FAILURE
    }

    /// Handle a C-FIND request:
    /// resolve the query identifier at the given level
    /// and return the matching identifiers.
    fn on_c_find(
        &self,
        request: &AssociationRQ,
        level: &str,
        query: &InMemDicomObject,
    ) -> Vec<InMemDicomObject> {
        let _ = (request, level, query);
        Vec::new()
    }

    /// Handle a C-MOVE request:
    /// perform the C-STORE sub-operations
    /// towards the application entity named by `destination_ae_title`
    /// out of band and report their counters.
    fn on_c_move(
        &self,
        request: &AssociationRQ,
        level: &str,
        destination_ae_title: &str,
        identifier: &InMemDicomObject,
    ) -> SubOperationReport {
        let _ = (request, level, destination_ae_title, identifier);
        SubOperationReport::default()
    }
}

/// Routes the association-request decision
/// of the [`ServiceHandler`] into the negotiation.
struct HandlerGate<'a, H> {
    handler: &'a H,
}

impl<H> AccessControl for HandlerGate<'_, H>
where
    H: ServiceHandler,
{
    fn check_access(
        &self,
        _this_ae_title: &str,
        request: &AssociationRQ,
    ) -> std::result::Result<(), AssociationRJServiceUserReason> {
        if self.handler.on_association_request(request) {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// A DIMSE server over TCP.
///
/// # Example
///
/// ```no_run
/// use dicom_dimse::dimse::scp::{DimseServer, ServiceHandler};
///
/// struct Echo;
/// impl ServiceHandler for Echo {}
///
/// # fn run() -> std::io::Result<()> {
/// DimseServer::new(Echo)
///     .ae_title("ECHO-SCP")
///     .port(11112)
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .run()
/// # }
/// ```
#[derive(Debug)]
pub struct DimseServer<H> {
    handler: Arc<H>,
    ae_title: String,
    port: u16,
    max_pdu_length: u32,
    timeout: Option<Duration>,
    /// abstract syntaxes to serve;
    /// when empty, any abstract syntax is accepted
    abstract_syntax_uids: Vec<String>,
    implementation_class_uid: String,
    implementation_version_name: String,
}

impl<H> Clone for DimseServer<H> {
    fn clone(&self) -> Self {
        DimseServer {
            handler: Arc::clone(&self.handler),
            ae_title: self.ae_title.clone(),
            port: self.port,
            max_pdu_length: self.max_pdu_length,
            timeout: self.timeout,
            abstract_syntax_uids: self.abstract_syntax_uids.clone(),
            implementation_class_uid: self.implementation_class_uid.clone(),
            implementation_version_name: self.implementation_version_name.clone(),
        }
    }
}

impl<H> DimseServer<H>
where
    H: ServiceHandler,
{
    /// Create a server over the given service handler.
    pub fn new(handler: H) -> Self {
        DimseServer {
            handler: Arc::new(handler),
            ae_title: "THIS-SCP".to_string(),
            port: 11111,
            max_pdu_length: DEFAULT_MAX_PDU,
            timeout: None,
            abstract_syntax_uids: Vec::new(),
            implementation_class_uid: crate::IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: crate::IMPLEMENTATION_VERSION_NAME.to_string(),
        }
    }

    /// Define the application entity title of this node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.ae_title = ae_title.into();
        self
    }

    /// Define the TCP port to listen on.
    ///
    /// The default is 11111.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the transport deadline
    /// applied to each read and write on every association.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the maximum PDU length to announce.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Serve one more abstract syntax.
    ///
    /// When none is registered,
    /// presentation contexts of any abstract syntax are accepted.
    pub fn with_abstract_syntax(mut self, abstract_syntax_uid: impl Into<String>) -> Self {
        self.abstract_syntax_uids.push(abstract_syntax_uid.into());
        self
    }

    /// Override the implementation class UID
    /// announced in the user information.
    pub fn implementation_class_uid(mut self, uid: impl Into<String>) -> Self {
        self.implementation_class_uid = uid.into();
        self
    }

    /// Override the implementation version name
    /// announced in the user information.
    pub fn implementation_version_name(mut self, name: impl Into<String>) -> Self {
        self.implementation_version_name = name.into();
        self
    }

    /// Bind the listener and serve connections until the process ends,
    /// one thread per association.
    pub fn run(&self) -> std::io::Result<()>
    where
        H: Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        info!("{} listening on port {}", self.ae_title, self.port);

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    thread::spawn(move || {
                        let peer = stream
                            .peer_addr()
                            .map(|addr| addr.to_string())
                            .unwrap_or_default();
                        debug!("new connection from {}", peer);
                        if let Err(e) = server.serve_connection(stream) {
                            warn!(
                                "connection with {} ended with an error: {}",
                                peer,
                                snafu::Report::from_error(e)
                            );
                        }
                    });
                }
                Err(e) => error!("could not accept connection: {}", e),
            }
        }
        Ok(())
    }

    /// Serve a single already-accepted connection to completion:
    /// negotiate the association
    /// and dispatch DIMSE messages until the peer releases.
    pub fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        let gate = HandlerGate {
            handler: &*self.handler,
        };
        let mut options = ServerAssociationOptions::new()
            .ae_access_control(gate)
            .ae_title(self.ae_title.clone())
            .max_pdu_length(self.max_pdu_length)
            .implementation_class_uid(self.implementation_class_uid.clone())
            .implementation_version_name(self.implementation_version_name.clone());
        if let Some(timeout) = self.timeout {
            options = options.read_timeout(timeout).write_timeout(timeout);
        }
        if self.abstract_syntax_uids.is_empty() {
            options = options.promiscuous(true);
        }
        for uid in &self.abstract_syntax_uids {
            options = options.with_abstract_syntax(uid.clone());
        }

        let mut association = options
            .establish(stream)
            .context(crate::dimse::AssociationSnafu)?;
        let request = association.request().clone();

        loop {
            match read_message(&mut association) {
                Ok(ReadOutcome::Released) => {
                    info!("association released by {}", request.calling_ae_title);
                    break;
                }
                Ok(ReadOutcome::Message(message)) => {
                    if let Err(e) = self.dispatch(&mut association, &request, message) {
                        let _ = association.abort();
                        return Err(e);
                    }
                }
                Err(e) => {
                    let _ = association.abort();
                    return Err(e);
                }
            }
        }
        let _ = association.close();
        Ok(())
    }

    fn dispatch(
        &self,
        association: &mut ServerAssociation,
        request: &AssociationRQ,
        message: DimseMessage,
    ) -> Result<()> {
        let code = message
            .command
            .command_field_code()
            .context(DecodeCommandSetSnafu)?;
        let Some(field) = CommandField::from_code(code) else {
            return UnsupportedCommandSnafu { code }.fail();
        };
        let presentation_context_id = message.presentation_context_id;

        match field {
            CommandField::CEchoRq => {
                let message_id = message.command.message_id().context(DecodeCommandSetSnafu)?;
                debug!(
                    "C-ECHO from {} (message id {})",
                    request.calling_ae_title, message_id
                );
                write_message(
                    association,
                    presentation_context_id,
                    &CEchoRsp {
                        message_id_being_responded_to: message_id,
                        status: status::SUCCESS,
                    },
                    None,
                )
            }
            CommandField::CStoreRq => {
                let object = message.data.as_ref().context(MissingDataSetSnafu)?;
                let status_code = self.handler.on_c_store(request, object);
                let response = CStoreRsp {
                    message_id_being_responded_to: message
                        .command
                        .message_id()
                        .context(DecodeCommandSetSnafu)?,
                    affected_sop_class_uid: message
                        .command
                        .affected_sop_class_uid()
                        .context(DecodeCommandSetSnafu)?,
                    affected_sop_instance_uid: message
                        .command
                        .affected_sop_instance_uid()
                        .context(DecodeCommandSetSnafu)?,
                    status: status_code,
                };
                info!(
                    "C-STORE of {} from {}: status {:#06x}",
                    response.affected_sop_instance_uid, request.calling_ae_title, status_code
                );
                write_message(association, presentation_context_id, &response, None)
            }
            CommandField::CFindRq => {
                let query = message.data.as_ref().context(MissingDataSetSnafu)?;
                let level = query_level(query);
                let message_id = message.command.message_id().context(DecodeCommandSetSnafu)?;
                let sop_class_uid = message
                    .command
                    .affected_sop_class_uid()
                    .context(DecodeCommandSetSnafu)?;

                let matches = self.handler.on_c_find(request, &level, query);
                info!(
                    "C-FIND at level {:?} from {}: {} match(es)",
                    level,
                    request.calling_ae_title,
                    matches.len()
                );
                for identifier in &matches {
                    write_message(
                        association,
                        presentation_context_id,
                        &CFindRsp {
                            message_id_being_responded_to: message_id,
                            affected_sop_class_uid: sop_class_uid.clone(),
                            status: status::PENDING,
                        },
                        Some(identifier),
                    )?;
                }
                write_message(
                    association,
                    presentation_context_id,
                    &CFindRsp {
                        message_id_being_responded_to: message_id,
                        affected_sop_class_uid: sop_class_uid,
                        status: status::SUCCESS,
                    },
                    None,
                )
            }
            CommandField::CMoveRq => {
                let identifier = message.data.as_ref().context(MissingDataSetSnafu)?;
                let level = query_level(identifier);
                let destination_ae_title = message
                    .command
                    .move_destination()
                    .context(DecodeCommandSetSnafu)?;
                let report =
                    self.handler
                        .on_c_move(request, &level, &destination_ae_title, identifier);
                info!(
                    "C-MOVE at level {:?} from {} towards {}: {} completed, {} failed",
                    level,
                    request.calling_ae_title,
                    destination_ae_title,
                    report.completed,
                    report.failed
                );
                let response = CMoveRsp {
                    message_id_being_responded_to: message
                        .command
                        .message_id()
                        .context(DecodeCommandSetSnafu)?,
                    affected_sop_class_uid: message
                        .command
                        .affected_sop_class_uid()
                        .context(DecodeCommandSetSnafu)?,
                    status: status::SUCCESS,
                    sub_operations: SubOperationReport {
                        remaining: 0,
                        ..report
                    },
                };
                write_message(association, presentation_context_id, &response, None)
            }
            // responses have no business arriving at a provider
            field => UnsupportedCommandSnafu { code: field.code() }.fail(),
        }
    }
}

/// The query/retrieve level of an identifier,
/// or an empty string when absent.
fn query_level(query: &InMemDicomObject) -> String {
    query
        .element(tags::QUERY_RETRIEVE_LEVEL)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|level| level.trim().to_string())
        .unwrap_or_default()
}
