//! Association module.
//!
//! An association is the negotiated session
//! between two DICOM application entities over TCP.
//! [`client`] establishes one as the requesting node (usually an SCU),
//! [`server`] accepts one as an acceptor (usually an SCP);
//! both yield values implementing the [`Association`] trait,
//! over which PDUs and fragmented P-Data streams are exchanged.

use std::io::{Read, Write};
use std::time::Duration;

use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::pdu::{
    read_pdu, write_pdu, AbortRQSource, AssociationRJ, Pdu, PresentationContextNegotiated,
    PresentationContextResultReason, PDataValueType, PDU_HEADER_SIZE, TRANSMIT_MAX_PDU,
};

pub mod client;
pub mod machine;
pub mod pdata;
pub mod server;
pub(crate) mod uid;

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use pdata::{MessageAssembler, PDataWriter};
pub use server::{ServerAssociation, ServerAssociationOptions};

/// The transfer syntaxes this implementation negotiates natively,
/// in order of preference.
pub(crate) const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
pub(crate) const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// The application context name of the DICOM application context.
pub(crate) const DICOM_APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// at least one abstract syntax is required to negotiate an association
    MissingAbstractSyntax { backtrace: Backtrace },

    /// could not connect to the peer node
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not set the read timeout on the socket
    SetReadTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not set the write timeout on the socket
    SetWriteTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not encode the outgoing PDU
    EncodePdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// could not send the PDU to the peer
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not receive a PDU from the peer
    ReceivePdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// the connection was closed before a PDU arrived
    ConnectionClosed { backtrace: Backtrace },

    #[snafu(display(
        "association rejected by the peer ({:?}, {:?})",
        association_rj.result,
        association_rj.source
    ))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// the association was aborted
    Aborted { backtrace: Backtrace },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    /// the peer accepted none of the proposed presentation contexts
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("unexpected PDU {} from the peer", pdu.short_description()))]
    UnexpectedPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    #[snafu(display(
        "PDU is too large to send: {} bytes, the peer admits {}",
        length,
        maximum
    ))]
    SendTooLongPdu {
        length: usize,
        maximum: u32,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Timeouts applied to the underlying TCP socket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// deadline for each read operation
    pub read_timeout: Option<Duration>,
    /// deadline for each write operation
    pub write_timeout: Option<Duration>,
    /// deadline for establishing the TCP connection (client only)
    pub connection_timeout: Option<Duration>,
}

/// Common interface of an established association,
/// from either side of the negotiation.
pub trait Association {
    /// The underlying byte stream type.
    type Stream: Read + Write;

    /// Obtain a view of all negotiated presentation contexts,
    /// accepted or not.
    fn presentation_contexts(&self) -> &[PresentationContextNegotiated];

    /// Obtain the application entity title of the peer node.
    fn peer_ae_title(&self) -> &str;

    /// The maximum PDU length announced by the peer.
    fn peer_max_pdu_length(&self) -> u32;

    /// The maximum PDU length this node is willing to receive.
    fn local_max_pdu_length(&self) -> u32;

    /// Send a single PDU to the peer.
    fn send(&mut self, pdu: &Pdu) -> Result<()>;

    /// Receive a single PDU from the peer.
    fn receive(&mut self) -> Result<Pdu>;

    /// Access the underlying byte stream.
    fn inner_stream(&mut self) -> &mut Self::Stream;

    /// Shut down the underlying transport.
    fn close(&mut self) -> std::io::Result<()>;

    /// The transfer syntax accepted for the given presentation context,
    /// if that context was accepted.
    fn transfer_syntax_for(&self, presentation_context_id: u8) -> Option<&str> {
        self.presentation_contexts()
            .iter()
            .find(|pc| {
                pc.id == presentation_context_id
                    && pc.reason == PresentationContextResultReason::Acceptance
            })
            .map(|pc| pc.transfer_syntax.as_str())
    }

    /// The largest P-DATA-TF body this association may put on the wire,
    /// already clamped at the transmission ceiling.
    fn send_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length().min(TRANSMIT_MAX_PDU)
    }

    /// Obtain a fragmenting writer for one stream of one DIMSE message
    /// through the given presentation context.
    fn send_pdata(
        &mut self,
        presentation_context_id: u8,
        value_type: PDataValueType,
    ) -> PDataWriter<&mut Self::Stream> {
        let max_pdu_length = self.send_max_pdu_length();
        PDataWriter::new(
            self.inner_stream(),
            presentation_context_id,
            value_type,
            max_pdu_length,
        )
    }

    /// Abort the association:
    /// best-effort send an A-ABORT and shut the transport down.
    fn abort(&mut self) -> Result<()> {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        let out = self.send(&pdu);
        let _ = self.close();
        out
    }
}

/// Encode a PDU into the reusable write buffer
/// and put it on the wire in a single write.
///
/// `max_pdu_length` bounds the PDU body;
/// association control PDUs should pass a generous value,
/// the P-DATA clamp applies only to data transfer.
pub(crate) fn send_to_stream<W: Write>(
    stream: &mut W,
    write_buffer: &mut Vec<u8>,
    pdu: &Pdu,
    max_pdu_length: u32,
) -> Result<()> {
    write_buffer.clear();
    write_pdu(write_buffer, pdu).context(EncodePduSnafu)?;
    let maximum = max_pdu_length + PDU_HEADER_SIZE;
    snafu::ensure!(
        write_buffer.len() <= maximum as usize,
        SendTooLongPduSnafu {
            length: write_buffer.len(),
            maximum,
        }
    );
    stream.write_all(write_buffer).context(WireSendSnafu)
}

/// Read one PDU from the wire,
/// mapping a clean end of stream to [`Error::ConnectionClosed`].
pub(crate) fn receive_from_stream<R: Read>(
    stream: &mut R,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Pdu> {
    read_pdu(stream, max_pdu_length, strict)
        .context(ReceivePduSnafu)?
        .context(ConnectionClosedSnafu)
}
