//! This crate implements the DICOM upper layer protocol
//! and the DIMSE service classes layered on top of it,
//! enabling Rust applications to talk to other DICOM nodes over TCP
//! as a service class user (SCU) or provider (SCP).
//!
//! - The [`pdu`] module holds the protocol data unit types
//!   and their wire codec.
//! - The [`association`] module negotiates and drives associations
//!   between application entities,
//!   including P-Data fragmentation and reassembly.
//! - The [`dimse`] module exchanges DIMSE messages
//!   over an established association:
//!   C-ECHO, C-STORE, C-FIND and C-MOVE,
//!   with a TCP server front-end
//!   dispatching requests to application callbacks.
//! - The [`address`] module parses `AET@host:port` node addresses.
//!
//! Data sets themselves are handled by the `dicom-object` family
//! of crates; this crate moves them across the network.
//!
//! ## Example: C-ECHO as an SCU
//!
//! ```no_run
//! use dicom_dimse::ClientAssociationOptions;
//! use dicom_dimse::dimse::scu;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut association = ClientAssociationOptions::new()
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .calling_ae_title("ECHO-SCU")
//!     .establish_with("MAIN-PACS@10.0.0.100:104")?;
//!
//! let status = scu::echo(&mut association, 1)?;
//! assert_eq!(status, 0x0000);
//! association.release()?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod association;
pub mod dimse;
pub mod pdu;

/// The implementation class UID
/// announced in the user information of every association.
///
/// Generated under the UUID-derived arc as per PS3.5 B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.304713202027295340911869426635494912137";

/// The implementation version name
/// announced in the user information of every association.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DIMSE-RS 0.1.0";

// re-exports

pub use address::FullAeAddr;
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::server::{ServerAssociation, ServerAssociationOptions};
pub use association::Association;
pub use dimse::scp::{DimseServer, ServiceHandler};
pub use pdu::{read_pdu, write_pdu, Pdu};
