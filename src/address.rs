//! Compound addresses for application entities in a network.

use std::net::{AddrParseError, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use snafu::{ResultExt, Snafu};

/// A full address to a DICOM node:
/// an application entity title plus a socket address,
/// written `{ae_title}@{socket_address}`.
///
/// # Example
///
/// ```
/// # use dicom_dimse::address::FullAeAddr;
/// # use std::net::SocketAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr = "STORE-SCP@127.0.0.1:104".parse()?;
/// assert_eq!(addr.ae_title(), "STORE-SCP");
/// assert_eq!(addr.socket_addr(), SocketAddr::from(([127, 0, 0, 1], 104)));
/// assert_eq!(&addr.to_string(), "STORE-SCP@127.0.0.1:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullAeAddr {
    ae_title: String,
    socket_addr: SocketAddr,
}

impl FullAeAddr {
    /// Create an AE address from its constituent parts.
    pub fn new(ae_title: impl Into<String>, socket_addr: SocketAddr) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            socket_addr,
        }
    }

    /// The application entity title portion.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// The socket address portion.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }
}

impl From<(String, SocketAddr)> for FullAeAddr {
    fn from((ae_title, socket_addr): (String, SocketAddr)) -> Self {
        Self::new(ae_title, socket_addr)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
pub enum ParseAeAddressError {
    /// missing `@` between AE title and socket address
    MissingPart,

    /// could not parse the socket address
    ParseSocketAddress { source: AddrParseError },
}

impl FromStr for FullAeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, addr) = s.split_once('@').ok_or(ParseAeAddressError::MissingPart)?;
        Ok(FullAeAddr {
            ae_title: ae_title.to_string(),
            socket_addr: addr.parse().context(ParseSocketAddressSnafu)?,
        })
    }
}

impl ToSocketAddrs for FullAeAddr {
    type Iter = std::option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl std::fmt::Display for FullAeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.ae_title, self.socket_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints() {
        let addr: FullAeAddr = "PACS@192.168.1.7:11112".parse().unwrap();
        assert_eq!(addr.ae_title(), "PACS");
        assert_eq!(addr.socket_addr().port(), 11112);
        assert_eq!(addr.to_string(), "PACS@192.168.1.7:11112");
    }

    #[test]
    fn refuses_a_bare_socket_address() {
        assert!("192.168.1.7:11112".parse::<FullAeAddr>().is_err());
    }
}
