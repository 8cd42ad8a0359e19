use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The index of a piece within a torrent's piece list.
///
/// Created by the piece store; never mutated once assigned.
pub type PieceIndex = usize;

/// An opaque `"<host>:<port>"` string identifying a peer.
///
/// This is the key used for connections at a [`crate::node::Node`] and for
/// swarm-view entries at a [`crate::tracker::Tracker`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self(format!("{}:{}", host.into(), port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves this address to a [`SocketAddr`] suitable for dialing.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.0.parse()
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl FromStr for PeerAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
