pub use serde_bencode::Error as BencodeError;

pub type Result<T, E = MetainfoError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum MetainfoError {
    #[error("{0}")]
    Bencode(BencodeError),

    #[error("multi-file torrents are not supported")]
    /// The `.torrent` describes an `info.files` list rather than a single
    /// `info.length`. Out of scope per this engine's Non-goals.
    MultiFileUnsupported,

    #[error("invalid piece hash list length")]
    /// `info.pieces` was not a multiple of 20 bytes.
    InvalidPieces,

    #[error("invalid tracker url")]
    InvalidTrackerUrl,

    #[error("invalid magnet uri: {0}")]
    /// The `magnet:?` URI was missing `xt=urn:btih:<hash>` or the hash was
    /// not 40 hex characters.
    InvalidMagnetUri(String),

    #[error("magnet uri has no tr trackers; peer discovery requires DHT")]
    /// The `magnet:?` URI carried no `tr` parameter. This engine has no DHT
    /// implementation, so a caller hitting this has no way to discover the
    /// coordination service for this swarm from the magnet link alone.
    RequiresDht,
}

impl From<BencodeError> for MetainfoError {
    fn from(error: BencodeError) -> Self {
        Self::Bencode(error)
    }
}

impl From<url::ParseError> for MetainfoError {
    fn from(_: url::ParseError) -> Self {
        Self::InvalidTrackerUrl
    }
}
