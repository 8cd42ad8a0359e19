/// Errors raised by the coordination service (`C6`).
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("{0}")]
    /// Failure to bind or accept on the tracker's listening socket.
    Io(#[from] std::io::Error),

    #[error("{0}")]
    /// A frame could not be decoded from, or encoded to, a client connection.
    Frame(#[from] crate::error::FrameError),

    #[error("unknown peer {0}")]
    /// A client referenced a peer address the tracker has no record of,
    /// e.g. sending `get_peers` before `peer_joined`.
    UnknownPeer(String),
}

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;
