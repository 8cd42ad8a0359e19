use crate::error::FrameError;

/// Errors a [`crate::connection::Connection`] reports to its owner.
///
/// All of these are treated as terminal: upon any one of them the
/// connection transitions to `Closed` and the owner is expected to drop its
/// handle.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("{0}")]
    /// A frame could not be decoded from, or encoded to, the wire.
    Frame(#[from] FrameError),

    #[error("{0}")]
    /// The underlying TCP stream errored.
    Io(#[from] std::io::Error),

    #[error("outbound queue is full")]
    /// The bounded outbound channel filled up, meaning the peer isn't
    /// reading fast enough. Rather than buffer unboundedly we drop the
    /// connection.
    OutboundQueueFull,

    #[error("dial attempts exhausted after {0} retries")]
    /// `Connection::dial` gave up after its bounded retry policy expired.
    DialExhausted(usize),

    #[error("connection closed")]
    /// An operation was attempted on a connection that has already reached
    /// the `Closed` state.
    Closed,
}

pub type Result<T, E = ConnectionError> = std::result::Result<T, E>;
