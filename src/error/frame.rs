/// Errors that can occur while encoding or decoding a [`crate::frame::Frame`]
/// off the wire.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {len} exceeds max_frame_len {max}")]
    /// The 4-byte length prefix announced a payload larger than
    /// `Conf::max_frame_len`. The connection that produced this is closed;
    /// there is no recovering a stream once a peer has lied about a length.
    TooLarge { len: usize, max: usize },

    #[error("malformed frame payload: {0}")]
    /// The payload was not valid JSON, or didn't match the shape expected
    /// for its declared `type`.
    Malformed(String),

    #[error("{0}")]
    /// Failure to read or write the underlying byte stream.
    Io(#[from] std::io::Error),
}

pub type Result<T, E = FrameError> = std::result::Result<T, E>;
