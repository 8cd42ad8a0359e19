/// Errors raised by the piece store (`C3`).
#[derive(Debug, thiserror::Error)]
pub enum PieceStoreError {
    #[error("piece index {0} out of range")]
    /// A caller referenced a piece index beyond the torrent's piece count.
    InvalidPieceIndex(usize),

    #[error("piece {0} failed verification")]
    /// A piece's SHA-1 digest did not match the expected hash from the
    /// torrent's metainfo. The piece is discarded and its slot is released
    /// back to the scheduler.
    VerificationFailed(usize),

    #[error("{0}")]
    /// Failure while allocating or writing the backing file.
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PieceStoreError> = std::result::Result<T, E>;
