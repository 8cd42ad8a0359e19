//! Set of module errors.

pub mod connection;
pub mod frame;
pub mod metainfo;
pub mod node;
pub mod piece_store;
pub mod tracker;

pub use connection::{ConnectionError, Result as ConnectionResult};
pub use frame::{FrameError, Result as FrameResult};
pub use metainfo::{MetainfoError, Result as MetainfoResult};
pub use node::{NodeError, Result as NodeResult};
pub use piece_store::{PieceStoreError, Result as PieceStoreResult};
pub use tracker::{Result as TrackerResult, TrackerError};
pub use tokio::sync::mpsc::error::SendError;

/// The top-level error for callers that don't need to distinguish between
/// subsystems, e.g. a binary's `main`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{0}")]
    Node(#[from] NodeError),

    #[error("{0}")]
    Connection(#[from] ConnectionError),

    #[error("{0}")]
    PieceStore(#[from] PieceStoreError),

    #[error("{0}")]
    Tracker(#[from] TrackerError),

    #[error("{0}")]
    Frame(#[from] FrameError),

    #[error("{0}")]
    Metainfo(#[from] MetainfoError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("channel error")]
    /// The channel on which some component was listening or sending died.
    Channel,
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
