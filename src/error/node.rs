use crate::error::{ConnectionError, PieceStoreError, TrackerError};

/// Errors surfaced by a [`crate::node::Node`]'s top-level operations.
///
/// Most per-connection and per-piece failures are non-fatal and are handled
/// internally (logged, connection dropped, piece released); this type is
/// reserved for failures of the node as a whole, e.g. failing to bind its
/// listener or losing contact with the coordination service entirely.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    #[error("{0}")]
    PieceStore(#[from] PieceStoreError),

    #[error("{0}")]
    Tracker(#[from] TrackerError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("node command channel closed")]
    /// The node's internal command task has stopped, usually because the
    /// node was already shut down.
    Channel,

    #[error("piece store not configured; call configure_piece_store() before start()")]
    NotConfigured,

    #[error("piece store already configured")]
    AlreadyConfigured,
}

pub type Result<T, E = NodeError> = std::result::Result<T, E>;
