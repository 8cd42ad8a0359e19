//! The scheduler (`C4`): decides which pieces to request next and which
//! peers to unchoke.
//!
//! Split into two independent strategy families per spec, grounded in the
//! original `strategies/` package's split between piece selection and
//! choking strategies — neither needs to know about the other.

pub mod piece_selection;
pub mod upload_slots;

pub use piece_selection::{Endgame, PieceSelectionManager, PieceSelector, RandomBootstrap, RarestFirst};
pub use upload_slots::{ChokeSelector, OptimisticUnchoke, TitForTat, UploadSlotManager};
