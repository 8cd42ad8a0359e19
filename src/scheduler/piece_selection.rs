//! Piece selection policies: which pieces to request next, and when to
//! switch between them.
//!
//! Grounded in the original implementation's `strategies/strategy.py`
//! `PieceSelectionStrategy` ABC: each regime is a narrow, swappable
//! strategy rather than a branch inside one monolithic selector.

use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::define::{PeerAddress, PieceIndex};

/// Picks which of the still-needed pieces to request next.
///
/// `needed` is the caller's current candidate set (typically
/// `PieceStore::needed()`); `peer_pieces` maps a peer to the pieces it is
/// known to have; `max_requests` bounds how many indices to return in one
/// call (usually the caller's remaining pipeline budget for one peer).
pub trait PieceSelector {
    fn select(
        &self,
        needed: &[PieceIndex],
        peer_pieces: &HashMap<PeerAddress, Vec<PieceIndex>>,
        max_requests: usize,
    ) -> Vec<PieceIndex>;
}

/// Picks uniformly at random among `needed`. Used before a node has
/// accumulated enough pieces for rarity statistics to be meaningful.
#[derive(Debug, Default)]
pub struct RandomBootstrap;

impl PieceSelector for RandomBootstrap {
    fn select(
        &self,
        needed: &[PieceIndex],
        _peer_pieces: &HashMap<PeerAddress, Vec<PieceIndex>>,
        max_requests: usize,
    ) -> Vec<PieceIndex> {
        let mut candidates = needed.to_vec();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(max_requests);
        candidates
    }
}

/// Picks the pieces held by the fewest peers first, ties broken by
/// ascending `PieceIndex`.
#[derive(Debug, Default)]
pub struct RarestFirst;

impl PieceSelector for RarestFirst {
    fn select(
        &self,
        needed: &[PieceIndex],
        peer_pieces: &HashMap<PeerAddress, Vec<PieceIndex>>,
        max_requests: usize,
    ) -> Vec<PieceIndex> {
        let mut availability: HashMap<PieceIndex, usize> =
            needed.iter().map(|&index| (index, 0)).collect();
        for pieces in peer_pieces.values() {
            for &index in pieces {
                if let Some(count) = availability.get_mut(&index) {
                    *count += 1;
                }
            }
        }

        let mut ranked: Vec<PieceIndex> = needed.to_vec();
        ranked.sort_by_key(|&index| (availability.get(&index).copied().unwrap_or(0), index));
        ranked.truncate(max_requests);
        ranked
    }
}

/// Requests every remaining piece from every peer known to have it, so the
/// last few pieces of a download aren't held up by one slow peer.
///
/// Duplication is bounded at `duplication` outstanding requests per piece;
/// the caller is expected to issue `cancel_request` to the peers that
/// didn't win once a piece completes.
#[derive(Debug)]
pub struct Endgame {
    pub duplication: usize,
}

impl PieceSelector for Endgame {
    fn select(
        &self,
        needed: &[PieceIndex],
        _peer_pieces: &HashMap<PeerAddress, Vec<PieceIndex>>,
        max_requests: usize,
    ) -> Vec<PieceIndex> {
        let mut out = Vec::new();
        for &index in needed {
            for _ in 0..self.duplication {
                if out.len() >= max_requests {
                    return out;
                }
                out.push(index);
            }
        }
        out
    }
}

/// The three piece-selection regimes a download progresses through, and
/// the logic for switching between them as completion advances.
///
/// Mirrors the original `PieceSelectionManager.update_piece_progress`
/// state transition: regime only ever moves forward (bootstrap -> rarest
/// -> endgame), never back, even if `progress` later dips due to a
/// verification failure re-opening a piece.
pub struct PieceSelectionManager {
    random_bootstrap_threshold: usize,
    endgame_threshold_fraction: f64,
    endgame_duplication: usize,
    regime: Regime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regime {
    RandomBootstrap,
    RarestFirst,
    Endgame,
}

impl PieceSelectionManager {
    pub fn new(
        random_bootstrap_threshold: usize,
        endgame_threshold_fraction: f64,
        endgame_duplication: usize,
    ) -> Self {
        Self {
            random_bootstrap_threshold,
            endgame_threshold_fraction,
            endgame_duplication,
            regime: Regime::RandomBootstrap,
        }
    }

    /// Updates the regime for the current piece count and total piece
    /// count. Called once per scheduling tick before `select`.
    pub fn update_progress(&mut self, completed: usize, total: usize) {
        if self.regime == Regime::Endgame {
            return;
        }
        let fraction = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        };
        if fraction >= self.endgame_threshold_fraction {
            self.regime = Regime::Endgame;
        } else if completed >= self.random_bootstrap_threshold && self.regime == Regime::RandomBootstrap {
            self.regime = Regime::RarestFirst;
        }
    }

    pub fn select(
        &self,
        needed: &[PieceIndex],
        peer_pieces: &HashMap<PeerAddress, Vec<PieceIndex>>,
        max_requests: usize,
    ) -> Vec<PieceIndex> {
        match self.regime {
            Regime::RandomBootstrap => RandomBootstrap.select(needed, peer_pieces, max_requests),
            Regime::RarestFirst => RarestFirst.select(needed, peer_pieces, max_requests),
            Regime::Endgame => Endgame {
                duplication: self.endgame_duplication,
            }
            .select(needed, peer_pieces, max_requests),
        }
    }

    pub fn is_endgame(&self) -> bool {
        self.regime == Regime::Endgame
    }
}
