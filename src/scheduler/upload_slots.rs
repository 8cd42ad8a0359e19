//! Upload-slot selection: which peers we unchoke, combining tit-for-tat
//! reciprocity with a periodically rotating optimistic unchoke.
//!
//! Grounded in the original `strategies/choking.py`'s `UploadSlotManager`,
//! which composes a base reciprocity strategy with an optimistic-unchoke
//! wrapper rather than folding both concerns into one function.

use std::collections::{HashMap, HashSet};

use rand::seq::IteratorRandom;

use crate::define::PeerAddress;
use crate::node::stats::PeerStats;

/// Picks which peers to unchoke out of the currently interested set.
pub trait ChokeSelector {
    fn select_unchoked(
        &self,
        stats: &HashMap<PeerAddress, PeerStats>,
        interested: &HashSet<PeerAddress>,
        slots: usize,
    ) -> HashSet<PeerAddress>;
}

/// Unchokes the `slots` interested peers with the highest recent upload
/// rate to us, i.e. classic reciprocity: we serve those who serve us.
#[derive(Debug, Default)]
pub struct TitForTat;

impl ChokeSelector for TitForTat {
    fn select_unchoked(
        &self,
        stats: &HashMap<PeerAddress, PeerStats>,
        interested: &HashSet<PeerAddress>,
        slots: usize,
    ) -> HashSet<PeerAddress> {
        let mut ranked: Vec<&PeerAddress> = interested.iter().collect();
        ranked.sort_by(|a, b| {
            let rate_a = stats.get(*a).map(|s| s.download.mean()).unwrap_or(0);
            let rate_b = stats.get(*b).map(|s| s.download.mean()).unwrap_or(0);
            rate_b.cmp(&rate_a)
        });
        ranked.into_iter().take(slots).cloned().collect()
    }
}

/// Wraps a base [`ChokeSelector`] (normally [`TitForTat`]) and reserves one
/// slot for a peer chosen at random among the interested-but-not-otherwise-
/// unchoked set, rotated every `rotate_every` calls. This gives peers with
/// no reciprocal history a periodic chance to prove themselves, matching
/// the original's `OptimisticUnchokeStrategy` rotation.
pub struct OptimisticUnchoke<S> {
    inner: S,
    rotate_every: u32,
    ticks_since_rotation: u32,
    current: Option<PeerAddress>,
}

impl<S: ChokeSelector> OptimisticUnchoke<S> {
    pub fn new(inner: S, rotate_every: u32) -> Self {
        Self {
            inner,
            rotate_every,
            ticks_since_rotation: 0,
            current: None,
        }
    }

    fn rotate_if_due(&mut self, candidates: &HashSet<PeerAddress>) {
        let due = self.ticks_since_rotation >= self.rotate_every;
        let stale = self
            .current
            .as_ref()
            .map(|p| !candidates.contains(p))
            .unwrap_or(true);
        if due || stale {
            self.current = candidates.iter().choose(&mut rand::thread_rng()).cloned();
            self.ticks_since_rotation = 0;
        }
    }
}

impl<S: ChokeSelector> ChokeSelector for OptimisticUnchoke<S> {
    fn select_unchoked(
        &self,
        stats: &HashMap<PeerAddress, PeerStats>,
        interested: &HashSet<PeerAddress>,
        slots: usize,
    ) -> HashSet<PeerAddress> {
        if slots == 0 || interested.is_empty() {
            return HashSet::new();
        }

        let reciprocal_slots = slots.saturating_sub(1);
        let mut unchoked = self
            .inner
            .select_unchoked(stats, interested, reciprocal_slots);

        let optimistic_candidates: HashSet<PeerAddress> = interested
            .iter()
            .filter(|p| !unchoked.contains(*p))
            .cloned()
            .collect();

        // NB: rotation is driven externally via `tick()` so `select_unchoked`
        // can stay a `&self` read; see `UploadSlotManager`.
        if let Some(optimistic) = self
            .current
            .clone()
            .filter(|p| optimistic_candidates.contains(p))
            .or_else(|| optimistic_candidates.iter().next().cloned())
        {
            unchoked.insert(optimistic);
        }

        unchoked
    }
}

/// The node-facing entry point: owns the composed strategy and its
/// rotation clock, exposing a plain `&mut self` tick method so the node's
/// periodic choke-recompute task doesn't need to reach into strategy
/// internals.
pub struct UploadSlotManager {
    strategy: OptimisticUnchoke<TitForTat>,
    slots: usize,
}

impl UploadSlotManager {
    pub fn new(slots: usize, rotate_every: u32) -> Self {
        Self {
            strategy: OptimisticUnchoke::new(TitForTat, rotate_every),
            slots,
        }
    }

    /// Recomputes the unchoked set for this tick, advancing the optimistic
    /// rotation clock.
    pub fn tick(
        &mut self,
        stats: &HashMap<PeerAddress, PeerStats>,
        interested: &HashSet<PeerAddress>,
    ) -> HashSet<PeerAddress> {
        self.strategy.ticks_since_rotation += 1;
        self.strategy.rotate_if_due(interested);
        self.strategy.select_unchoked(stats, interested, self.slots)
    }
}
