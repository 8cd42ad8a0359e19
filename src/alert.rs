//! Alerts a [`crate::node::Node`] may broadcast to an API consumer.
//!
//! Communication is performed via an unbounded [`tokio::sync::mpsc`]
//! channel. A consumer that only cares about completion can drop every
//! other variant on the floor; nothing in the node blocks waiting for an
//! alert to be read.

use std::time::Duration;

use crate::define::PeerAddress;
use crate::error::node::NodeError;

pub type AlertSender = tokio::sync::mpsc::UnboundedSender<Alert>;
pub type AlertReceiver = tokio::sync::mpsc::UnboundedReceiver<Alert>;

/// Events a node reports as they happen, in addition to its synchronous
/// public contract (`start`/`stop`/etc). None of these are required for
/// correct operation; a caller that never drains the channel loses
/// nothing but observability.
#[derive(Debug)]
pub enum Alert {
    /// A new peer was added to the connection map, via `peer_list` or an
    /// inbound accept.
    PeerJoined(PeerAddress),

    /// A piece was verified and written to disk.
    PieceCompleted { index: usize },

    /// `is_complete()` became true; the node has switched to seeding.
    TorrentComplete,

    /// A non-fatal error occurred and was handled locally (connection
    /// dropped, piece released, etc). Surfaced for logging/metrics only.
    Error(NodeError),
}

/// Creates a fresh alert channel, returning the sender half a node keeps
/// and the receiver half its caller holds onto.
pub fn channel() -> (AlertSender, AlertReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Sends `alert`, silently dropping it if the receiver has gone away.
pub fn notify(tx: &AlertSender, alert: Alert) {
    let _ = tx.send(alert);
}

/// How long the optimistic-unchoke rotation and other jittered internals
/// should wait before their first tick, to avoid every periodic task in a
/// freshly started node waking up on the same instant.
pub const STARTUP_JITTER: Duration = Duration::from_millis(50);
