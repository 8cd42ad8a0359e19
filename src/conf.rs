//! This module defines types used to configure a node and the coordination
//! service.

use std::time::Duration;

/// The configuration for a single node (leecher or seeder) in the swarm.
///
/// An engine will have a default instance of this applied to a node unless
/// overridden by the caller. Every field here corresponds to a tunable named
/// in the coordination contract; there is deliberately no way to reconfigure
/// a running node, since the scheduler and upload-slot manager both assume a
/// fixed set of thresholds for the lifetime of a download.
#[derive(Debug, Clone)]
pub struct Conf {
  /// Host of the coordination service to announce to and fetch peers from.
  pub tracker_host: String,
  /// Port of the coordination service.
  pub tracker_port: u16,

  /// Host this node listens for incoming peer connections on.
  pub listen_host: String,
  /// Port this node listens for incoming peer connections on.
  pub listen_port: u16,

  /// The maximum number of outstanding piece requests a node may have in
  /// flight across all connections at once.
  pub max_parallel_requests: usize,
  /// How long to wait for a `piece_response` before the request is
  /// considered timed out and the piece is released back to the scheduler.
  pub request_timeout: Duration,

  /// The maximum number of peers this node will keep unchoked at once.
  pub max_unchoked: usize,
  /// The maximum number of outstanding requests to send to a single peer
  /// before waiting for responses.
  pub pipeline_depth: usize,

  /// How often the upload-slot manager recomputes tit-for-tat choke state
  /// and rotates the optimistic unchoke.
  pub choking_interval: Duration,
  /// How often a node re-announces to the coordination service and prunes
  /// dead connections.
  pub heartbeat_interval: Duration,
  /// A peer that has sent nothing for this long is dropped.
  pub peer_inactivity_timeout: Duration,
  /// Delay before a node retries a dial that failed.
  pub reconnect_delay: Duration,

  /// Number of pieces completed before the scheduler switches from random
  /// bootstrap piece selection to rarest-first.
  pub random_bootstrap_threshold: usize,
  /// Fraction of pieces completed (0.0-1.0) at which the scheduler enters
  /// the endgame regime.
  pub endgame_threshold_fraction: f64,
  /// How many redundant requests the endgame regime issues per remaining
  /// piece.
  pub endgame_duplication: usize,

  /// Hard cap on a decoded frame's payload length, in bytes. Protects a
  /// node from a peer advertising an unbounded length prefix.
  pub max_frame_len: usize,
}

impl Conf {
  /// Returns a configuration pointed at `tracker_host:tracker_port`, with a
  /// node listening on an ephemeral port and every other field left at its
  /// default.
  pub fn new(tracker_host: impl Into<String>, tracker_port: u16) -> Self {
    Self {
      tracker_host: tracker_host.into(),
      tracker_port,
      listen_host: "0.0.0.0".to_string(),
      listen_port: 0,
      ..Self::default()
    }
  }
}

impl Default for Conf {
  fn default() -> Self {
    Conf {
      tracker_host: "0.0.0.0".to_string(),
      tracker_port: 8080,
      listen_host: "0.0.0.0".to_string(),
      listen_port: 0,
      max_parallel_requests: 16,
      request_timeout: Duration::from_secs(60),
      max_unchoked: 4,
      pipeline_depth: 5,
      choking_interval: Duration::from_secs(10),
      heartbeat_interval: Duration::from_secs(30),
      peer_inactivity_timeout: Duration::from_secs(300),
      reconnect_delay: Duration::from_secs(5),
      random_bootstrap_threshold: 4,
      endgame_threshold_fraction: 0.95,
      endgame_duplication: 3,
      max_frame_len: 2 * 1024 * 1024,
    }
  }
}
