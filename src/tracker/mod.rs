//! The coordination service (`C6`): peer registry, liveness tracking, and
//! swarm-view snapshots.
//!
//! Grounded in the original `src/core/tracker.py`'s accept-loop plus
//! per-client-thread plus health-check-thread design, translated to the
//! teacher's task-per-connection `tokio` model and the teacher's
//! `Sender`+`JoinHandle` handle pattern (`engine::spawn`/`EngineHandle`).
//! Unlike the teacher's own `tracker` module (an HTTP client to an
//! external BitTorrent tracker), this is itself a server: other nodes
//! connect to it over the same [`crate::frame::FrameCodec`] used for
//! peer-to-peer connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::define::PeerAddress;
use crate::error::tracker::{Result, TrackerError};
use crate::frame::{Frame, FrameCodec, PeerEntry};

/// A registered peer's last-known piece set and liveness timestamp.
///
/// The tracker exclusively owns this map: entries are created on
/// `peer_joined`, mutated on `update_pieces`, and destroyed by the
/// liveness sweep once `last_seen` is older than `peer_inactivity_timeout`.
#[derive(Debug, Clone)]
struct PeerView {
    pieces: Vec<usize>,
    last_seen: Instant,
}

type Registry = Arc<Mutex<HashMap<PeerAddress, PeerView>>>;

/// How often the liveness sweep runs, per spec `4.6`. Independent of
/// `peer_inactivity_timeout` (the removal threshold a peer must be idle
/// past before the sweep drops it) so a long inactivity timeout doesn't
/// also slow down how promptly the sweep notices a dead peer.
const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A cheap, cloneable handle to a running tracker: a registry snapshot
/// accessor plus a shutdown signal, mirroring the teacher's
/// `EngineHandle` (sender + background task join handle).
pub struct TrackerHandle {
    registry: Registry,
    shutdown: Arc<Notify>,
    accept_handle: Option<JoinHandle<()>>,
    sweep_handle: Option<JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl TrackerHandle {
    /// Number of peers currently registered (not yet swept for inactivity).
    pub fn peer_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// The address this tracker actually bound, useful when `spawn` was
    /// given an ephemeral port.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Current swarm view, as would be sent in a `peer_list` frame.
    pub fn snapshot(&self) -> Vec<PeerEntry> {
        snapshot(&self.registry)
    }

    /// Signals the accept loop and liveness sweep to stop, then waits for
    /// both tasks to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_waiters();
        if let Some(h) = self.accept_handle.take() {
            let _ = h.await;
        }
        if let Some(h) = self.sweep_handle.take() {
            let _ = h.await;
        }
    }
}

fn snapshot(registry: &Registry) -> Vec<PeerEntry> {
    registry
        .lock()
        .iter()
        .map(|(addr, view)| PeerEntry {
            address: addr.as_str().to_string(),
            pieces: view.pieces.clone(),
        })
        .collect()
}

/// Binds `host:port` and spawns the accept loop and liveness sweep as
/// background tasks, returning a handle to control them.
pub async fn spawn(
    host: &str,
    port: u16,
    peer_inactivity_timeout: Duration,
    max_frame_len: usize,
) -> Result<TrackerHandle> {
    let listener = TcpListener::bind((host, port)).await?;
    let local_addr = listener.local_addr()?;
    log::info!("tracker listening on {}", local_addr);

    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
    let shutdown = Arc::new(Notify::new());

    let accept_handle = {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                let registry = registry.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(stream, addr.into(), registry, max_frame_len).await {
                                        log::warn!("tracker client {} errored: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => log::warn!("tracker accept error: {}", e),
                        }
                    }
                }
            }
        })
    };

    let sweep_handle = {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LIVENESS_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = interval.tick() => sweep_inactive(&registry, peer_inactivity_timeout),
                }
            }
        })
    };

    Ok(TrackerHandle {
        registry,
        shutdown,
        accept_handle: Some(accept_handle),
        sweep_handle: Some(sweep_handle),
        local_addr,
    })
}

fn sweep_inactive(registry: &Registry, timeout: Duration) {
    let mut registry = registry.lock();
    registry.retain(|addr, view| {
        let alive = view.last_seen.elapsed() < timeout;
        if !alive {
            log::debug!("tracker dropping inactive peer {}", addr);
        }
        alive
    });
}

/// Creates a `PeerView` with empty pieces and `last_seen = now`, returning
/// the current swarm view. Idempotent: a peer that registers again keeps
/// its single entry refreshed rather than gaining a duplicate.
fn register(registry: &Registry, address: &PeerAddress) -> Vec<PeerEntry> {
    {
        let mut registry = registry.lock();
        let entry = registry.entry(address.clone()).or_insert_with(|| PeerView {
            pieces: Vec::new(),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
    }
    snapshot(registry)
}

/// Replaces a peer's pieces and refreshes `last_seen`. Unknown peers are
/// ignored, matching the original's defensive `if address in active_peers`.
fn update_pieces(registry: &Registry, address: &PeerAddress, pieces: Vec<usize>) {
    let mut registry = registry.lock();
    if let Some(view) = registry.get_mut(address) {
        view.pieces = pieces;
        view.last_seen = Instant::now();
    }
}

async fn handle_client(
    stream: TcpStream,
    addr: PeerAddress,
    registry: Registry,
    max_frame_len: usize,
) -> Result<()> {
    let mut framed = Framed::new(stream, FrameCodec::new(max_frame_len));

    // a peer registers under the address it self-reports (the one other
    // nodes will dial), which need not match the TCP-observed `addr` once
    // public-IP discovery is in play; every later frame on this connection
    // must key off that registered address, not the raw socket address.
    let mut registered: Option<PeerAddress> = None;

    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(TrackerError::from)?;
        match frame {
            Frame::PeerJoined { address } => {
                let peer: PeerAddress = address.parse().unwrap_or_else(|_| addr.clone());
                let peers = register(&registry, &peer);
                registered = Some(peer);
                framed.send(Frame::PeerList { peers }).await?;
            }
            Frame::UpdatePieces { pieces } => {
                if let Some(peer) = &registered {
                    update_pieces(&registry, peer, pieces);
                }
            }
            Frame::GetPeers => {
                let peers = snapshot(&registry);
                framed.send(Frame::PeerList { peers }).await?;
            }
            Frame::Stopped => break,
            other => {
                log::warn!("tracker client {} sent unexpected frame {:?}", addr, other);
                break;
            }
        }
    }

    if let Some(peer) = registered {
        registry.lock().remove(&peer);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_then_update_pieces_reflected_in_snapshot() {
        let handle = spawn("127.0.0.1", 0, Duration::from_secs(300), 2 * 1024 * 1024)
            .await
            .unwrap();

        assert_eq!(handle.peer_count(), 0);

        let addr: PeerAddress = "127.0.0.1:1".parse().unwrap();
        let peers = register(&handle.registry, &addr);
        assert_eq!(peers.len(), 1);
        assert_eq!(handle.peer_count(), 1);

        update_pieces(&handle.registry, &addr, vec![1, 2, 3]);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot[0].pieces, vec![1, 2, 3]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let handle = spawn("127.0.0.1", 0, Duration::from_secs(300), 2 * 1024 * 1024)
            .await
            .unwrap();
        let addr: PeerAddress = "127.0.0.1:2".parse().unwrap();
        register(&handle.registry, &addr);
        register(&handle.registry, &addr);
        assert_eq!(handle.peer_count(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_removes_inactive_peers() {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let addr: PeerAddress = "127.0.0.1:3".parse().unwrap();
        register(&registry, &addr);
        sweep_inactive(&registry, Duration::from_secs(0));
        assert_eq!(registry.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_update_pieces_ignores_unknown_peer() {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let addr: PeerAddress = "127.0.0.1:4".parse().unwrap();
        update_pieces(&registry, &addr, vec![1]);
        assert_eq!(registry.lock().len(), 0);
    }

    /// Dials a real tracker over TCP and registers under a self-reported
    /// address that differs from the raw socket address the tracker
    /// observes (as happens once public-IP discovery is in play): later
    /// `update_pieces` frames on the same connection, and cleanup on
    /// disconnect, must key off the self-reported address, not the
    /// TCP-observed one.
    #[tokio::test]
    async fn test_client_registers_under_self_reported_address() {
        let handle = spawn("127.0.0.1", 0, Duration::from_secs(300), 2 * 1024 * 1024)
            .await
            .unwrap();

        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new(2 * 1024 * 1024));

        framed
            .send(Frame::PeerJoined { address: "203.0.113.5:6881".to_string() })
            .await
            .unwrap();
        match framed.next().await {
            Some(Ok(Frame::PeerList { .. })) => {}
            other => panic!("expected peer_list, got {:?}", other),
        }
        assert_eq!(handle.peer_count(), 1);

        framed
            .send(Frame::UpdatePieces { pieces: vec![0, 2] })
            .await
            .unwrap();
        // give the server task a moment to process before we inspect state.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, "203.0.113.5:6881");
        assert_eq!(snapshot[0].pieces, vec![0, 2]);

        drop(framed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.peer_count(), 0);

        handle.shutdown().await;
    }
}
