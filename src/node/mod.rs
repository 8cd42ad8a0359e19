//! The node (`C5`): per-participant orchestrator. Owns the connection
//! map, the piece store, and the scheduler, and runs the state machine
//! described in spec `4.5`.
//!
//! Grounded in the teacher's `engine.rs` actor shape (an `Arc`-shared
//! handle, background tasks spawned off `tokio::spawn`, a `JoinHandle`
//! per task collected for shutdown) applied to a single torrent instead
//! of a multi-torrent engine, since a node here downloads exactly one
//! file.

pub mod stats;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::alert::{self, Alert, AlertSender};
use crate::conf::Conf;
use crate::connection::{Connection, ConnectionEvent, EventReceiver};
use crate::define::{PeerAddress, PieceIndex};
use crate::error::node::{NodeError, Result};
use crate::frame::Frame;
use crate::metainfo::TorrentInfo;
use crate::piece_store::PieceStore;
use crate::scheduler::{PieceSelectionManager, UploadSlotManager};
use stats::PeerStats;

/// Minimum number of connections a node tries to gather before leaving
/// `PeerDiscovery`, per spec `4.5` (`M_min`).
const DISCOVERY_MIN_PEERS: usize = 3;
/// Upper bound on time spent in `PeerDiscovery` regardless of how many
/// peers were found.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Bounded dial retry count, per spec `4.2`'s "up to K attempts".
const DIAL_MAX_RETRIES: usize = 3;
/// How often the request pump wakes up to drain the selection queue.
const REQUEST_PUMP_INTERVAL: Duration = Duration::from_millis(100);
/// How often the timeout sweep merges piece-store and pending-request
/// deadlines.
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// How often `PeerDiscovery` re-asks the tracker for a fresh swarm view.
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The four live states of spec `4.5`'s state machine plus the terminal
/// `Stopping`, realized as a plain tag matched by `Node`'s tick/dispatch
/// methods rather than a class hierarchy (spec `9`'s redesign note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStateTag {
    PeerDiscovery,
    Downloading,
    Endgame,
    Seeding,
    Stopping,
}

/// One of this node's own in-flight requests: which peer it asked, and
/// when, so the timeout sweep can find it again.
#[derive(Debug, Clone)]
struct PendingRequest {
    peer: PeerAddress,
    started_at: Instant,
}

/// Everything a node mutates from more than one task, behind a single
/// `parking_lot::Mutex`, matching spec `5`'s "Node pending+unchoked+
/// choked+swarm may share a single re-entrant mutex" — `parking_lot`'s
/// mutex is non-reentrant but every critical section here is a single
/// synchronous map operation, so that isn't needed in practice.
struct Shared {
    connections: HashMap<PeerAddress, Connection>,
    swarm: HashMap<PeerAddress, HashSet<PieceIndex>>,
    stats: HashMap<PeerAddress, PeerStats>,
    pending: HashMap<PieceIndex, Vec<PendingRequest>>,
    unchoked: HashSet<PeerAddress>,
    piece_selection: PieceSelectionManager,
    upload_slots: UploadSlotManager,
    state: NodeStateTag,
    discovery_deadline: Instant,
    priority: VecDeque<PieceIndex>,
}

/// The per-participant orchestrator. Cheaply clonable; every clone
/// shares the same background tasks and state.
pub struct Node {
    conf: Conf,
    torrent: TorrentInfo,
    piece_store: OnceCell<PieceStore>,
    shared: SyncMutex<Shared>,
    events_tx: crate::connection::EventSender,
    events_rx: AsyncMutex<Option<EventReceiver>>,
    self_addr: SyncMutex<Option<PeerAddress>>,
    listen_addr: SyncMutex<Option<SocketAddr>>,
    tracker_conn: AsyncMutex<Option<Connection>>,
    tracker_addr: SyncMutex<Option<(String, u16)>>,
    alert_tx: AlertSender,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Builds a node for `torrent` under `conf`. The piece store is not
    /// opened yet; call [`Node::configure_piece_store`] before
    /// [`Node::start`].
    pub fn new(conf: Conf, torrent: TorrentInfo, alert_tx: AlertSender) -> Arc<Self> {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let optimistic_rotate_ticks = (30.0 / conf.choking_interval.as_secs_f64()).round().max(1.0) as u32;
        Arc::new(Self {
            piece_store: OnceCell::new(),
            shared: SyncMutex::new(Shared {
                connections: HashMap::new(),
                swarm: HashMap::new(),
                stats: HashMap::new(),
                pending: HashMap::new(),
                unchoked: HashSet::new(),
                piece_selection: PieceSelectionManager::new(
                    conf.random_bootstrap_threshold,
                    conf.endgame_threshold_fraction,
                    conf.endgame_duplication,
                ),
                upload_slots: UploadSlotManager::new(conf.max_unchoked, optimistic_rotate_ticks),
                state: NodeStateTag::PeerDiscovery,
                discovery_deadline: Instant::now() + DISCOVERY_TIMEOUT,
                priority: VecDeque::new(),
            }),
            events_tx,
            events_rx: AsyncMutex::new(Some(events_rx)),
            self_addr: SyncMutex::new(None),
            listen_addr: SyncMutex::new(None),
            tracker_conn: AsyncMutex::new(None),
            tracker_addr: SyncMutex::new(None),
            alert_tx,
            tasks: SyncMutex::new(Vec::new()),
            conf,
            torrent,
        })
    }

    /// Opens (or creates) the backing file at `output_dir/<name>`,
    /// pre-allocated to the torrent's full length. Must be called once,
    /// before [`Node::start`].
    pub fn configure_piece_store(&self, output_dir: impl AsRef<std::path::Path>) -> Result<()> {
        let path = output_dir.as_ref().join(&self.torrent.name);
        let store = PieceStore::new(self.torrent.clone(), path)?;
        self.piece_store
            .set(store)
            .map_err(|_| NodeError::AlreadyConfigured)?;
        Ok(())
    }

    fn piece_store(&self) -> Result<&PieceStore> {
        self.piece_store.get().ok_or(NodeError::NotConfigured)
    }

    /// Marks every piece complete without touching the backing file, for
    /// a node that starts out as the initial seeder. The piece store
    /// must already be configured.
    pub fn set_seeder(&self) -> Result<()> {
        self.piece_store()?.set_seeder();
        self.shared.lock().state = NodeStateTag::Seeding;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.piece_store().map(PieceStore::is_complete).unwrap_or(false)
    }

    pub fn progress(&self) -> f64 {
        self.piece_store().map(PieceStore::progress).unwrap_or(0.0) * 100.0
    }

    pub fn state(&self) -> NodeStateTag {
        self.shared.lock().state
    }

    /// Total bytes served to all peers so far, summed across every peer's
    /// [`PeerStats::total_uploaded`]. Used to confirm that piece serving is
    /// actually shared peer-to-peer rather than funneled through one node.
    pub fn total_uploaded(&self) -> u64 {
        self.shared.lock().stats.values().map(|s| s.total_uploaded).sum()
    }

    /// Best-effort discovery of this host's outbound-facing address: we
    /// never actually send a packet, just ask the OS which local address
    /// it would route a UDP datagram to `8.8.8.8` through.
    fn discover_public_ip() -> std::net::IpAddr {
        UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.connect("8.8.8.8:80")?;
                socket.local_addr()
            })
            .map(|addr| addr.ip())
            .unwrap_or_else(|_| std::net::Ipv4Addr::LOCALHOST.into())
    }

    /// Binds the listening endpoint, discovers a best-effort public
    /// address, and spawns every periodic background activity. Idempotent:
    /// a second call returns the address established by the first.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if let Some(addr) = *self.listen_addr.lock() {
            return Ok(addr);
        }
        self.piece_store()?;

        let listener = TcpListener::bind((self.conf.listen_host.as_str(), self.conf.listen_port))
            .await
            .map_err(NodeError::Io)?;
        let local_addr = listener.local_addr().map_err(NodeError::Io)?;
        let public_ip = Self::discover_public_ip();
        let self_addr = PeerAddress::new(public_ip.to_string(), local_addr.port());
        log::info!("node listening on {} (advertised as {})", local_addr, self_addr);

        *self.listen_addr.lock() = Some(local_addr);
        *self.self_addr.lock() = Some(self_addr);

        if self.is_complete() {
            self.shared.lock().state = NodeStateTag::Seeding;
        }

        let events_rx = self
            .events_rx
            .lock()
            .await
            .take()
            .expect("start() called twice");

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.clone().accept_loop(listener)));
        tasks.push(tokio::spawn(self.clone().dispatch_loop(events_rx)));
        tasks.push(tokio::spawn(self.clone().discovery_watch()));
        tasks.push(tokio::spawn(self.clone().request_pump()));
        tasks.push(tokio::spawn(self.clone().choke_recompute()));
        tasks.push(tokio::spawn(self.clone().timeout_sweep()));
        tasks.push(tokio::spawn(self.clone().tracker_heartbeat()));
        *self.tasks.lock() = tasks;

        Ok(local_addr)
    }

    /// Dials the coordination service, retrying per spec `4.2`, and
    /// announces this node's address on success.
    pub async fn connect_to_tracker(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        *self.tracker_addr.lock() = Some((host.to_string(), port));
        self.dial_tracker().await
    }

    async fn dial_tracker(self: &Arc<Self>) -> Result<()> {
        let Some((host, port)) = self.tracker_addr.lock().clone() else {
            return Ok(());
        };
        let addr = PeerAddress::new(host, port);
        let conn = Connection::dial(
            addr,
            self.conf.max_frame_len,
            DIAL_MAX_RETRIES,
            self.conf.reconnect_delay,
            self.events_tx.clone(),
        )
        .await
        .map_err(NodeError::Connection)?;

        let self_addr = self
            .self_addr
            .lock()
            .clone()
            .unwrap_or_else(|| PeerAddress::new("0.0.0.0", 0));
        conn.send(Frame::PeerJoined {
            address: self_addr.to_string(),
        })
        .await
        .map_err(NodeError::Connection)?;

        *self.tracker_conn.lock().await = Some(conn);
        log::info!("connected to tracker");
        Ok(())
    }

    /// Closes every connection, the tracker link, and aborts every
    /// background task. In-flight `submit`s are allowed to finish since
    /// nothing here touches the piece store's mutex.
    pub async fn stop(self: &Arc<Self>) {
        self.shared.lock().state = NodeStateTag::Stopping;

        if let Some(conn) = self.tracker_conn.lock().await.as_ref() {
            let _ = conn.send(Frame::Stopped).await;
        }
        if let Some(mut conn) = self.tracker_conn.lock().await.take() {
            conn.close().await;
        }

        let mut connections: Vec<Connection> = {
            let mut shared = self.shared.lock();
            shared.connections.drain().map(|(_, c)| c).collect()
        };
        for conn in connections.iter_mut() {
            conn.close().await;
        }

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    fn self_address(&self) -> Option<PeerAddress> {
        self.self_addr.lock().clone()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let peer: PeerAddress = addr.into();
                    let conn = Connection::from_stream(
                        peer.clone(),
                        stream,
                        self.conf.max_frame_len,
                        self.events_tx.clone(),
                    );
                    self.shared.lock().connections.insert(peer.clone(), conn);
                    alert::notify(&self.alert_tx, Alert::PeerJoined(peer));
                }
                Err(e) => log::warn!("accept error: {}", e),
            }
        }
    }

    async fn discovery_watch(self: Arc<Self>) {
        loop {
            {
                let shared = self.shared.lock();
                if shared.state != NodeStateTag::PeerDiscovery {
                    return;
                }
                let enough_peers = shared.connections.len() >= DISCOVERY_MIN_PEERS;
                let timed_out = Instant::now() >= shared.discovery_deadline;
                if enough_peers || timed_out {
                    drop(shared);
                    self.advance_past_discovery();
                    return;
                }
            }

            if let Some(conn) = self.tracker_conn.lock().await.as_ref() {
                let _ = conn.send(Frame::GetPeers).await;
            }
            tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
        }
    }

    fn advance_past_discovery(&self) {
        let mut shared = self.shared.lock();
        if shared.state == NodeStateTag::PeerDiscovery {
            shared.state = if self.is_complete() {
                NodeStateTag::Seeding
            } else {
                NodeStateTag::Downloading
            };
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut events_rx: EventReceiver) {
        while let Some(event) = events_rx.recv().await {
            match event {
                ConnectionEvent::Frame(peer, frame) => self.handle_frame(peer, frame).await,
                ConnectionEvent::Closed(peer) => self.handle_closed(peer),
            }
        }
    }

    fn handle_closed(&self, peer: PeerAddress) {
        log::debug!("connection to {} closed", peer);
        let mut shared = self.shared.lock();
        shared.connections.remove(&peer);
        shared.stats.remove(&peer);
        shared.unchoked.remove(&peer);
        let orphaned: Vec<PieceIndex> = shared
            .pending
            .iter()
            .filter(|(_, reqs)| reqs.iter().any(|r| r.peer == peer))
            .map(|(&id, _)| id)
            .collect();
        for id in orphaned {
            if let Some(reqs) = shared.pending.get_mut(&id) {
                reqs.retain(|r| r.peer != peer);
                if reqs.is_empty() {
                    shared.pending.remove(&id);
                    drop_release(&self.piece_store, id);
                }
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, peer: PeerAddress, frame: Frame) {
        match frame {
            Frame::PeerList { peers } => self.handle_peer_list(peers).await,
            Frame::PieceRequest { piece_id } => self.handle_piece_request(&peer, piece_id).await,
            Frame::PieceResponse { piece_id, data } => {
                self.handle_piece_response(&peer, piece_id, data).await
            }
            Frame::UpdatePieces { pieces } => {
                self.shared
                    .lock()
                    .swarm
                    .insert(peer, pieces.into_iter().collect());
            }
            Frame::CancelRequest { piece_id } => {
                log::debug!("{} cancelled its request for piece {}", peer, piece_id);
            }
            Frame::Interested => {
                self.set_peer_flag(&peer, |f| f.peer_interested = true);
            }
            Frame::NotInterested => {
                self.set_peer_flag(&peer, |f| f.peer_interested = false);
            }
            Frame::Choke => {
                self.set_peer_flag(&peer, |f| f.peer_choking = true);
                self.requeue_pending_for(&peer);
            }
            Frame::Unchoke => {
                self.set_peer_flag(&peer, |f| f.peer_choking = false);
            }
            Frame::PeerJoined { .. } | Frame::GetPeers | Frame::Stopped => {
                log::warn!("unexpected frame from peer {}: {:?}", peer, frame);
            }
        }
    }

    fn set_peer_flag(&self, peer: &PeerAddress, f: impl FnOnce(&mut crate::connection::ConnectionFlags)) {
        if let Some(conn) = self.shared.lock().connections.get_mut(peer) {
            f(&mut conn.flags);
        }
    }

    /// Releases every request this node has outstanding to `peer` back
    /// to the scheduler, per spec `4.5`: "if choked, treat pending
    /// requests to that peer as cancelled and re-queue them."
    fn requeue_pending_for(&self, peer: &PeerAddress) {
        let mut shared = self.shared.lock();
        let affected: Vec<PieceIndex> = shared
            .pending
            .iter()
            .filter(|(_, reqs)| reqs.iter().any(|r| &r.peer == peer))
            .map(|(&id, _)| id)
            .collect();
        for id in affected {
            if let Some(reqs) = shared.pending.get_mut(&id) {
                reqs.retain(|r| &r.peer != peer);
                if reqs.is_empty() {
                    shared.pending.remove(&id);
                    shared.priority.push_back(id);
                    drop(shared);
                    if let Ok(store) = self.piece_store() {
                        store.release(id);
                    }
                    shared = self.shared.lock();
                }
            }
        }
    }

    async fn handle_peer_list(self: &Arc<Self>, peers: Vec<crate::frame::PeerEntry>) {
        let self_addr = self.self_address();
        let mut to_connect = Vec::new();
        {
            let mut shared = self.shared.lock();
            shared.swarm.clear();
            for entry in &peers {
                let addr: PeerAddress = entry.address.parse().unwrap();
                if Some(&addr) == self_addr.as_ref() {
                    continue;
                }
                shared
                    .swarm
                    .insert(addr.clone(), entry.pieces.iter().copied().collect());
                if !shared.connections.contains_key(&addr) {
                    to_connect.push(addr);
                }
            }
        }
        for addr in to_connect {
            tokio::spawn(self.clone().connect_to_peer(addr));
        }
    }

    async fn connect_to_peer(self: Arc<Self>, addr: PeerAddress) {
        if self.shared.lock().connections.contains_key(&addr) {
            return;
        }
        match Connection::dial(
            addr.clone(),
            self.conf.max_frame_len,
            DIAL_MAX_RETRIES,
            self.conf.reconnect_delay,
            self.events_tx.clone(),
        )
        .await
        {
            Ok(conn) => {
                self.shared.lock().connections.insert(addr.clone(), conn);
                alert::notify(&self.alert_tx, Alert::PeerJoined(addr));
            }
            Err(e) => log::warn!("failed to connect to {}: {}", addr, e),
        }
    }

    async fn handle_piece_request(&self, peer: &PeerAddress, piece_id: PieceIndex) {
        let unchoked = self.shared.lock().unchoked.contains(peer);
        if !unchoked {
            return;
        }
        let Ok(store) = self.piece_store() else { return };
        if !store.has_piece(piece_id) {
            // piece not yet complete; silently drop per spec 4.5
            return;
        }
        let Ok(data) = store.read(piece_id) else { return };

        let reply = Frame::PieceResponse { piece_id, data: data.clone() };
        let outbound = {
            let shared = self.shared.lock();
            shared.connections.get(peer).map(|c| c.outbound_tx.clone())
        };
        if let Some(tx) = outbound {
            if let Err(e) = tx.try_send(reply) {
                log::warn!("failed to serve piece {} to {}: {}", piece_id, peer, e);
            } else {
                let mut shared = self.shared.lock();
                shared
                    .stats
                    .entry(peer.clone())
                    .or_insert_with(PeerStats::new)
                    .record_upload(data.len(), Duration::from_secs(1));
            }
        }
    }

    async fn handle_piece_response(self: &Arc<Self>, peer: &PeerAddress, piece_id: PieceIndex, data: Vec<u8>) {
        let started_at = {
            let mut shared = self.shared.lock();
            let Some(reqs) = shared.pending.get_mut(&piece_id) else {
                return;
            };
            let Some(pos) = reqs.iter().position(|r| &r.peer == peer) else {
                return;
            };
            let req = reqs.remove(pos);
            let others = reqs.clone();
            if reqs.is_empty() {
                shared.pending.remove(&piece_id);
            }
            (req.started_at, others)
        };
        let (started_at, other_requesters) = started_at;

        let Ok(store) = self.piece_store() else { return };
        match store.submit(piece_id, &data) {
            Ok(()) => {
                {
                    let mut shared = self.shared.lock();
                    shared
                        .stats
                        .entry(peer.clone())
                        .or_insert_with(PeerStats::new)
                        .record_download(data.len(), started_at.elapsed());
                }
                self.announce_to_tracker().await;
                alert::notify(&self.alert_tx, Alert::PieceCompleted { index: piece_id });

                for other in other_requesters {
                    self.cancel_request(&other.peer, piece_id).await;
                }

                if store.is_complete() {
                    self.shared.lock().state = NodeStateTag::Seeding;
                    alert::notify(&self.alert_tx, Alert::TorrentComplete);
                }
            }
            Err(e) => {
                log::warn!("piece {} from {} failed verification: {}", piece_id, peer, e);
                store.release(piece_id);
                alert::notify(&self.alert_tx, Alert::Error(NodeError::PieceStore(e)));
            }
        }
    }

    async fn cancel_request(&self, peer: &PeerAddress, piece_id: PieceIndex) {
        let outbound = self
            .shared
            .lock()
            .connections
            .get(peer)
            .map(|c| c.outbound_tx.clone());
        if let Some(tx) = outbound {
            let _ = tx.try_send(Frame::CancelRequest { piece_id });
        }
    }

    async fn announce_to_tracker(&self) {
        let Ok(store) = self.piece_store() else { return };
        let pieces: Vec<PieceIndex> = store.completed();
        if let Some(conn) = self.tracker_conn.lock().await.as_ref() {
            let _ = conn.send(Frame::UpdatePieces { pieces }).await;
        }
    }

    async fn request_pump(self: Arc<Self>) {
        tokio::time::sleep(alert::STARTUP_JITTER).await;
        let mut interval = tokio::time::interval(REQUEST_PUMP_INTERVAL);
        loop {
            interval.tick().await;
            self.pump_once();
        }
    }

    fn pump_once(&self) {
        let Ok(store) = self.piece_store() else { return };
        let state = self.shared.lock().state;
        if matches!(state, NodeStateTag::Seeding | NodeStateTag::Stopping | NodeStateTag::PeerDiscovery) {
            return;
        }

        let needed = store.needed();
        let total = store.piece_count();
        // `needed` is `Missing` only (in-flight pieces aren't fresh
        // candidates), so completion has to be counted directly rather
        // than inferred as `total - needed.len()`.
        let completed = store.completed().len();

        let mut shared = self.shared.lock();
        shared.piece_selection.update_progress(completed, total);
        if shared.piece_selection.is_endgame() && state != NodeStateTag::Endgame {
            shared.state = NodeStateTag::Endgame;
        }

        let outstanding: usize = shared.pending.values().map(Vec::len).sum();
        let mut budget = self.conf.max_parallel_requests.saturating_sub(outstanding);
        if budget == 0 {
            return;
        }

        let peer_pieces: HashMap<PeerAddress, Vec<PieceIndex>> = shared
            .swarm
            .iter()
            .map(|(p, pieces)| (p.clone(), pieces.iter().copied().collect()))
            .collect();

        // priority requeues (from timeouts / re-chokes) go first.
        let mut wanted: Vec<PieceIndex> = Vec::new();
        while let Some(id) = shared.priority.pop_front() {
            if wanted.len() >= budget {
                shared.priority.push_front(id);
                break;
            }
            if needed.contains(&id) {
                wanted.push(id);
            }
        }
        // `remaining_budget` is this tick's share of the node-wide
        // `max_parallel_requests` cap; `pipeline_depth` (spec `4.4`'s `P`)
        // additionally bounds how many pieces a single selection call may
        // nominate, independent of how much of the node-wide budget is free.
        let remaining_budget = budget.saturating_sub(wanted.len());
        let selection_budget = remaining_budget.min(self.conf.pipeline_depth);
        if selection_budget > 0 {
            wanted.extend(shared.piece_selection.select(&needed, &peer_pieces, selection_budget));
        }

        // group by piece id so endgame duplicates are requested from
        // distinct peers rather than the same one repeatedly; outside
        // endgame, a piece is only ever wanted from a single peer.
        let is_endgame = shared.piece_selection.is_endgame();
        let max_duplication = if is_endgame { self.conf.endgame_duplication } else { 1 };
        let mut desired_counts: HashMap<PieceIndex, usize> = HashMap::new();
        for id in wanted {
            let count = desired_counts.entry(id).or_insert(0);
            if *count < max_duplication {
                *count += 1;
            }
        }

        // peers usable as a holder for each wanted piece: connected,
        // not currently choking us, and known (via the tracker's swarm
        // view) to have it.
        let swarm_snapshot: Vec<(PeerAddress, HashSet<PieceIndex>)> = shared
            .swarm
            .iter()
            .map(|(p, pieces)| (p.clone(), pieces.clone()))
            .collect();
        let unchoking_peers: HashSet<PeerAddress> = shared
            .connections
            .iter()
            .filter(|(_, c)| !c.flags.peer_choking)
            .map(|(p, _)| p.clone())
            .collect();

        // declare interest in every connected peer holding a needed piece,
        // independent of whether they currently choke us: a peer can only
        // decide to unchoke us once we've told it we're interested, so
        // this cannot be gated on `unchoking_peers` without deadlocking.
        let needed_set: HashSet<PieceIndex> = needed.iter().copied().collect();
        let interesting_peers: HashSet<PeerAddress> = swarm_snapshot
            .iter()
            .filter(|(p, pieces)| {
                shared.connections.contains_key(p) && pieces.intersection(&needed_set).next().is_some()
            })
            .map(|(p, _)| p.clone())
            .collect();
        for peer in &interesting_peers {
            self.ensure_interested(&mut shared, peer);
        }

        for (index, desired) in desired_counts {
            if budget == 0 {
                break;
            }
            let already = shared.pending.get(&index).map(Vec::len).unwrap_or(0);
            if already >= desired {
                continue;
            }

            let excluded: HashSet<PeerAddress> = shared
                .pending
                .get(&index)
                .map(|reqs| reqs.iter().map(|r| r.peer.clone()).collect())
                .unwrap_or_default();

            let candidates: Vec<PeerAddress> = swarm_snapshot
                .iter()
                .filter(|(p, pieces)| {
                    pieces.contains(&index) && !excluded.contains(p) && unchoking_peers.contains(p)
                })
                .map(|(p, _)| p.clone())
                .collect();

            // only claim once a usable candidate is actually in hand: a
            // piece claimed with nobody to ask would sit `InFlight` with
            // no pending request tracking it, invisible to every sweep
            // until the piece store's own timeout eventually frees it.
            if candidates.is_empty() {
                continue;
            }
            if already == 0 && store.claim([index], None).is_none() {
                continue;
            }

            let need_more = (desired - already).min(budget).min(candidates.len());
            for peer in candidates.into_iter().take(need_more) {
                let outbound = shared.connections.get(&peer).map(|c| c.outbound_tx.clone());
                if let Some(tx) = outbound {
                    if tx.try_send(Frame::PieceRequest { piece_id: index }).is_ok() {
                        shared.pending.entry(index).or_default().push(PendingRequest {
                            peer,
                            started_at: Instant::now(),
                        });
                        budget -= 1;
                    }
                }
            }
        }
    }

    fn ensure_interested(&self, shared: &mut Shared, peer: &PeerAddress) {
        if let Some(conn) = shared.connections.get_mut(peer) {
            if !conn.flags.am_interested {
                conn.flags.am_interested = true;
                let _ = conn.outbound_tx.try_send(Frame::Interested);
            }
        }
    }

    async fn choke_recompute(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.conf.choking_interval);
        loop {
            interval.tick().await;
            self.recompute_unchoked().await;
        }
    }

    async fn recompute_unchoked(&self) {
        let (new_unchoked, transitions) = {
            let mut shared = self.shared.lock();
            let interested: HashSet<PeerAddress> = shared
                .connections
                .iter()
                .filter(|(_, c)| c.flags.peer_interested)
                .map(|(p, _)| p.clone())
                .collect();
            let Shared {
                ref mut upload_slots,
                ref stats,
                ..
            } = *shared;
            let new_unchoked = upload_slots.tick(stats, &interested);

            let to_choke: Vec<PeerAddress> =
                shared.unchoked.difference(&new_unchoked).cloned().collect();
            let to_unchoke: Vec<PeerAddress> =
                new_unchoked.difference(&shared.unchoked).cloned().collect();

            for peer in &to_choke {
                if let Some(conn) = shared.connections.get_mut(peer) {
                    conn.flags.am_choking = true;
                }
            }
            for peer in &to_unchoke {
                if let Some(conn) = shared.connections.get_mut(peer) {
                    conn.flags.am_choking = false;
                }
            }
            shared.unchoked = new_unchoked.clone();
            (new_unchoked, (to_choke, to_unchoke))
        };
        let (to_choke, to_unchoke) = transitions;
        for peer in to_choke {
            self.send_to(&peer, Frame::Choke).await;
        }
        for peer in to_unchoke {
            self.send_to(&peer, Frame::Unchoke).await;
        }
        log::trace!("unchoked set is now {:?}", new_unchoked);
    }

    async fn send_to(&self, peer: &PeerAddress, frame: Frame) {
        let outbound = self.shared.lock().connections.get(peer).map(|c| c.outbound_tx.clone());
        if let Some(tx) = outbound {
            let _ = tx.try_send(frame);
        }
    }

    async fn timeout_sweep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            self.sweep_once();
        }
    }

    fn sweep_once(&self) {
        let Ok(store) = self.piece_store() else { return };

        for index in store.sweep_timeouts(self.conf.request_timeout) {
            let mut shared = self.shared.lock();
            shared.pending.remove(&index);
            shared.priority.push_back(index);
        }

        let mut shared = self.shared.lock();
        let timeout = self.conf.request_timeout;
        let mut freed = Vec::new();
        for (&index, reqs) in shared.pending.iter_mut() {
            let before = reqs.len();
            reqs.retain(|r| r.started_at.elapsed() < timeout);
            if reqs.is_empty() && before > 0 {
                freed.push(index);
            }
        }
        for index in &freed {
            shared.pending.remove(index);
            shared.priority.push_back(*index);
        }
        drop(shared);
        for index in freed {
            store.release(index);
        }
    }

    async fn tracker_heartbeat(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.conf.heartbeat_interval);
        loop {
            interval.tick().await;
            if self.tracker_conn.lock().await.is_some() {
                self.announce_to_tracker().await;
            } else if self.tracker_addr.lock().is_some() {
                log::info!("tracker link down, attempting reconnect");
                if let Err(e) = self.dial_tracker().await {
                    log::warn!("tracker reconnect failed: {}", e);
                }
            }
        }
    }
}

fn drop_release(piece_store: &OnceCell<PieceStore>, index: PieceIndex) {
    if let Some(store) = piece_store.get() {
        store.release(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::Digest;

    fn make_info(piece_len: usize, data: &[u8]) -> TorrentInfo {
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_len) {
            let digest = sha1::Sha1::digest(chunk);
            pieces.extend_from_slice(&digest);
        }
        TorrentInfo {
            name: "test-payload".to_string(),
            info_hash: [0u8; 20],
            pieces,
            piece_len,
            len: data.len() as u64,
            trackers: Vec::new(),
        }
    }

    fn test_conf() -> Conf {
        Conf {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            choking_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            ..Conf::new("127.0.0.1", 0)
        }
    }

    #[test]
    fn test_new_node_starts_in_peer_discovery() {
        let info = make_info(4, &[1, 2, 3, 4]);
        let (tx, _rx) = alert::channel();
        let node = Node::new(test_conf(), info, tx);
        assert_eq!(node.state(), NodeStateTag::PeerDiscovery);
    }

    #[test]
    fn test_configure_piece_store_is_single_shot() {
        let data = vec![7u8; 8];
        let info = make_info(4, &data);
        let (tx, _rx) = alert::channel();
        let node = Node::new(test_conf(), info, tx);

        assert!(matches!(node.piece_store(), Err(NodeError::NotConfigured)));

        let dir = tempfile::tempdir().unwrap();
        node.configure_piece_store(dir.path()).unwrap();
        assert!(node.piece_store().is_ok());

        let err = node.configure_piece_store(dir.path()).unwrap_err();
        assert!(matches!(err, NodeError::AlreadyConfigured));
    }

    #[test]
    fn test_set_seeder_marks_complete_and_seeding() {
        let data = vec![9u8; 8];
        let info = make_info(4, &data);
        let (tx, _rx) = alert::channel();
        let node = Node::new(test_conf(), info, tx);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test-payload"), &data).unwrap();
        node.configure_piece_store(dir.path()).unwrap();

        node.set_seeder().unwrap();
        assert!(node.is_complete());
        assert_eq!(node.state(), NodeStateTag::Seeding);
    }

    #[tokio::test]
    async fn test_sweep_once_releases_timed_out_request() {
        let data = vec![1u8; 4];
        let info = make_info(4, &data);
        let (tx, _rx) = alert::channel();
        let mut conf = test_conf();
        conf.request_timeout = Duration::from_millis(10);
        let node = Node::new(conf, info, tx);

        let dir = tempfile::tempdir().unwrap();
        node.configure_piece_store(dir.path()).unwrap();

        let store = node.piece_store().unwrap().clone();
        let index = store.claim(store.needed(), None).unwrap();
        let peer: PeerAddress = "10.0.0.9:9000".parse().unwrap();
        node.shared.lock().pending.insert(
            index,
            vec![PendingRequest {
                peer,
                started_at: Instant::now(),
            }],
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        node.sweep_once();

        assert!(!node.shared.lock().pending.contains_key(&index));
        assert!(node.shared.lock().priority.contains(&index));
        assert!(store.needed().contains(&index));
    }

    #[tokio::test]
    async fn test_handle_piece_response_rejects_bad_data_without_crediting_peer() {
        let data = vec![5u8; 4];
        let info = make_info(4, &data);
        let (tx, mut rx) = alert::channel();
        let node = Node::new(test_conf(), info, tx);

        let dir = tempfile::tempdir().unwrap();
        node.configure_piece_store(dir.path()).unwrap();
        let store = node.piece_store().unwrap().clone();
        let index = store.claim(store.needed(), None).unwrap();

        let peer: PeerAddress = "10.0.0.1:9000".parse().unwrap();
        node.shared.lock().pending.insert(
            index,
            vec![PendingRequest {
                peer: peer.clone(),
                started_at: Instant::now(),
            }],
        );

        node.handle_piece_response(&peer, index, vec![0, 0, 0, 0]).await;

        assert!(store.needed().contains(&index));
        assert!(node.shared.lock().stats.get(&peer).is_none());
        assert!(matches!(rx.try_recv(), Ok(Alert::Error(_))));
    }

    #[tokio::test]
    async fn test_handle_piece_response_accepts_good_data_and_completes() {
        let data = vec![3u8; 4];
        let info = make_info(4, &data);
        let (tx, mut rx) = alert::channel();
        let node = Node::new(test_conf(), info, tx);

        let dir = tempfile::tempdir().unwrap();
        node.configure_piece_store(dir.path()).unwrap();
        let store = node.piece_store().unwrap().clone();
        let index = store.claim(store.needed(), None).unwrap();

        let peer: PeerAddress = "10.0.0.2:9000".parse().unwrap();
        node.shared.lock().pending.insert(
            index,
            vec![PendingRequest {
                peer: peer.clone(),
                started_at: Instant::now(),
            }],
        );

        node.handle_piece_response(&peer, index, data).await;

        assert!(store.is_complete());
        assert!(node.is_complete());
        assert_eq!(node.state(), NodeStateTag::Seeding);
        assert!(node.shared.lock().stats.contains_key(&peer));
        assert!(matches!(rx.try_recv(), Ok(Alert::PieceCompleted { .. })));
        assert!(matches!(rx.try_recv(), Ok(Alert::TorrentComplete)));
    }

    #[tokio::test]
    async fn test_two_nodes_exchange_piece_over_real_connection() {
        let data = b"abcdefghijklmnop".to_vec();
        let info = make_info(4, &data);

        let (seed_tx, _seed_rx) = alert::channel();
        let seed_dir = tempfile::tempdir().unwrap();
        std::fs::write(seed_dir.path().join("test-payload"), &data).unwrap();
        let seeder = Node::new(test_conf(), info.clone(), seed_tx);
        seeder.configure_piece_store(seed_dir.path()).unwrap();
        seeder.set_seeder().unwrap();
        let seeder_addr = seeder.start().await.unwrap();

        let (leech_tx, _leech_rx) = alert::channel();
        let leech_dir = tempfile::tempdir().unwrap();
        let leecher = Node::new(test_conf(), info.clone(), leech_tx);
        leecher.configure_piece_store(leech_dir.path()).unwrap();
        leecher.start().await.unwrap();

        let seeder_peer: PeerAddress = seeder_addr.into();
        {
            let mut shared = leecher.shared.lock();
            shared
                .swarm
                .insert(seeder_peer.clone(), (0..info.piece_count()).collect());
            // bypass the peer-discovery wait (it only advances once
            // `DISCOVERY_MIN_PEERS` connections accumulate or its 30s
            // timeout elapses): this test connects exactly one peer
            // directly rather than through the coordination service.
            shared.state = NodeStateTag::Downloading;
        }
        leecher.clone().connect_to_peer(seeder_peer).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while !leecher.is_complete() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(leecher.is_complete());
        assert_eq!(
            std::fs::read(leech_dir.path().join("test-payload")).unwrap(),
            data
        );

        leecher.stop().await;
        seeder.stop().await;
    }

    /// Two leechers, one seeder: leecher A pulls the whole file from the
    /// seeder, then leecher B pulls it from leecher A rather than the
    /// seeder. Demonstrates that piece serving fans out across the swarm
    /// instead of funneling every download through the original seeder.
    #[tokio::test]
    async fn test_two_leechers_share_piece_peer_to_peer() {
        let data = b"abcdefghijklmnopqrstuvwx".to_vec();
        let info = make_info(4, &data);

        let (seed_tx, _seed_rx) = alert::channel();
        let seed_dir = tempfile::tempdir().unwrap();
        std::fs::write(seed_dir.path().join("test-payload"), &data).unwrap();
        let seeder = Node::new(test_conf(), info.clone(), seed_tx);
        seeder.configure_piece_store(seed_dir.path()).unwrap();
        seeder.set_seeder().unwrap();
        let seeder_addr = seeder.start().await.unwrap();
        let seeder_peer: PeerAddress = seeder_addr.into();

        let (a_tx, _a_rx) = alert::channel();
        let a_dir = tempfile::tempdir().unwrap();
        let leecher_a = Node::new(test_conf(), info.clone(), a_tx);
        leecher_a.configure_piece_store(a_dir.path()).unwrap();
        let a_addr = leecher_a.start().await.unwrap();
        let a_peer: PeerAddress = a_addr.into();

        {
            let mut shared = leecher_a.shared.lock();
            shared
                .swarm
                .insert(seeder_peer.clone(), (0..info.piece_count()).collect());
            shared.state = NodeStateTag::Downloading;
        }
        leecher_a.clone().connect_to_peer(seeder_peer).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while !leecher_a.is_complete() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(leecher_a.is_complete());

        let (b_tx, _b_rx) = alert::channel();
        let b_dir = tempfile::tempdir().unwrap();
        let leecher_b = Node::new(test_conf(), info.clone(), b_tx);
        leecher_b.configure_piece_store(b_dir.path()).unwrap();
        leecher_b.start().await.unwrap();

        {
            let mut shared = leecher_b.shared.lock();
            shared
                .swarm
                .insert(a_peer.clone(), (0..info.piece_count()).collect());
            shared.state = NodeStateTag::Downloading;
        }
        leecher_b.clone().connect_to_peer(a_peer).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while !leecher_b.is_complete() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(leecher_b.is_complete());
        assert_eq!(
            std::fs::read(b_dir.path().join("test-payload")).unwrap(),
            data
        );

        // leecher_b never dialed the seeder directly: every byte it got
        // came through leecher_a, so the seeder's lifetime upload stays at
        // exactly one copy of the file rather than growing with swarm size.
        assert_eq!(seeder.total_uploaded(), data.len() as u64);
        assert!(leecher_a.total_uploaded() > 0);

        leecher_b.stop().await;
        leecher_a.stop().await;
        seeder.stop().await;
    }

    /// Forces the endgame regime from the first tick (threshold 0.0) with
    /// two candidate peers for a single missing piece. One peer answers
    /// the duplicate request; the other must receive a `cancel_request`
    /// once the winning response lands, per spec `4.4`'s endgame
    /// duplication/cancellation contract.
    #[tokio::test]
    async fn test_endgame_cancels_losing_duplicate_request() {
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::Framed;

        use crate::frame::FrameCodec;

        let data = b"abcd".to_vec();
        let info = make_info(4, &data);

        let mut conf = test_conf();
        conf.endgame_threshold_fraction = 0.0;
        conf.endgame_duplication = 2;

        let (tx, _rx) = alert::channel();
        let leech_dir = tempfile::tempdir().unwrap();
        let leecher = Node::new(conf, info.clone(), tx);
        leecher.configure_piece_store(leech_dir.path()).unwrap();
        leecher.start().await.unwrap();

        let winner_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let winner_addr = winner_listener.local_addr().unwrap();
        let loser_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let loser_addr = loser_listener.local_addr().unwrap();

        let winner_data = data.clone();
        let winner_task = tokio::spawn(async move {
            let (stream, _) = winner_listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new(2 * 1024 * 1024));
            framed.send(Frame::Unchoke).await.unwrap();
            match framed.next().await {
                Some(Ok(Frame::PieceRequest { piece_id })) => {
                    framed
                        .send(Frame::PieceResponse { piece_id, data: winner_data })
                        .await
                        .unwrap();
                }
                other => panic!("expected piece_request, got {:?}", other),
            }
        });

        let loser_task = tokio::spawn(async move {
            let (stream, _) = loser_listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new(2 * 1024 * 1024));
            framed.send(Frame::Unchoke).await.unwrap();
            let _ = framed.next().await; // drain the piece_request, never answer it
            match tokio::time::timeout(Duration::from_secs(5), framed.next()).await {
                Ok(Some(Ok(Frame::CancelRequest { piece_id }))) => assert_eq!(piece_id, 0),
                other => panic!("expected cancel_request, got {:?}", other),
            }
        });

        {
            let mut shared = leecher.shared.lock();
            shared.swarm.insert(winner_addr.into(), vec![0]);
            shared.swarm.insert(loser_addr.into(), vec![0]);
            shared.state = NodeStateTag::Downloading;
        }
        leecher.clone().connect_to_peer(winner_addr.into()).await;
        leecher.clone().connect_to_peer(loser_addr.into()).await;

        winner_task.await.unwrap();
        loser_task.await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !leecher.is_complete() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(leecher.is_complete());

        leecher.stop().await;
    }
}
