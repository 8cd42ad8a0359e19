//! A single peer-to-peer connection: framing, dialing/accepting, and the
//! reader/writer task pair that bridges a [`tokio::net::TcpStream`] to
//! channels the owning [`crate::node::Node`] drives.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::define::PeerAddress;
use crate::error::connection::{ConnectionError, Result};
use crate::frame::{Frame, FrameCodec};

/// The channel on which a connection's owner pushes frames to be sent to
/// the peer. Bounded: a peer that isn't reading is a peer we stop talking
/// to rather than buffer unboundedly for.
pub type OutboundSender = mpsc::Sender<Frame>;
type OutboundReceiver = mpsc::Receiver<Frame>;

/// The channel on which a connection reports inbound frames and lifecycle
/// events to its owner.
pub type EventSender = UnboundedSender<ConnectionEvent>;
pub type EventReceiver = UnboundedReceiver<ConnectionEvent>;

/// Capacity of a connection's outbound queue before it is considered
/// unresponsive and torn down.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Per-connection choke/interest flags, mirroring the tit-for-tat state
/// machine described for `C2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionFlags {
    /// We are not currently serving piece requests from this peer.
    pub am_choking: bool,
    /// We want to download from this peer.
    pub am_interested: bool,
    /// This peer is not currently serving our piece requests.
    pub peer_choking: bool,
    /// This peer wants to download from us.
    pub peer_interested: bool,
}

impl ConnectionFlags {
    /// The conventional initial state: both sides start choked and
    /// uninterested until a frame says otherwise.
    pub fn initial() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Events a connection's reader task reports to the owning node.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A frame arrived from the named peer.
    Frame(PeerAddress, Frame),
    /// The connection to the named peer closed, cleanly or otherwise.
    Closed(PeerAddress),
}

/// A handle to a spawned connection: the sender half of its outbound queue
/// plus the join handles of its two tasks, kept around so a caller can
/// await them when tearing the connection down.
pub struct Connection {
    pub peer: PeerAddress,
    pub outbound_tx: OutboundSender,
    pub flags: ConnectionFlags,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
}

impl Connection {
    /// Dials `peer`, retrying up to `max_retries` times with `retry_delay`
    /// between attempts before giving up.
    pub async fn dial(
        peer: PeerAddress,
        max_frame_len: usize,
        max_retries: usize,
        retry_delay: Duration,
        events: EventSender,
    ) -> Result<Self> {
        let addr = peer
            .to_socket_addr()
            .map_err(|e| ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    log::warn!("dial to {} failed ({}), retrying ({}/{})", peer, e, attempt, max_retries);
                    tokio::time::sleep(retry_delay).await;
                }
                Err(_) => return Err(ConnectionError::DialExhausted(max_retries)),
            }
        };

        Ok(Self::from_stream(peer, stream, max_frame_len, events))
    }

    /// Wraps an already-connected socket, e.g. one returned by
    /// `TcpListener::accept`.
    pub fn from_stream(
        peer: PeerAddress,
        stream: TcpStream,
        max_frame_len: usize,
        events: EventSender,
    ) -> Self {
        let framed = Framed::new(stream, FrameCodec::new(max_frame_len));
        let (mut sink, mut source) = framed.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        let reader_peer = peer.clone();
        let reader_events = events.clone();
        let reader_handle = tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(frame)) => {
                        if reader_events
                            .send(ConnectionEvent::Frame(reader_peer.clone(), frame))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("connection to {} errored: {}", reader_peer, e);
                        break;
                    }
                    None => break,
                }
            }
            let _ = reader_events.send(ConnectionEvent::Closed(reader_peer));
        });

        let writer_peer = peer.clone();
        let writer_handle = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    log::warn!("write side of connection to {} failed", writer_peer);
                    break;
                }
            }
        });

        Self {
            peer,
            outbound_tx,
            flags: ConnectionFlags::initial(),
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
        }
    }

    /// Queues `frame` to be sent to the peer. Fails if the outbound queue is
    /// full, which the owner should treat as fatal for this connection.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outbound_tx
            .try_send(frame)
            .map_err(|_| ConnectionError::OutboundQueueFull)
    }

    /// Tears down the reader and writer tasks. Idempotent: a second call on
    /// an already-closed connection is a no-op.
    pub async fn close(&mut self) {
        if let Some(h) = self.reader_handle.take() {
            h.abort();
        }
        if let Some(h) = self.writer_handle.take() {
            h.abort();
        }
    }
}

