//! The wire protocol shared by peer-to-peer connections and by connections
//! into the coordination service.
//!
//! A frame is a 4-byte big-endian length prefix followed by a JSON envelope
//! `{"type": "<frame_type>", "payload": <type-specific JSON>}`. Binary piece
//! bodies are hex-encoded so the whole frame remains valid JSON. The `type`
//! enumeration is closed: an unrecognized `type` fails to deserialize and is
//! reported as [`FrameError::Malformed`], which callers treat as grounds to
//! close the connection.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::frame::FrameError;

/// Number of bytes in the length prefix.
const LEN_PREFIX: usize = 4;

/// One entry in a `peer_list` snapshot: a peer's address and the pieces it
/// last reported having.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub address: String,
    pub pieces: Vec<usize>,
}

/// The closed set of frame types exchanged between nodes, and between a node
/// and the coordination service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    /// Announces a node's presence to the coordination service, or, on a
    /// peer connection, that the dialing side has completed its handshake.
    PeerJoined { address: String },

    /// The coordination service's reply to `peer_joined`/`get_peers`: the
    /// current swarm view.
    PeerList { peers: Vec<PeerEntry> },

    /// A request for a single whole piece.
    PieceRequest { piece_id: usize },

    /// The response to a `piece_request`, carrying the hex-encoded piece
    /// body.
    PieceResponse {
        piece_id: usize,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },

    /// Announces newly completed pieces to a peer or to the coordination
    /// service.
    UpdatePieces { pieces: Vec<usize> },

    /// Asks the coordination service for the current peer list of a swarm.
    GetPeers,

    /// Cancels a previously sent `piece_request`, used during endgame once
    /// a duplicate request elsewhere has already completed the piece.
    CancelRequest { piece_id: usize },

    /// Sent by a node shutting down cleanly so a peer or the coordination
    /// service can drop it immediately rather than waiting out the
    /// inactivity timeout.
    Stopped,

    /// Tit-for-tat interest signaling: the sender wants to download from
    /// the receiver.
    Interested,

    /// The inverse of `interested`.
    NotInterested,

    /// The sender will not serve piece requests from the receiver until an
    /// `unchoke` follows.
    Choke,

    /// The inverse of `choke`: the sender will now serve piece requests
    /// from the receiver.
    Unchoke,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A [`tokio_util::codec::Decoder`]/[`Encoder`] for [`Frame`], wrapping the
/// stream in a 4-byte big-endian length prefix and capping decoded payload
/// size at `max_frame_len`.
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(2 * 1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes(src[..LEN_PREFIX].try_into().unwrap()) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if src.len() < LEN_PREFIX + len {
            // not enough data yet, reserve the rest so the next read
            // doesn't reallocate
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let payload = src.split_to(len);

        let frame: Frame = serde_json::from_slice(&payload)
            .map_err(|e| FrameError::Malformed(e.to_string()))?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&frame).map_err(|e| FrameError::Malformed(e.to_string()))?;
        if payload.len() > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }

        dst.reserve(LEN_PREFIX + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Raw, untyped access to a frame's payload, used by the coordination
/// service when it only needs to peek at a frame's `type` before routing it.
pub fn peek_type(bytes: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(1024 * 1024)
    }

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        codec().encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec().decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_peer_joined() {
        roundtrip(Frame::PeerJoined {
            address: "127.0.0.1:6000".to_string(),
        });
    }

    #[test]
    fn test_roundtrip_peer_list_carries_per_peer_pieces() {
        roundtrip(Frame::PeerList {
            peers: vec![
                PeerEntry {
                    address: "127.0.0.1:6000".to_string(),
                    pieces: vec![0, 1, 2],
                },
                PeerEntry {
                    address: "127.0.0.1:6001".to_string(),
                    pieces: vec![],
                },
            ],
        });
    }

    #[test]
    fn test_roundtrip_piece_response_hex_encodes_data() {
        roundtrip(Frame::PieceResponse {
            piece_id: 3,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        });
    }

    #[test]
    fn test_roundtrip_unit_variants() {
        for frame in [
            Frame::GetPeers,
            Frame::Stopped,
            Frame::Interested,
            Frame::NotInterested,
            Frame::Choke,
            Frame::Unchoke,
        ] {
            roundtrip(frame);
        }
    }

    #[test]
    fn test_decode_incomplete_frame_returns_none() {
        let mut buf = BytesMut::new();
        codec().encode(Frame::GetPeers, &mut buf).unwrap();
        let mut partial = buf[..buf.len() - 1].into();
        assert_eq!(codec().decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn test_chunked_frame_stream() {
        let frames = vec![
            Frame::PeerJoined {
                address: "10.0.0.1:6001".to_string(),
            },
            Frame::Choke,
            Frame::PieceRequest { piece_id: 9 },
            Frame::CancelRequest { piece_id: 9 },
        ];

        let mut full = BytesMut::new();
        for frame in &frames {
            codec().encode(frame.clone(), &mut full).unwrap();
        }

        let mut read_buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in full.iter() {
            read_buf.put_u8(*byte);
            while let Some(frame) = codec().decode(&mut read_buf).unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_oversized_length_prefix_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        let mut small_codec = FrameCodec::new(10);
        assert!(matches!(
            small_codec.decode(&mut buf),
            Err(FrameError::TooLarge { len: 100, max: 10 })
        ));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let mut buf = BytesMut::new();
        let payload = br#"{"type":"not_a_real_type","payload":null}"#;
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        assert!(matches!(
            codec().decode(&mut buf),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_peek_type() {
        let mut buf = BytesMut::new();
        codec()
            .encode(Frame::PieceRequest { piece_id: 1 }, &mut buf)
            .unwrap();
        let payload = &buf[LEN_PREFIX..];
        assert_eq!(peek_type(payload).as_deref(), Some("piece_request"));
    }
}
