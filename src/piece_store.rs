//! The piece store (`C3`): tracks which pieces of a torrent are wanted, in
//! flight, or complete, and owns the single backing file pieces are read
//! from and written to.
//!
//! Unlike a general-purpose BitTorrent client, this engine deals only in
//! single-file, whole-piece transfers: there is no block subdivision, and
//! a piece is written to disk in one shot only after its SHA-1 has been
//! verified.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sha1::Digest;

use crate::define::PeerAddress;
use crate::error::piece_store::{PieceStoreError, Result};
use crate::metainfo::TorrentInfo;

/// The state of a single piece, tracked from the moment a node starts
/// wanting it until it is verified on disk.
///
/// `PendingVerify` has no stored representation here: a submitted piece is
/// hashed and, in the same critical section, either written and flipped to
/// `Complete` or rejected and released back to `Missing`. No caller can ever
/// observe a piece parked mid-verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceState {
    /// Not yet requested from any peer.
    Missing,
    /// Requested from a peer; not yet verified. Carries the instant the
    /// request was issued, so a sweep can find requests that timed out.
    InFlight {
        started_at: Instant,
        peer: Option<PeerAddress>,
    },
    /// Hashed, matched the expected digest, and written to disk.
    Complete,
}

struct Shared {
    info: TorrentInfo,
    states: Vec<PieceState>,
    file: File,
}

/// A cloneable handle to the piece store's shared state. All state lives
/// behind a single [`parking_lot::Mutex`], matching the one-mutex-per-map
/// convention used for the rest of this engine's shared tables.
#[derive(Clone)]
pub struct PieceStore {
    shared: Arc<Mutex<Shared>>,
}

impl PieceStore {
    /// Opens (creating if necessary) the backing file at `path`, pre-
    /// allocating it to the torrent's full length, with every piece
    /// initially `Missing`.
    pub fn new(info: TorrentInfo, path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(info.len)?;

        let piece_count = info.piece_count();
        let states = vec![PieceState::Missing; piece_count];

        Ok(Self {
            shared: Arc::new(Mutex::new(Shared { info, states, file })),
        })
    }

    /// Marks every piece `Complete` without touching the backing file, for
    /// a node that starts out seeding a file it already has on disk.
    pub fn set_seeder(&self) {
        let mut shared = self.shared.lock();
        shared.states.fill(PieceState::Complete);
    }

    /// Re-reads and re-hashes every piece currently marked `Complete`
    /// against the torrent's expected digests, demoting any mismatch back
    /// to `Missing`. Used after [`PieceStore::set_seeder`] to confirm a
    /// file claimed to be complete actually is, and after a crash to
    /// recover a partially-written backing file.
    pub fn rehash_existing(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        let piece_count = shared.states.len();
        for index in 0..piece_count {
            if shared.states[index] != PieceState::Complete {
                continue;
            }
            match read_and_verify(&mut shared, index) {
                Ok(true) => {}
                Ok(false) | Err(_) => shared.states[index] = PieceState::Missing,
            }
        }
        Ok(())
    }

    /// Claims the first `Missing` piece among `candidates`, marking it
    /// `InFlight` against `peer` and returning its index. Returns `None` if
    /// none of `candidates` are currently `Missing`.
    pub fn claim(
        &self,
        candidates: impl IntoIterator<Item = usize>,
        peer: Option<PeerAddress>,
    ) -> Option<usize> {
        let mut shared = self.shared.lock();
        for index in candidates {
            if shared.states.get(index) == Some(&PieceState::Missing) {
                shared.states[index] = PieceState::InFlight {
                    started_at: Instant::now(),
                    peer,
                };
                return Some(index);
            }
        }
        None
    }

    /// Releases an `InFlight` piece back to `Missing`, e.g. after a timeout
    /// or a peer disconnecting mid-request.
    pub fn release(&self, index: usize) {
        let mut shared = self.shared.lock();
        if let Some(state) = shared.states.get_mut(index) {
            if matches!(state, PieceState::InFlight { .. }) {
                *state = PieceState::Missing;
            }
        }
    }

    /// Verifies `data` against piece `index`'s expected SHA-1 and, if it
    /// matches, writes it to disk and marks the piece `Complete`. Returns
    /// `Err(PieceStoreError::VerificationFailed)` without writing anything
    /// if the hash doesn't match; the caller is expected to call
    /// [`PieceStore::release`] in that case so the piece can be
    /// re-requested.
    pub fn submit(&self, index: usize, data: &[u8]) -> Result<()> {
        let mut shared = self.shared.lock();

        let expected = shared
            .info
            .piece_hash(index)
            .ok_or(PieceStoreError::InvalidPieceIndex(index))?;
        let digest = sha1::Sha1::digest(data);
        if digest.as_slice() != expected {
            return Err(PieceStoreError::VerificationFailed(index));
        }

        let offset = (index * shared.info.piece_len) as u64;
        shared.file.seek(SeekFrom::Start(offset))?;
        shared.file.write_all(data)?;
        shared.file.sync_data()?;
        shared.states[index] = PieceState::Complete;
        Ok(())
    }

    /// Returns the indices of every `Missing` piece, used to seed the
    /// scheduler's candidate set. A piece already `InFlight` has a request
    /// outstanding and isn't a fresh candidate; it only becomes one again
    /// via [`PieceStore::release`] (timeout, bad verification, peer drop).
    pub fn needed(&self) -> Vec<usize> {
        let shared = self.shared.lock();
        shared
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == PieceState::Missing)
            .map(|(i, _)| i)
            .collect()
    }

    /// `true` if piece `index` has been verified and written to disk.
    pub fn has_piece(&self, index: usize) -> bool {
        let shared = self.shared.lock();
        shared.states.get(index) == Some(&PieceState::Complete)
    }

    /// Returns the indices of every `InFlight` piece whose request has been
    /// outstanding longer than `timeout`, releasing them back to `Missing`
    /// as a side effect.
    pub fn sweep_timeouts(&self, timeout: std::time::Duration) -> Vec<usize> {
        let mut shared = self.shared.lock();
        let mut timed_out = Vec::new();
        for (index, state) in shared.states.iter_mut().enumerate() {
            if let PieceState::InFlight { started_at, .. } = state {
                if started_at.elapsed() >= timeout {
                    timed_out.push(index);
                    *state = PieceState::Missing;
                }
            }
        }
        timed_out
    }

    /// `true` once every piece is `Complete`.
    pub fn is_complete(&self) -> bool {
        let shared = self.shared.lock();
        shared.states.iter().all(|s| *s == PieceState::Complete)
    }

    /// Fraction of pieces that are `Complete`, in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        let shared = self.shared.lock();
        let complete = shared
            .states
            .iter()
            .filter(|s| **s == PieceState::Complete)
            .count();
        complete as f64 / shared.states.len() as f64
    }

    /// Reads a complete, verified piece's bytes from disk. The caller must
    /// have confirmed the piece is `Complete`; reading a piece that has not
    /// yet been written returns whatever zero-filled bytes `set_len` left
    /// there.
    pub fn read(&self, index: usize) -> Result<Vec<u8>> {
        let mut shared = self.shared.lock();
        read_piece(&mut shared, index)
    }

    pub fn piece_count(&self) -> usize {
        self.shared.lock().states.len()
    }

    /// Returns the indices of every piece currently `Complete`, used to
    /// build the bitmap announced in `update_pieces` heartbeats.
    pub fn completed(&self) -> Vec<usize> {
        let shared = self.shared.lock();
        shared
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == PieceState::Complete)
            .map(|(i, _)| i)
            .collect()
    }
}

fn read_piece(shared: &mut Shared, index: usize) -> Result<Vec<u8>> {
    let len = shared
        .info
        .piece_len_at(index)
        .ok_or(PieceStoreError::InvalidPieceIndex(index))?;
    let offset = (index * shared.info.piece_len) as u64;
    let mut buf = vec![0u8; len];
    shared.file.seek(SeekFrom::Start(offset))?;
    shared.file.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_and_verify(shared: &mut Shared, index: usize) -> Result<bool> {
    let data = read_piece(shared, index)?;
    let expected = shared
        .info
        .piece_hash(index)
        .ok_or(PieceStoreError::InvalidPieceIndex(index))?;
    Ok(sha1::Sha1::digest(&data).as_slice() == expected)
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
            name: "test".to_string(),
            info_hash: [0u8; 20],
            pieces,
            piece_len,
            len: data.len() as u64,
            trackers: Vec::new(),
        }
    }

    #[test]
    fn test_claim_then_submit_marks_complete() {
        let data = vec![7u8; 8];
        let info = make_info(4, &data);
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(info, dir.path().join("file")).unwrap();

        let index = store.claim(store.needed(), None).unwrap();
        assert_eq!(index, 0);
        store.submit(index, &data[0..4]).unwrap();
        assert_eq!(store.read(0).unwrap(), data[0..4]);
        assert!(!store.is_complete());

        let index = store.claim(store.needed(), None).unwrap();
        store.submit(index, &data[4..8]).unwrap();
        assert!(store.is_complete());
    }

    #[test]
    fn test_submit_rejects_bad_hash() {
        let data = vec![7u8; 4];
        let info = make_info(4, &data);
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(info, dir.path().join("file")).unwrap();

        let index = store.claim(store.needed(), None).unwrap();
        let err = store.submit(index, &[0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, PieceStoreError::VerificationFailed(0)));
        // a rejected piece stays `InFlight`, not a fresh candidate, until
        // the caller releases it (as `Node::handle_piece_response` does).
        assert!(store.needed().is_empty());
        store.release(index);
        assert_eq!(store.needed(), vec![0]);
    }

    #[test]
    fn test_sweep_timeouts_releases_stale_requests() {
        let data = vec![1u8; 4];
        let info = make_info(4, &data);
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(info, dir.path().join("file")).unwrap();

        let peer: PeerAddress = "127.0.0.1:9001".parse().unwrap();
        store.claim(store.needed(), Some(peer)).unwrap();
        let timed_out = store.sweep_timeouts(std::time::Duration::from_secs(0));
        assert_eq!(timed_out, vec![0]);
        assert_eq!(store.needed(), vec![0]);
    }

    #[test]
    fn test_set_seeder_then_rehash_detects_corruption() {
        let data = vec![9u8; 4];
        let info = make_info(4, &data);
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::new(info, dir.path().join("file")).unwrap();
        store.set_seeder();
        assert!(store.is_complete());

        // backing file is still all zeros; rehash should demote it
        store.rehash_existing().unwrap();
        assert!(!store.is_complete());
        assert_eq!(store.needed(), vec![0]);
    }
}
