//! Parsing of `.torrent` metainfo files and `magnet:?` URIs.
//!
//! Only single-file torrents are supported; a `.torrent` describing
//! `info.files` is rejected with [`MetainfoError::MultiFileUnsupported`].

use std::fmt;

use url::Url;

use crate::error::metainfo::MetainfoError;
use crate::Sha1Hash;

pub type Result<T, E = MetainfoError> = std::result::Result<T, E>;

/// The parsed, verified metainfo for a single-file torrent.
#[derive(Clone)]
pub struct TorrentInfo {
    /// Torrent name; also the filename the downloaded content is saved as.
    pub name: String,
    /// SHA-1 of the bencoded `info` dictionary, used as the torrent's
    /// identity when announcing to the coordination service.
    pub info_hash: Sha1Hash,
    /// Concatenation of each piece's SHA-1 hash, 20 bytes per piece.
    pub pieces: Vec<u8>,
    /// Size of each piece in bytes (the last piece may be shorter).
    pub piece_len: usize,
    /// Total size of the file in bytes.
    pub len: u64,
    /// The coordination services that can be announced to.
    pub trackers: Vec<Url>,
}

impl fmt::Debug for TorrentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentInfo")
            .field("name", &self.name)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("pieces", &"<pieces...>")
            .field("piece_len", &self.piece_len)
            .field("len", &self.len)
            .finish()
    }
}

impl TorrentInfo {
    /// Number of pieces in the torrent, derived from `pieces.len() / 20`.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The expected SHA-1 hash of piece `index`, or `None` if out of range.
    pub fn piece_hash(&self, index: usize) -> Option<&[u8]> {
        let start = index * 20;
        self.pieces.get(start..start + 20)
    }

    /// Byte length of piece `index`, accounting for a possibly shorter last
    /// piece. Returns `None` if out of range.
    pub fn piece_len_at(&self, index: usize) -> Option<usize> {
        let count = self.piece_count();
        if index >= count {
            return None;
        }
        if index == count - 1 {
            let rem = (self.len as usize) % self.piece_len;
            Some(if rem == 0 { self.piece_len } else { rem })
        } else {
            Some(self.piece_len)
        }
    }

    /// Parses and verifies a `.torrent` file's bencoded bytes.
    ///
    /// Rules enforced:
    /// - the bencode must be well-formed and match the expected schema.
    /// - `pieces` must be a multiple of 20 bytes.
    /// - `info.files` must be absent; multi-file torrents are unsupported.
    /// - `info.length` must be present and non-zero.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let metainfo: raw::Metainfo = serde_bencode::from_bytes(bytes)?;

        if metainfo.info.pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPieces);
        }

        if metainfo.info.files.is_some() {
            return Err(MetainfoError::MultiFileUnsupported);
        }

        let len = metainfo
            .info
            .len
            .filter(|&len| len > 0)
            .ok_or(MetainfoError::InvalidPieces)?;

        let mut trackers = Vec::new();
        if !metainfo.announce_list.is_empty() {
            for announce in metainfo.announce_list.iter() {
                for tracker in announce.iter() {
                    if let Ok(url) = Url::parse(tracker) {
                        trackers.push(url);
                    }
                }
            }
        } else if let Some(tracker) = &metainfo.announce {
            trackers.push(Url::parse(tracker)?);
        }

        let info_hash = metainfo.info_hash()?;

        Ok(TorrentInfo {
            name: metainfo.info.name,
            info_hash,
            pieces: metainfo.info.pieces,
            piece_len: metainfo.info.piece_len,
            len,
            trackers,
        })
    }

    /// Parses a `magnet:?xt=urn:btih:<40-hex>&dn=<name>&tr=<url>` URI.
    ///
    /// Magnet links carry no piece hashes, so a [`TorrentInfo`] built this
    /// way has an empty `pieces` list; the caller is expected to obtain the
    /// full metainfo out of band (e.g. from a peer) before starting a
    /// download. This is primarily useful for identifying a swarm to the
    /// coordination service ahead of time.
    pub fn from_magnet(uri: &str) -> Result<MagnetLink> {
        let url = Url::parse(uri).map_err(|_| MetainfoError::InvalidMagnetUri(uri.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(MetainfoError::InvalidMagnetUri(
                "scheme must be magnet".to_string(),
            ));
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let hex_part = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| MetainfoError::InvalidMagnetUri(value.to_string()))?;
                    if hex_part.len() != 40 {
                        return Err(MetainfoError::InvalidMagnetUri(value.to_string()));
                    }
                    let bytes = hex::decode(hex_part)
                        .map_err(|_| MetainfoError::InvalidMagnetUri(value.to_string()))?;
                    let mut hash = [0u8; 20];
                    hash.copy_from_slice(&bytes);
                    info_hash = Some(hash);
                }
                "dn" => name = Some(value.to_string()),
                "tr" => {
                    if let Ok(tracker_url) = Url::parse(&value) {
                        trackers.push(tracker_url);
                    }
                }
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            MetainfoError::InvalidMagnetUri("missing xt=urn:btih: topic".to_string())
        })?;

        if trackers.is_empty() {
            return Err(MetainfoError::RequiresDht);
        }

        Ok(MagnetLink {
            info_hash,
            name,
            trackers,
        })
    }
}

/// The fields recoverable from a `magnet:?` URI alone, without a
/// `.torrent` file.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: Sha1Hash,
    pub name: Option<String>,
    pub trackers: Vec<Url>,
}

mod raw {
    //! Shapes matching the bencode dictionary layout exactly, kept separate
    //! from [`super::TorrentInfo`] so the public type only exposes verified
    //! data.
    use serde_derive::{Deserialize, Serialize};
    use sha1::Digest;

    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct Metainfo {
        pub info: Info,
        pub announce: Option<String>,
        #[serde(default)]
        #[serde(rename = "announce-list")]
        pub announce_list: Vec<Vec<String>>,
    }

    impl Metainfo {
        pub fn info_hash(&self) -> Result<Sha1Hash> {
            let info = serde_bencode::to_bytes(&self.info)
                .map_err(|e| MetainfoError::Bencode(e))?;
            let digest = sha1::Sha1::digest(&info);
            let mut info_hash = [0; 20];
            info_hash.copy_from_slice(&digest);
            Ok(info_hash)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Info {
        pub name: String,
        #[serde(with = "serde_bytes")]
        pub pieces: Vec<u8>,
        #[serde(rename = "piece length")]
        pub piece_len: usize,
        #[serde(rename = "length")]
        pub len: Option<u64>,
        /// Present only on multi-file torrents; used solely to detect and
        /// reject them.
        pub files: Option<Vec<File>>,
        pub private: Option<u8>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct File {
        pub path: Vec<String>,
        #[serde(rename = "length")]
        pub len: u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_magnet_parses_topic_name_and_trackers() {
        let hash_hex = "a".repeat(40);
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=my-file.iso&tr=http%3A%2F%2Ftracker.example%3A7946",
            hash_hex
        );
        let magnet = TorrentInfo::from_magnet(&uri).unwrap();
        assert_eq!(magnet.info_hash, [0xaa; 20]);
        assert_eq!(magnet.name.as_deref(), Some("my-file.iso"));
        assert_eq!(magnet.trackers.len(), 1);
    }

    #[test]
    fn test_from_magnet_rejects_missing_topic() {
        let uri = "magnet:?dn=my-file.iso";
        assert!(TorrentInfo::from_magnet(uri).is_err());
    }

    #[test]
    fn test_from_magnet_without_tr_requires_dht() {
        let hash_hex = "b".repeat(40);
        let uri = format!("magnet:?xt=urn:btih:{}&dn=my-file.iso", hash_hex);
        assert!(matches!(
            TorrentInfo::from_magnet(&uri),
            Err(MetainfoError::RequiresDht)
        ));
    }

    #[test]
    fn test_from_magnet_rejects_wrong_scheme() {
        let uri = "http://example.com";
        assert!(TorrentInfo::from_magnet(uri).is_err());
    }
}
