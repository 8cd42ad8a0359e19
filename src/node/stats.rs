//! Per-peer throughput tracking, used by [`crate::scheduler::upload_slots`]
//! to rank peers for tit-for-tat unchoking.

use std::time::{Duration, Instant};

use crate::avg::SlidingAvg;

/// Rolling download/upload rate for one connection, in bytes/second.
///
/// Uses the same fixed-point exponential moving average as the rest of
/// this engine's rate tracking ([`crate::avg::SlidingAvg`]) rather than a
/// naive `bytes_transferred / elapsed` instantaneous rate, so a single slow
/// or fast transfer doesn't make a peer's rank swing wildly between ticks.
#[derive(Debug)]
pub struct PeerStats {
    pub download: SlidingAvg,
    pub upload: SlidingAvg,
    pub last_updated: Instant,
    /// Cumulative bytes downloaded from / uploaded to this peer, per spec
    /// `3`'s "Connection ... byte counters (up, down)". Kept alongside the
    /// rolling rate rather than duplicating it onto `Connection`, since
    /// every counter consumer (tit-for-tat ranking, this total) already
    /// reads from `PeerStats`.
    pub total_downloaded: u64,
    pub total_uploaded: u64,
}

impl PeerStats {
    pub fn new() -> Self {
        Self {
            download: SlidingAvg::default(),
            upload: SlidingAvg::default(),
            last_updated: Instant::now(),
            total_downloaded: 0,
            total_uploaded: 0,
        }
    }

    /// Records `bytes` downloaded from this peer over `elapsed`, updating
    /// the rolling average in bytes/second.
    pub fn record_download(&mut self, bytes: usize, elapsed: Duration) {
        self.download.update(rate_bytes_per_sec(bytes, elapsed));
        self.total_downloaded += bytes as u64;
        self.last_updated = Instant::now();
    }

    /// Records `bytes` uploaded to this peer over `elapsed`.
    pub fn record_upload(&mut self, bytes: usize, elapsed: Duration) {
        self.upload.update(rate_bytes_per_sec(bytes, elapsed));
        self.total_uploaded += bytes as u64;
        self.last_updated = Instant::now();
    }
}

impl Default for PeerStats {
    fn default() -> Self {
        Self::new()
    }
}

fn rate_bytes_per_sec(bytes: usize, elapsed: Duration) -> i64 {
    let secs = elapsed.as_secs_f64().max(1e-3);
    (bytes as f64 / secs) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_download_moves_mean_toward_rate() {
        let mut stats = PeerStats::new();
        assert_eq!(stats.download.mean(), 0);
        for _ in 0..10 {
            stats.record_download(1000, Duration::from_secs(1));
        }
        assert!(stats.download.mean() > 0);
    }
}
