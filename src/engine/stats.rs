// Live relay statistics - bytes served, transfer counts, serve rate.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

struct StatsSample {
    at: Instant,
    serve_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub served_bytes: u64,
    pub serve_bps: u64,
    pub active_transfers: u32,
    pub completed_transfers: u64,
    pub failed_transfers: u64,
}

pub struct RelayStats {
    serve_bytes_total: AtomicU64,
    active_transfers: AtomicU32,
    completed_transfers: AtomicU64,
    failed_transfers: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            serve_bytes_total: AtomicU64::new(0),
            active_transfers: AtomicU32::new(0),
            completed_transfers: AtomicU64::new(0),
            failed_transfers: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                serve_bytes: 0,
            }),
        }
    }

    pub fn record_served(&self, bytes: u64) {
        self.serve_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn transfer_started(&self) {
        self.active_transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// Close out a transfer started with `transfer_started`.
    pub fn transfer_finished(&self, failed: bool) {
        self.active_transfers.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.failed_transfers.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed_transfers.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let current_serve = self.serve_bytes_total.load(Ordering::Relaxed);

        let serve_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                ((current_serve - sample.serve_bytes) as f64 / elapsed) as u64
            } else {
                0
            };
            sample.at = now;
            sample.serve_bytes = current_serve;
            bps
        };

        StatsSnapshot {
            served_bytes: current_serve,
            serve_bps,
            active_transfers: self.active_transfers.load(Ordering::Relaxed),
            completed_transfers: self.completed_transfers.load(Ordering::Relaxed),
            failed_transfers: self.failed_transfers.load(Ordering::Relaxed),
        }
    }

    pub fn total_served(&self) -> u64 {
        self.serve_bytes_total.load(Ordering::Relaxed)
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = RelayStats::new();
        stats.record_served(1000);
        stats.record_served(500);
        assert_eq!(stats.total_served(), 1500);

        stats.transfer_started();
        stats.transfer_started();
        stats.transfer_started();
        stats.transfer_finished(false);
        stats.transfer_finished(true);

        let snap = stats.snapshot();
        assert_eq!(snap.served_bytes, 1500);
        assert_eq!(snap.active_transfers, 1);
        assert_eq!(snap.completed_transfers, 1);
        assert_eq!(snap.failed_transfers, 1);
    }
}
