//! Traffic accounting (component C).
//!
//! Counters with Mb/s rates, drained and published at 1 Hz. The recording
//! path (`record_up`/`record_down`) is called from every byte-pump read and
//! must stay O(1): a short-held `Mutex` guards only the two pending deltas,
//! never the totals or rates, which are plain atomics so readers never
//! block on the data plane.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficTag {
    Upload,
    Download,
}

#[derive(Default)]
struct Pending {
    up: u64,
    down: u64,
}

pub struct TrafficAccountant {
    pending: Mutex<Pending>,
    upload_total: AtomicU64,
    download_total: AtomicU64,
    upload_mbps_bits: AtomicU64,
    download_mbps_bits: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrafficSnapshot {
    pub upload_total: u64,
    pub download_total: u64,
    pub upload_mbps: f64,
    pub download_mbps: f64,
}

impl Default for TrafficAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficAccountant {
    pub fn new() -> Self {
        TrafficAccountant {
            pending: Mutex::new(Pending::default()),
            upload_total: AtomicU64::new(0),
            download_total: AtomicU64::new(0),
            upload_mbps_bits: AtomicU64::new(0f64.to_bits()),
            download_mbps_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn record(&self, tag: TrafficTag, n: usize) {
        if n == 0 {
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        match tag {
            TrafficTag::Upload => pending.up += n as u64,
            TrafficTag::Download => pending.down += n as u64,
        }
    }

    pub fn record_up(&self, n: usize) {
        self.record(TrafficTag::Upload, n);
    }

    pub fn record_down(&self, n: usize) {
        self.record(TrafficTag::Download, n);
    }

    /// Drains the pending deltas, advances the totals, and recomputes the
    /// Mb/s rates from the deltas just drained (not from `total -
    /// last_total`), so a `reset()` zeroes rates immediately rather than
    /// producing one inflated reading on the next tick.
    pub fn tick(&self) -> TrafficSnapshot {
        let (up_delta, down_delta) = {
            let mut pending = self.pending.lock().unwrap();
            let deltas = (pending.up, pending.down);
            pending.up = 0;
            pending.down = 0;
            deltas
        };

        let upload_total = self.upload_total.fetch_add(up_delta, Ordering::SeqCst) + up_delta;
        let download_total =
            self.download_total.fetch_add(down_delta, Ordering::SeqCst) + down_delta;

        let upload_mbps = up_delta as f64 * 8.0 / 1_000_000.0;
        let download_mbps = down_delta as f64 * 8.0 / 1_000_000.0;
        self.upload_mbps_bits
            .store(upload_mbps.to_bits(), Ordering::SeqCst);
        self.download_mbps_bits
            .store(download_mbps.to_bits(), Ordering::SeqCst);

        TrafficSnapshot {
            upload_total,
            download_total,
            upload_mbps,
            download_mbps,
        }
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            upload_total: self.upload_total.load(Ordering::SeqCst),
            download_total: self.download_total.load(Ordering::SeqCst),
            upload_mbps: f64::from_bits(self.upload_mbps_bits.load(Ordering::SeqCst)),
            download_mbps: f64::from_bits(self.download_mbps_bits.load(Ordering::SeqCst)),
        }
    }

    /// Zeroes every counter. Called on engine `start()` and `stop()`
    /// transitions so totals always read zero immediately after `start()`.
    pub fn reset(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.up = 0;
        pending.down = 0;
        drop(pending);
        self.upload_total.store(0, Ordering::SeqCst);
        self.download_total.store(0, Ordering::SeqCst);
        self.upload_mbps_bits.store(0f64.to_bits(), Ordering::SeqCst);
        self.download_mbps_bits
            .store(0f64.to_bits(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_zero_after_reset() {
        let acc = TrafficAccountant::new();
        acc.record_up(1024);
        acc.record_down(2048);
        acc.tick();
        acc.reset();
        let snap = acc.snapshot();
        assert_eq!(snap.upload_total, 0);
        assert_eq!(snap.download_total, 0);
        assert_eq!(snap.upload_mbps, 0.0);
        assert_eq!(snap.download_mbps, 0.0);
    }

    #[test]
    fn tick_drains_pending_into_totals_and_rate() {
        let acc = TrafficAccountant::new();
        acc.record_up(125_000); // 1,000,000 bits
        let snap = acc.tick();
        assert_eq!(snap.upload_total, 125_000);
        assert!((snap.upload_mbps - 1.0).abs() < 1e-9);

        // A tick with no new traffic drains to a zero rate, not `total -
        // last_total`, which would otherwise stay at 1.0 forever.
        let snap2 = acc.tick();
        assert_eq!(snap2.upload_total, 125_000);
        assert_eq!(snap2.upload_mbps, 0.0);
    }

    #[test]
    fn monotonic_totals_never_decrease() {
        let acc = TrafficAccountant::new();
        let mut last = 0u64;
        for _ in 0..5 {
            acc.record_up(17);
            let snap = acc.tick();
            assert!(snap.upload_total >= last);
            last = snap.upload_total;
        }
    }
}
