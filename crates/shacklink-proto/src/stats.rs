//! Rolling network statistics.
//!
//! One [`NetStats`] instance is shared by all three streams. Byte and
//! frame counters roll over a one-minute window of sixty one-second
//! buckets; the external status dashboard polls [`NetStats::snapshot`]
//! on its own schedule. The gauges are atomics; the rolling buckets sit
//! behind a short uncontended mutex that is never held across an await.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::time::Instant;

const BUCKETS: usize = 60;

/// A counter that reports the total accumulated over the last minute.
#[derive(Debug)]
struct RollingCounter {
    buckets: Mutex<RollingInner>,
}

#[derive(Debug)]
struct RollingInner {
    counts: [u64; BUCKETS],
    /// Absolute second index of the bucket currently being filled.
    current_sec: u64,
    started: Instant,
}

impl RollingCounter {
    fn new() -> Self {
        RollingCounter {
            buckets: Mutex::new(RollingInner {
                counts: [0; BUCKETS],
                current_sec: 0,
                started: Instant::now(),
            }),
        }
    }

    fn add(&self, n: u64) {
        let mut inner = self.buckets.lock().expect("stats lock poisoned");
        let sec = inner.started.elapsed().as_secs();
        inner.rotate_to(sec);
        inner.counts[(sec % BUCKETS as u64) as usize] += n;
    }

    fn per_minute(&self) -> u64 {
        let mut inner = self.buckets.lock().expect("stats lock poisoned");
        let sec = inner.started.elapsed().as_secs();
        inner.rotate_to(sec);
        inner.counts.iter().sum()
    }
}

impl RollingInner {
    /// Zero every bucket between the last written second and `sec`.
    fn rotate_to(&mut self, sec: u64) {
        if sec == self.current_sec {
            return;
        }
        let stale = (sec - self.current_sec).min(BUCKETS as u64);
        for i in 0..stale {
            let idx = ((self.current_sec + 1 + i) % BUCKETS as u64) as usize;
            self.counts[idx] = 0;
        }
        self.current_sec = sec;
    }
}

/// Shared statistics for the whole client.
#[derive(Debug)]
pub struct NetStats {
    bytes_up: RollingCounter,
    bytes_down: RollingCounter,
    frames_lost: RollingCounter,
    retransmits_requested: RollingCounter,
    malformed: AtomicU64,
    /// Latest round-trip estimate in milliseconds.
    rtt_ms: AtomicU32,
}

/// Point-in-time view of the rolling counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetStatsSnapshot {
    /// Bytes sent to the radio in the last minute.
    pub bytes_up_per_min: u64,
    /// Bytes received from the radio in the last minute.
    pub bytes_down_per_min: u64,
    /// Inbound frames written off as lost in the last minute.
    pub lost_per_min: u64,
    /// Retransmit requests we sent in the last minute.
    pub retransmits_per_min: u64,
    /// Malformed datagrams dropped since startup.
    pub malformed_total: u64,
    /// Latest round-trip estimate in milliseconds.
    pub rtt_ms: u32,
}

impl NetStats {
    /// Create a zeroed statistics block.
    pub fn new() -> Self {
        NetStats {
            bytes_up: RollingCounter::new(),
            bytes_down: RollingCounter::new(),
            frames_lost: RollingCounter::new(),
            retransmits_requested: RollingCounter::new(),
            malformed: AtomicU64::new(0),
            rtt_ms: AtomicU32::new(0),
        }
    }

    /// Record bytes sent.
    pub fn add_bytes_up(&self, n: usize) {
        self.bytes_up.add(n as u64);
    }

    /// Record bytes received.
    pub fn add_bytes_down(&self, n: usize) {
        self.bytes_down.add(n as u64);
    }

    /// Record inbound frames written off as lost.
    pub fn add_lost(&self, n: u64) {
        if n > 0 {
            self.frames_lost.add(n);
        }
    }

    /// Record one retransmit request sent to the radio.
    pub fn add_retransmit_request(&self) {
        self.retransmits_requested.add(1);
    }

    /// Record a dropped malformed datagram.
    pub fn add_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a round-trip time sample.
    pub fn record_rtt(&self, ms: u32) {
        self.rtt_ms.store(ms, Ordering::Relaxed);
    }

    /// Latest round-trip estimate in milliseconds.
    pub fn rtt_ms(&self) -> u32 {
        self.rtt_ms.load(Ordering::Relaxed)
    }

    /// Current rolling totals, for the dashboard.
    pub fn snapshot(&self) -> NetStatsSnapshot {
        NetStatsSnapshot {
            bytes_up_per_min: self.bytes_up.per_minute(),
            bytes_down_per_min: self.bytes_down.per_minute(),
            lost_per_min: self.frames_lost.per_minute(),
            retransmits_per_min: self.retransmits_requested.per_minute(),
            malformed_total: self.malformed.load(Ordering::Relaxed),
            rtt_ms: self.rtt_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for NetStats {
    fn default() -> Self {
        Self::new()
    }
}
