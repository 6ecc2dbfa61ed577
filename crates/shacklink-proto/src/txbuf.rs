//! Time-bounded buffer of recently sent sequenced frames.
//!
//! The radio may ask for any recently sent data frame to be resent by
//! sequence number. Each stream keeps its outbound frames here for ten
//! times the stream's nominal window, so even requests for frames a
//! little older than the window can still be served.

use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

/// The audio stream's nominal window. The radio advertises this as its
/// own RX buffer length; pushing it past roughly 500-600 ms makes
/// audio TX fail outright, so 300 ms is a hardware constraint, not a
/// tuning knob.
pub const AUDIO_TX_WINDOW: Duration = Duration::from_millis(300);

/// Entries are kept for this multiple of the nominal window.
const RETAIN_FACTOR: u32 = 10;

#[derive(Debug)]
struct Entry {
    seq: u16,
    data: Vec<u8>,
    added_at: Instant,
}

/// Ring of recently sent frames, ordered by insertion time.
#[derive(Debug)]
pub struct RetransmitBuffer {
    entries: VecDeque<Entry>,
    retain: Duration,
}

impl RetransmitBuffer {
    /// Create a buffer for a stream with the given nominal window.
    pub fn new(window: Duration) -> Self {
        RetransmitBuffer {
            entries: VecDeque::new(),
            retain: window * RETAIN_FACTOR,
        }
    }

    /// Record a frame that was just sent.
    pub fn add(&mut self, seq: u16, data: Vec<u8>) {
        self.entries.push_back(Entry {
            seq,
            data,
            added_at: Instant::now(),
        });
        self.prune();
    }

    /// Look up the frame sent with `seq`, newest first (most requests
    /// target recent frames). Returns a copy of the exact bytes that
    /// went out, or `None` if the frame has aged out or was never sent.
    pub fn get(&mut self, seq: u16) -> Option<Vec<u8>> {
        let found = self
            .entries
            .iter()
            .rev()
            .find(|e| e.seq == seq)
            .map(|e| e.data.clone());
        self.prune();
        found
    }

    /// Drop entries older than ten times the nominal window.
    fn prune(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.added_at) > self.retain {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of buffered frames (after pruning on access).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
