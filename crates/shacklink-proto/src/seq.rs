//! Per-stream sequence tracking.
//!
//! Each stream numbers its payload-bearing frames with a 16-bit
//! counter that wraps. Comparison uses signed-distance serial-number
//! arithmetic, so `0x0001` is "after" `0xFFFE` across the wrap.
//!
//! The tracker allocates outbound sequence numbers, classifies inbound
//! ones (fresh / duplicate / late gap fill), ages gaps into retransmit
//! requests, and writes the loss counters the net-stats component
//! reports.
//!
//! Ordering note: payloads are handed to the stream's consumer in
//! arrival order, not sequence order. The tracker only decides whether
//! an arrival is deliverable; short reordering is tolerated and late
//! arrivals below the watermark are discarded as duplicates.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

/// How long a gap may stay unfilled before we ask the radio to resend
/// it.
pub const GAP_TOLERANCE: Duration = Duration::from_millis(30);

/// How long a gap may stay unfilled before it is written off as lost.
pub const LOSS_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest forward jump we accept before assuming the peer restarted
/// its counter; beyond this we resynchronize instead of recording
/// thousands of phantom gaps.
const MAX_FORWARD_JUMP: u16 = 1_000;

/// Signed distance from `a` to `b` modulo 2^16 (positive when `b` is
/// ahead of `a`).
pub fn seq_distance(a: u16, b: u16) -> i16 {
    b.wrapping_sub(a) as i16
}

/// `true` when `b` is strictly ahead of `a` in serial-number order.
pub fn seq_after(a: u16, b: u16) -> bool {
    seq_distance(a, b) > 0
}

/// Classification of an inbound sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Fresh payload at or ahead of the watermark; deliver it.
    Deliver,
    /// Fills a tracked gap below the watermark; deliver it.
    FilledGap,
    /// Already seen (or below the watermark with no tracked gap); drop.
    Duplicate,
}

#[derive(Debug)]
struct Gap {
    first_missed: Instant,
    requested: bool,
}

/// Sequence state for one stream.
#[derive(Debug)]
pub struct SeqTracker {
    next_tx: u16,
    /// Highest inbound seq observed, once anything has arrived.
    watermark: Option<u16>,
    /// Seqs between deliveries that have not arrived yet.
    gaps: HashMap<u16, Gap>,
    /// Whether this stream requests retransmission of gaps at all
    /// (serial and audio do; control does not).
    request_retransmits: bool,
    duplicates: u64,
    lost: u64,
}

impl SeqTracker {
    /// Create a tracker. `request_retransmits` enables gap-to-request
    /// aging for the streams that use it.
    pub fn new(request_retransmits: bool) -> Self {
        SeqTracker {
            next_tx: 0,
            watermark: None,
            gaps: HashMap::new(),
            request_retransmits,
            duplicates: 0,
            lost: 0,
        }
    }

    /// Allocate the next outbound sequence number.
    pub fn next_tx(&mut self) -> u16 {
        let seq = self.next_tx;
        self.next_tx = self.next_tx.wrapping_add(1);
        seq
    }

    /// Record an inbound sequence number and classify the arrival.
    pub fn note_rx(&mut self, seq: u16, now: Instant) -> RxOutcome {
        let watermark = match self.watermark {
            None => {
                self.watermark = Some(seq);
                return RxOutcome::Deliver;
            }
            Some(w) => w,
        };

        let dist = seq_distance(watermark, seq);
        if dist > 0 {
            if dist as u16 > MAX_FORWARD_JUMP {
                // Peer restarted its counter; resynchronize quietly.
                tracing::debug!(watermark, seq, "sequence jump, resynchronizing");
                self.gaps.clear();
                self.watermark = Some(seq);
                return RxOutcome::Deliver;
            }
            // Everything between the old watermark and this arrival is
            // now a gap.
            let mut missing = watermark.wrapping_add(1);
            while missing != seq {
                self.gaps.entry(missing).or_insert(Gap {
                    first_missed: now,
                    requested: false,
                });
                missing = missing.wrapping_add(1);
            }
            self.watermark = Some(seq);
            RxOutcome::Deliver
        } else if dist == 0 {
            self.duplicates += 1;
            RxOutcome::Duplicate
        } else if self.gaps.remove(&seq).is_some() {
            RxOutcome::FilledGap
        } else {
            self.duplicates += 1;
            RxOutcome::Duplicate
        }
    }

    /// Gaps older than [`GAP_TOLERANCE`] that have not been requested
    /// yet. Marks them requested; the caller sends one retransmit
    /// request for the batch.
    pub fn due_requests(&mut self, now: Instant) -> Vec<u16> {
        if !self.request_retransmits {
            return Vec::new();
        }
        let mut due: Vec<u16> = self
            .gaps
            .iter_mut()
            .filter(|(_, g)| !g.requested && now.duration_since(g.first_missed) >= GAP_TOLERANCE)
            .map(|(seq, g)| {
                g.requested = true;
                *seq
            })
            .collect();
        due.sort_unstable();
        due
    }

    /// Drop gaps older than [`LOSS_TIMEOUT`], counting them as lost.
    /// Returns how many were written off.
    pub fn expire_lost(&mut self, now: Instant) -> u64 {
        let before = self.gaps.len();
        self.gaps
            .retain(|_, g| now.duration_since(g.first_missed) < LOSS_TIMEOUT);
        let expired = (before - self.gaps.len()) as u64;
        self.lost += expired;
        expired
    }

    /// Total inbound frames written off as lost.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Total duplicate arrivals discarded.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> SeqTracker {
        SeqTracker::new(true)
    }

    #[test]
    fn distance_across_wrap() {
        assert_eq!(seq_distance(0xFFFE, 0x0001), 3);
        assert_eq!(seq_distance(0x0001, 0xFFFE), -3);
        assert_eq!(seq_distance(5, 5), 0);
        assert!(seq_after(0xFFFF, 0x0000));
        assert!(!seq_after(0x0000, 0xFFFF));
    }

    #[test]
    fn tx_seq_increments_and_wraps() {
        let mut t = tracker();
        assert_eq!(t.next_tx(), 0);
        assert_eq!(t.next_tx(), 1);
        t.next_tx = 0xFFFF;
        assert_eq!(t.next_tx(), 0xFFFF);
        assert_eq!(t.next_tx(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_order_arrivals_deliver() {
        let mut t = tracker();
        let now = Instant::now();
        for seq in 0..5u16 {
            assert_eq!(t.note_rx(seq, now), RxOutcome::Deliver);
        }
        assert!(t.due_requests(now + GAP_TOLERANCE).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_is_dropped() {
        let mut t = tracker();
        let now = Instant::now();
        assert_eq!(t.note_rx(10, now), RxOutcome::Deliver);
        assert_eq!(t.note_rx(10, now), RxOutcome::Duplicate);
        assert_eq!(t.duplicates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gap_then_late_fill() {
        let mut t = tracker();
        let now = Instant::now();
        assert_eq!(t.note_rx(0, now), RxOutcome::Deliver);
        // 1 goes missing; 2 arrives first.
        assert_eq!(t.note_rx(2, now), RxOutcome::Deliver);
        // Late arrival fills the gap exactly once.
        assert_eq!(t.note_rx(1, now), RxOutcome::FilledGap);
        assert_eq!(t.note_rx(1, now), RxOutcome::Duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn gap_ages_into_request() {
        let mut t = tracker();
        let now = Instant::now();
        t.note_rx(0, now);
        t.note_rx(3, now);

        // Too early: inside the tolerance window.
        assert!(t.due_requests(now + Duration::from_millis(10)).is_empty());

        // After the window both gaps are due, in order, exactly once.
        let due = t.due_requests(now + GAP_TOLERANCE);
        assert_eq!(due, vec![1, 2]);
        assert!(t.due_requests(now + GAP_TOLERANCE).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unfilled_gap_counts_lost() {
        let mut t = tracker();
        let now = Instant::now();
        t.note_rx(0, now);
        t.note_rx(2, now);
        assert_eq!(t.expire_lost(now + Duration::from_millis(500)), 0);
        assert_eq!(t.expire_lost(now + LOSS_TIMEOUT), 1);
        assert_eq!(t.lost(), 1);
        // The written-off seq now reads as a duplicate if it ever shows up.
        assert_eq!(t.note_rx(1, now + LOSS_TIMEOUT), RxOutcome::Duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn wraparound_gap_tracking() {
        let mut t = tracker();
        let now = Instant::now();
        t.note_rx(0xFFFE, now);
        assert_eq!(t.note_rx(0x0001, now), RxOutcome::Deliver);
        let due = t.due_requests(now + GAP_TOLERANCE);
        assert_eq!(due, vec![0x0000, 0xFFFF]);
    }

    #[tokio::test(start_paused = true)]
    async fn large_jump_resynchronizes() {
        let mut t = tracker();
        let now = Instant::now();
        t.note_rx(0, now);
        assert_eq!(t.note_rx(5_000, now), RxOutcome::Deliver);
        // No flood of gap requests after a counter reset.
        assert!(t.due_requests(now + GAP_TOLERANCE).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn control_stream_never_requests() {
        let mut t = SeqTracker::new(false);
        let now = Instant::now();
        t.note_rx(0, now);
        t.note_rx(2, now);
        assert!(t.due_requests(now + GAP_TOLERANCE).is_empty());
    }
}
