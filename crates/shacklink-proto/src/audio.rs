//! Audio stream: jitter-buffered RX and sequenced, chunked TX.
//!
//! Inbound frames carry PCM at the radio's native format (16-bit
//! little-endian, mono, 48 kHz). They enter a fixed-depth jitter
//! buffer keyed by sequence number; reordering within the depth is
//! smoothed, late arrivals below the watermark are dropped, and the
//! consumer pops frames at its own sample-clock cadence.
//!
//! Outbound PCM from the mic collaborator is cut into fixed 320-sample
//! chunks, sequenced, and buffered for retransmission inside the
//! 300 ms window the radio's own receive buffer imposes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use shacklink_core::{Error, Result};

use crate::seq::seq_after;
use crate::session::{Delivery, StreamHandle, StreamKind, StreamSession, TxCommand};
use crate::stats::NetStats;

/// Samples per outbound audio chunk.
pub const CHUNK_SAMPLES: usize = 320;

/// Bytes per sample (16-bit PCM).
pub const SAMPLE_BYTES: usize = 2;

/// Bytes per outbound audio chunk.
pub const CHUNK_BYTES: usize = CHUNK_SAMPLES * SAMPLE_BYTES;

/// Nominal jitter buffer depth in frames (~100 ms of audio).
pub const JITTER_DEPTH: usize = 20;

/// Reorders inbound audio chunks by sequence number.
///
/// Frames are pushed as they arrive off the wire and popped by the
/// audio consumer in sequence order. A frame older than the last one
/// popped is late and is discarded; so is a duplicate of a buffered
/// frame. When more than the nominal depth piles up (a stalled
/// consumer), the oldest frame is dropped to bound latency.
#[derive(Debug)]
pub struct JitterBuffer {
    depth: usize,
    frames: VecDeque<(u16, Vec<u8>)>,
    last_popped: Option<u16>,
}

impl JitterBuffer {
    /// Create a buffer with the given depth in frames.
    pub fn new(depth: usize) -> Self {
        JitterBuffer {
            depth,
            frames: VecDeque::new(),
            last_popped: None,
        }
    }

    /// Offer an arriving frame. Returns `false` when it was discarded
    /// as late or duplicate.
    pub fn push(&mut self, seq: u16, pcm: Vec<u8>) -> bool {
        if let Some(lp) = self.last_popped {
            if !seq_after(lp, seq) {
                return false; // below the watermark
            }
        }
        // Insert in sequence order, rejecting duplicates.
        let mut pos = self.frames.len();
        for (i, (s, _)) in self.frames.iter().enumerate() {
            if *s == seq {
                return false;
            }
            if seq_after(seq, *s) {
                pos = i;
                break;
            }
        }
        self.frames.insert(pos, (seq, pcm));

        // Bound latency when the consumer stalls.
        while self.frames.len() > self.depth {
            if let Some((seq, _)) = self.frames.pop_front() {
                self.last_popped = Some(seq);
            }
        }
        true
    }

    /// Pop the next frame in sequence order, if any.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let (seq, pcm) = self.frames.pop_front()?;
        self.last_popped = Some(seq);
        Some(pcm)
    }

    /// Number of buffered frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Consumer handle for decoded inbound audio.
///
/// The external audio sink polls [`next_frame`](AudioReceiver::next_frame)
/// at its own sample-clock cadence.
#[derive(Debug, Clone)]
pub struct AudioReceiver {
    jitter: Arc<Mutex<JitterBuffer>>,
}

impl AudioReceiver {
    /// The next PCM chunk in sequence order, or `None` when the buffer
    /// has run dry (the sink plays silence).
    pub fn next_frame(&self) -> Option<Vec<u8>> {
        self.jitter.lock().expect("jitter lock poisoned").pop()
    }

    /// Frames currently buffered.
    pub fn buffered(&self) -> usize {
        self.jitter.lock().expect("jitter lock poisoned").len()
    }
}

/// Producer handle for outbound microphone audio.
///
/// Accepts PCM in arbitrary-size runs and emits fixed
/// [`CHUNK_BYTES`]-sized sequenced frames, carrying any remainder over
/// to the next call.
#[derive(Debug)]
pub struct AudioSender {
    cmd_tx: mpsc::Sender<TxCommand>,
    carry: Vec<u8>,
}

impl AudioSender {
    /// Queue PCM for transmission.
    pub async fn send_pcm(&mut self, pcm: &[u8]) -> Result<()> {
        self.carry.extend_from_slice(pcm);
        while self.carry.len() >= CHUNK_BYTES {
            let chunk: Vec<u8> = self.carry.drain(..CHUNK_BYTES).collect();
            self.cmd_tx
                .send(TxCommand::Payload(chunk))
                .await
                .map_err(|_| Error::NotConnected)?;
        }
        Ok(())
    }

    /// Flush a trailing partial chunk, zero-padded to the fixed size
    /// (used when the operator unkeys mid-chunk).
    pub async fn flush(&mut self) -> Result<()> {
        if self.carry.is_empty() {
            return Ok(());
        }
        let mut chunk = std::mem::take(&mut self.carry);
        chunk.resize(CHUNK_BYTES, 0);
        self.cmd_tx
            .send(TxCommand::Payload(chunk))
            .await
            .map_err(|_| Error::NotConnected)
    }
}

/// An authenticated audio stream.
#[derive(Debug)]
pub struct AudioStream {
    handle: StreamHandle,
    jitter: Arc<Mutex<JitterBuffer>>,
    fill_task: JoinHandle<()>,
}

impl AudioStream {
    /// Open the audio session and authenticate with the control
    /// stream's token.
    pub async fn connect(
        addr: std::net::SocketAddr,
        token: u32,
        stats: Arc<NetStats>,
    ) -> Result<AudioStream> {
        let mut session = StreamSession::open(StreamKind::Audio, addr, stats).await?;
        session.authenticate_token(token).await?;

        let (payload_tx, mut payload_rx) = mpsc::channel::<(u16, Vec<u8>)>(JITTER_DEPTH * 2);
        let handle = session.start(Delivery {
            payload_tx: Some(payload_tx),
            status_tx: None,
        });

        let jitter = Arc::new(Mutex::new(JitterBuffer::new(JITTER_DEPTH)));
        let fill = Arc::clone(&jitter);
        let fill_task = tokio::spawn(async move {
            while let Some((seq, pcm)) = payload_rx.recv().await {
                fill.lock().expect("jitter lock poisoned").push(seq, pcm);
            }
        });

        debug!("audio stream ready");
        Ok(AudioStream {
            handle,
            jitter,
            fill_task,
        })
    }

    /// Consumer handle for inbound audio.
    pub fn receiver(&self) -> AudioReceiver {
        AudioReceiver {
            jitter: Arc::clone(&self.jitter),
        }
    }

    /// Producer handle for outbound audio.
    pub fn sender(&self) -> AudioSender {
        AudioSender {
            cmd_tx: self.handle.sender(),
            carry: Vec::new(),
        }
    }

    /// The underlying stream handle (health watching, teardown).
    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Orderly teardown.
    pub async fn close(self) {
        self.fill_task.abort();
        self.handle.close().await;
    }

    /// Abort without the close frame.
    pub fn abort(self) {
        self.fill_task.abort();
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> Vec<u8> {
        vec![n; 4]
    }

    #[test]
    fn jitter_delivers_in_order() {
        let mut jb = JitterBuffer::new(JITTER_DEPTH);
        assert!(jb.push(0, frame(0)));
        assert!(jb.push(1, frame(1)));
        assert!(jb.push(2, frame(2)));
        assert_eq!(jb.pop(), Some(frame(0)));
        assert_eq!(jb.pop(), Some(frame(1)));
        assert_eq!(jb.pop(), Some(frame(2)));
        assert_eq!(jb.pop(), None);
    }

    #[test]
    fn jitter_smooths_reorder_within_depth() {
        let mut jb = JitterBuffer::new(JITTER_DEPTH);
        assert!(jb.push(1, frame(1)));
        assert!(jb.push(0, frame(0)));
        assert!(jb.push(2, frame(2)));
        assert_eq!(jb.pop(), Some(frame(0)));
        assert_eq!(jb.pop(), Some(frame(1)));
        assert_eq!(jb.pop(), Some(frame(2)));
    }

    #[test]
    fn late_duplicate_is_dropped() {
        // Inbound seqs [s, s+1, s+2, s+1 (late)] must yield exactly
        // three frames in order.
        let s = 100u16;
        let mut jb = JitterBuffer::new(JITTER_DEPTH);
        assert!(jb.push(s, frame(0)));
        assert!(jb.push(s + 1, frame(1)));
        assert!(jb.push(s + 2, frame(2)));
        assert!(!jb.push(s + 1, frame(9)), "buffered duplicate dropped");

        assert_eq!(jb.pop(), Some(frame(0)));
        assert_eq!(jb.pop(), Some(frame(1)));
        // Late arrival below the pop watermark is also dropped.
        assert!(!jb.push(s + 1, frame(9)));
        assert_eq!(jb.pop(), Some(frame(2)));
        assert_eq!(jb.pop(), None);
    }

    #[test]
    fn jitter_handles_seq_wrap() {
        let mut jb = JitterBuffer::new(JITTER_DEPTH);
        assert!(jb.push(0xFFFF, frame(1)));
        assert!(jb.push(0x0000, frame(2)));
        assert_eq!(jb.pop(), Some(frame(1)));
        assert_eq!(jb.pop(), Some(frame(2)));
        // 0xFFFF is now ancient history.
        assert!(!jb.push(0xFFFF, frame(1)));
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut jb = JitterBuffer::new(3);
        for seq in 0..5u16 {
            jb.push(seq, frame(seq as u8));
        }
        assert_eq!(jb.len(), 3);
        // Frames 0 and 1 were sacrificed; delivery resumes at 2.
        assert_eq!(jb.pop(), Some(frame(2)));
        // And the dropped frames cannot sneak back in.
        assert!(!jb.push(0, frame(0)));
    }

    #[tokio::test]
    async fn sender_chunks_to_fixed_size() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let mut sender = AudioSender {
            cmd_tx,
            carry: Vec::new(),
        };

        // One and a half chunks: one frame out, half carried.
        let pcm = vec![0x5A; CHUNK_BYTES + CHUNK_BYTES / 2];
        sender.send_pcm(&pcm).await.unwrap();
        match cmd_rx.try_recv().unwrap() {
            TxCommand::Payload(chunk) => assert_eq!(chunk.len(), CHUNK_BYTES),
            other => panic!("expected payload, got {other:?}"),
        }
        assert!(cmd_rx.try_recv().is_err(), "remainder must be carried");

        // The carried half plus another half completes a chunk.
        sender.send_pcm(&vec![0x5A; CHUNK_BYTES / 2]).await.unwrap();
        match cmd_rx.try_recv().unwrap() {
            TxCommand::Payload(chunk) => assert_eq!(chunk.len(), CHUNK_BYTES),
            other => panic!("expected payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sender_flush_pads_partial_chunk() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let mut sender = AudioSender {
            cmd_tx,
            carry: Vec::new(),
        };
        sender.send_pcm(&[1, 2, 3]).await.unwrap();
        sender.flush().await.unwrap();
        match cmd_rx.try_recv().unwrap() {
            TxCommand::Payload(chunk) => {
                assert_eq!(chunk.len(), CHUNK_BYTES);
                assert_eq!(&chunk[..3], &[1, 2, 3]);
                assert!(chunk[3..].iter().all(|&b| b == 0));
            }
            other => panic!("expected payload, got {other:?}"),
        }
        // Flushing an empty carry sends nothing.
        sender.flush().await.unwrap();
        assert!(cmd_rx.try_recv().is_err());
    }
}
