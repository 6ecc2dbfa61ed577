//! Serial stream: the bidirectional CI-V byte pipe.
//!
//! Inbound data payloads are delivered as raw byte chunks in arrival
//! order; the supervisor feeds them through the CI-V controller, which
//! decides per packet whether the external serial bridge also gets to
//! see it. Outbound bytes -- from the controller or from external
//! writers -- are accepted in arbitrary-size runs and fragmented to the
//! protocol's maximum payload size, each fragment sent with the next
//! sequence number and copied into the retransmit buffer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use shacklink_core::{Error, Result};

use crate::frame::MAX_DATA_PAYLOAD;
use crate::session::{Delivery, StreamHandle, StreamKind, StreamSession, TxCommand};
use crate::stats::NetStats;

/// Depth of the inbound and outbound byte channels.
const BYTE_CHANNEL_DEPTH: usize = 64;

/// An authenticated serial stream.
#[derive(Debug)]
pub struct SerialStream {
    handle: StreamHandle,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
    writer_task: JoinHandle<()>,
}

impl SerialStream {
    /// Open the serial session and authenticate with the control
    /// stream's token.
    pub async fn connect(
        addr: std::net::SocketAddr,
        token: u32,
        stats: Arc<NetStats>,
    ) -> Result<SerialStream> {
        let mut session = StreamSession::open(StreamKind::Serial, addr, stats).await?;
        session.authenticate_token(token).await?;

        let (payload_tx, mut payload_rx) = mpsc::channel::<(u16, Vec<u8>)>(BYTE_CHANNEL_DEPTH);
        let handle = session.start(Delivery {
            payload_tx: Some(payload_tx),
            status_tx: None,
        });

        // Strip sequence numbers: serial consumers see a byte stream.
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(BYTE_CHANNEL_DEPTH);
        tokio::spawn(async move {
            while let Some((_seq, bytes)) = payload_rx.recv().await {
                if inbound_tx.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        // Fragment outbound byte runs into data payloads.
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(BYTE_CHANNEL_DEPTH);
        let cmd_tx = handle.sender();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                for chunk in bytes.chunks(MAX_DATA_PAYLOAD) {
                    if cmd_tx
                        .send(TxCommand::Payload(chunk.to_vec()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });

        debug!("serial stream ready");
        Ok(SerialStream {
            handle,
            outbound_tx,
            inbound_rx: Some(inbound_rx),
            writer_task,
        })
    }

    /// Sender for outbound bytes. Runs of any size are accepted and
    /// fragmented; writes from one caller keep their order on the wire.
    pub fn writer(&self) -> mpsc::Sender<Vec<u8>> {
        self.outbound_tx.clone()
    }

    /// Send bytes to the radio.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.outbound_tx
            .send(bytes)
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Take the inbound byte receiver. Yields raw payload chunks in
    /// arrival order; can be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx.take()
    }

    /// The underlying stream handle (health watching, teardown).
    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Orderly teardown.
    pub async fn close(self) {
        self.writer_task.abort();
        self.handle.close().await;
    }

    /// Abort without the close frame.
    pub fn abort(self) {
        self.writer_task.abort();
        self.handle.abort();
    }
}
