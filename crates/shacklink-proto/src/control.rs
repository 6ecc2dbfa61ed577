//! Control stream: login, token, and cross-stream orchestration.
//!
//! The control stream opens first. It authenticates with username and
//! password, obtains the connection token the serial and audio streams
//! authenticate with, and afterwards decodes the radio's periodic
//! status frames (battery level, connection flags) into
//! [`RadioEvent::Status`] events. Its idle pings double as the NAT
//! keepalive for the whole client.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use shacklink_core::{Config, Error, RadioEvent, Result};

use crate::frame::{Frame, AUTH_REJECTED};
use crate::session::{Delivery, StreamHandle, StreamKind, StreamSession};
use crate::stats::NetStats;

/// A logged-in control stream.
#[derive(Debug)]
pub struct ControlStream {
    handle: StreamHandle,
    token: u32,
    radio_name: String,
    capabilities: u32,
    status_task: JoinHandle<()>,
}

impl ControlStream {
    /// Open the control session and log in.
    ///
    /// Fails with [`Error::AuthFailed`] when the radio rejects the
    /// credentials; that error is fatal for the whole client.
    pub async fn connect(
        addr: std::net::SocketAddr,
        config: &Config,
        stats: Arc<NetStats>,
        events: broadcast::Sender<RadioEvent>,
    ) -> Result<ControlStream> {
        let mut session = StreamSession::open(StreamKind::Control, addr, stats).await?;

        let token_request: u32 = rand::thread_rng().gen();
        let login_seq = session.next_handshake_seq();
        let login = session.addressed(Frame::Login {
            seq: login_seq,
            from: 0,
            to: 0,
            token_request,
            username: config.username.clone(),
            password: config.password.clone(),
            name: "shacklink".to_string(),
        });

        let response = session
            .request_response(&login, |f| matches!(f, Frame::LoginResponse { .. }))
            .await?;
        let (error, token, radio_name, capabilities) = match response {
            Frame::LoginResponse {
                error,
                token,
                radio_name,
                capabilities,
                ..
            } => (error, token, radio_name, capabilities),
            _ => unreachable!("request_response only accepts LoginResponse"),
        };

        if error == AUTH_REJECTED {
            warn!("radio rejected login for user '{}'", config.username);
            return Err(Error::AuthFailed(format!(
                "login rejected for user '{}'",
                config.username
            )));
        }
        if error != 0 {
            return Err(Error::Protocol(format!(
                "login response carried error 0x{error:08x}"
            )));
        }

        debug!(
            radio = %radio_name,
            token = format_args!("{token:08x}"),
            "logged in"
        );

        let (status_tx, status_rx) = mpsc::channel(16);
        let handle = session.start(Delivery {
            payload_tx: None,
            status_tx: Some(status_tx),
        });

        let status_task = tokio::spawn(status_loop(status_rx, events));

        Ok(ControlStream {
            handle,
            token,
            radio_name,
            capabilities,
            status_task,
        })
    }

    /// The connection token the serial and audio streams authenticate
    /// with.
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Radio model name reported at login.
    pub fn radio_name(&self) -> &str {
        &self.radio_name
    }

    /// Raw capability bits reported at login.
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    /// The underlying stream handle (health watching, teardown).
    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Orderly teardown.
    pub async fn close(self) {
        self.status_task.abort();
        self.handle.close().await;
    }

    /// Abort without the close frame.
    pub fn abort(self) {
        self.status_task.abort();
        self.handle.abort();
    }
}

/// Decode periodic status frames into events.
async fn status_loop(
    mut status_rx: mpsc::Receiver<Frame>,
    events: broadcast::Sender<RadioEvent>,
) {
    while let Some(frame) = status_rx.recv().await {
        if let Frame::Status { battery, flags, .. } = frame {
            let _ = events.send(RadioEvent::Status { battery, flags });
        }
    }
}
