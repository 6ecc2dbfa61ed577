//! The radio client supervisor.
//!
//! [`RadioClient`] owns the three streams and the CI-V controller and
//! wires them together: the control stream's token opens serial and
//! audio, serial RX bytes run through the CI-V controller (which claims
//! responses to its own requests), and whatever the controller does not
//! claim is broadcast to the external serial bridge.
//!
//! [`run`] adds the reconnect policy on top: a watchdog failure tears
//! everything down and reconnects from scratch with backoff; after the
//! attempts are exhausted the error is returned and the process exits
//! nonzero.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use shacklink_civ::civ;
use shacklink_civ::{CivController, ControllerOptions};
use shacklink_core::{Config, Error, RadioEvent, Result};
use shacklink_proto::{
    AudioReceiver, AudioSender, AudioStream, ControlStream, NetStats, SerialStream, StreamHealth,
};

/// Reconnect attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Cap on the exponential reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Capacity of the serial-bridge broadcast channel.
const BRIDGE_CHANNEL_CAPACITY: usize = 256;

/// A connected radio client: three authenticated streams plus the
/// CI-V controller.
pub struct RadioClient {
    control: ControlStream,
    serial: SerialStream,
    audio: AudioStream,
    civ: CivController,
    events: broadcast::Sender<RadioEvent>,
    stats: Arc<NetStats>,
    bridge_tx: broadcast::Sender<Vec<u8>>,
    wiring_tasks: Vec<JoinHandle<()>>,
}

impl RadioClient {
    /// Connect and authenticate all three streams, then start the
    /// CI-V controller.
    pub async fn connect(config: Config) -> Result<RadioClient> {
        let (events, _) = broadcast::channel(256);
        Self::connect_with_events(config, events).await
    }

    /// Like [`connect`](RadioClient::connect), but publishing into an
    /// existing event channel (so subscribers survive reconnects).
    pub async fn connect_with_events(
        config: Config,
        events: broadcast::Sender<RadioEvent>,
    ) -> Result<RadioClient> {
        let stats = Arc::new(NetStats::new());

        let control_addr = resolve(&config.host, config.control_port).await?;
        let mut serial_addr = control_addr;
        serial_addr.set_port(config.serial_port());
        let mut audio_addr = control_addr;
        audio_addr.set_port(config.audio_port());

        // Control first: it owns login and hands out the token.
        let control =
            ControlStream::connect(control_addr, &config, Arc::clone(&stats), events.clone())
                .await?;
        let token = control.token();
        info!(radio = control.radio_name(), "logged in");

        let mut serial = SerialStream::connect(serial_addr, token, Arc::clone(&stats)).await?;
        let audio = AudioStream::connect(audio_addr, token, Arc::clone(&stats)).await?;

        // Controller TX: an unbounded channel the sync controller can
        // write into, drained into the serial stream's writer.
        let (civ_tx, mut civ_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let serial_writer = serial.writer();
        let civ_tx_task = tokio::spawn(async move {
            while let Some(bytes) = civ_rx.recv().await {
                if serial_writer.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        let civ = CivController::new(ControllerOptions::from(&config), civ_tx, events.clone());

        // Serial RX: scan the byte stream for CI-V packets, let the
        // controller claim its responses, broadcast the rest to the
        // external bridge.
        let (bridge_tx, _) = broadcast::channel(BRIDGE_CHANNEL_CAPACITY);
        let mut inbound = serial
            .take_inbound()
            .expect("fresh serial stream has its inbound receiver");
        let rx_civ = civ.clone();
        let rx_bridge = bridge_tx.clone();
        let civ_rx_task = tokio::spawn(async move {
            let mut scan_buf = Vec::new();
            while let Some(chunk) = inbound.recv().await {
                scan_buf.extend_from_slice(&chunk);
                while let Some(pkt) = civ::extract_packet(&mut scan_buf) {
                    if rx_civ.handle_packet(&pkt) {
                        // No subscriber is fine; the bridge may not be up.
                        let _ = rx_bridge.send(pkt);
                    }
                }
            }
        });

        civ.start()?;
        let _ = events.send(RadioEvent::Connected);
        debug!("all three streams ready");

        Ok(RadioClient {
            control,
            serial,
            audio,
            civ,
            events,
            stats,
            bridge_tx,
            wiring_tasks: vec![civ_tx_task, civ_rx_task],
        })
    }

    /// The CI-V controller.
    pub fn civ(&self) -> &CivController {
        &self.civ
    }

    /// Radio model name reported at login.
    pub fn radio_name(&self) -> &str {
        self.control.radio_name()
    }

    /// Subscribe to radio events.
    pub fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }

    /// Shared network statistics, for the status dashboard.
    pub fn stats(&self) -> Arc<NetStats> {
        Arc::clone(&self.stats)
    }

    /// Bytes from the radio the controller did not claim, for the
    /// external serial bridge (TCP port / pseudo-terminal).
    pub fn bridge_reader(&self) -> broadcast::Receiver<Vec<u8>> {
        self.bridge_tx.subscribe()
    }

    /// Writer the external serial bridge pushes bytes through.
    pub fn bridge_writer(&self) -> mpsc::Sender<Vec<u8>> {
        self.serial.writer()
    }

    /// Consumer handle for inbound audio.
    pub fn audio_receiver(&self) -> AudioReceiver {
        self.audio.receiver()
    }

    /// Producer handle for outbound (microphone) audio.
    pub fn audio_sender(&self) -> AudioSender {
        self.audio.sender()
    }

    /// Wait until any stream leaves its running state and return the
    /// corresponding error.
    pub async fn wait_failed(&self) -> Error {
        let mut control = self.control.handle().health();
        let mut serial = self.serial.handle().health();
        let mut audio = self.audio.handle().health();

        loop {
            for (name, health) in [
                ("control", &mut control),
                ("serial", &mut serial),
                ("audio", &mut audio),
            ] {
                match *health.borrow_and_update() {
                    StreamHealth::Running => {}
                    StreamHealth::PeerClosed => return Error::PeerClosed,
                    StreamHealth::Closed => return Error::NotConnected,
                    StreamHealth::TimedOut => return Error::StreamTimeout(name),
                }
            }
            tokio::select! {
                _ = control.changed() => {}
                _ = serial.changed() => {}
                _ = audio.changed() => {}
            }
        }
    }

    /// Orderly teardown: stop the controller (waiting for its loop to
    /// acknowledge), then close the streams, audio and serial before
    /// control.
    pub async fn shutdown(self) {
        self.civ.shutdown().await;
        for task in &self.wiring_tasks {
            task.abort();
        }
        self.audio.close().await;
        self.serial.close().await;
        self.control.close().await;
        let _ = self.events.send(RadioEvent::Disconnected);
    }

    /// Tear down without close frames, for reconnect-after-failure.
    fn abort(self) {
        for task in &self.wiring_tasks {
            task.abort();
        }
        self.audio.abort();
        self.serial.abort();
        self.control.abort();
        let _ = self.events.send(RadioEvent::Disconnected);
    }
}

/// Connect-and-supervise: reconnects the whole client from scratch on
/// watchdog failures, with exponential backoff.
///
/// Returns `Ok(())` on an orderly peer close, and the final error once
/// reconnect attempts are exhausted (or immediately on a rejected
/// login, which retrying cannot fix). The caller exits nonzero on
/// `Err`.
pub async fn run(config: Config, events: broadcast::Sender<RadioEvent>) -> Result<()> {
    let mut attempt: u32 = 0;

    loop {
        let client = match RadioClient::connect_with_events(config.clone(), events.clone()).await {
            Ok(client) => {
                attempt = 0;
                client
            }
            Err(e @ Error::AuthFailed(_)) => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    return Err(e);
                }
                let backoff = backoff_delay(attempt);
                warn!(error = %e, attempt, "connect failed, retrying");
                let _ = events.send(RadioEvent::Reconnecting { attempt });
                sleep(backoff).await;
                continue;
            }
        };

        match client.wait_failed().await {
            Error::PeerClosed => {
                info!("radio closed the session");
                client.shutdown().await;
                return Ok(());
            }
            e => {
                attempt += 1;
                warn!(error = %e, attempt, "link failed, reconnecting");
                client.abort();
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    return Err(e);
                }
                let _ = events.send(RadioEvent::Reconnecting { attempt });
                sleep(backoff_delay(attempt)).await;
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(5);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Resolve the radio host to a socket address.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::InvalidParameter(format!("cannot resolve host '{host}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn resolve_loopback() {
        let addr = resolve("127.0.0.1", 50_001).await.unwrap();
        assert_eq!(addr.port(), 50_001);
    }

    #[tokio::test]
    async fn resolve_garbage_fails() {
        assert!(resolve("definitely-not-a-radio.invalid", 50_001)
            .await
            .is_err());
    }
}
