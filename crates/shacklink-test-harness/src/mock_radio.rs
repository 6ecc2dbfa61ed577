//! Scriptable mock radio for protocol-level testing.
//!
//! [`MockRadio`] binds three consecutive loopback UDP ports (the same
//! control/serial/audio layout a real radio exposes) and speaks the
//! session protocol: it answers session opens, logins, token auths,
//! and pings, extracts CI-V packets from serial data frames, and
//! replies according to pre-loaded expectations. Tests drive the real
//! client against it without hardware.
//!
//! # Example
//!
//! ```no_run
//! use shacklink_test_harness::MockRadio;
//!
//! # async fn example() -> shacklink_core::Result<()> {
//! let radio = MockRadio::spawn().await?;
//!
//! // When the client asks for the S-meter, answer S9.
//! radio.expect_civ(
//!     vec![0xFE, 0xFE, 0xA4, 0xE0, 0x15, 0x02, 0xFD],
//!     0,
//!     vec![vec![0xFE, 0xFE, 0xE0, 0xA4, 0x15, 0x02, 0x01, 0x20, 0xFD]],
//! );
//! let addr = radio.control_addr();
//! // ... connect a RadioClient to `addr` ...
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use shacklink_civ::civ;
use shacklink_core::{Error, Result};
use shacklink_proto::frame::{Frame, AUTH_REJECTED};

/// The connection token the mock hands out at login.
pub const MOCK_TOKEN: u32 = 0x7E57_0001;

/// Radio name reported in the login response.
pub const MOCK_RADIO_NAME: &str = "IC-705";

/// A pre-loaded CI-V request/response script entry.
#[derive(Debug, Clone)]
struct CivExpectation {
    /// Exact packet bytes expected from the client.
    request: Vec<u8>,
    /// Ignore this many matching requests before answering (simulates
    /// packet loss for retry tests).
    drops_remaining: u32,
    /// Packets to send back on match, each in its own data frame.
    responses: Vec<Vec<u8>>,
    /// Whether the entry stays active after matching once.
    sticky: bool,
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    client_sid: u32,
    my_sid: u32,
    tx_seq: u16,
}

#[derive(Debug, Default)]
struct StreamState {
    peer: Option<Peer>,
    /// Raw data frames received, by seq (first arrival wins).
    raw_by_seq: HashMap<u16, Vec<u8>>,
    /// Every raw data frame, in arrival order (retransmits included).
    raw_all: Vec<(u16, Vec<u8>)>,
    /// Payloads received, in arrival order.
    payloads: Vec<(u16, Vec<u8>)>,
}

#[derive(Debug)]
struct Shared {
    reject_login: AtomicBool,
    silent: AtomicBool,
    civ_script: Mutex<Vec<CivExpectation>>,
    civ_received: Mutex<Vec<Vec<u8>>>,
    civ_buf: Mutex<Vec<u8>>,
    control: Mutex<StreamState>,
    serial: Mutex<StreamState>,
    audio: Mutex<StreamState>,
}

/// A mock Icom network radio on loopback.
pub struct MockRadio {
    base_port: u16,
    control_sock: Arc<UdpSocket>,
    serial_sock: Arc<UdpSocket>,
    audio_sock: Arc<UdpSocket>,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Control,
    Serial,
    Audio,
}

impl MockRadio {
    /// Bind three consecutive loopback ports and start serving.
    pub async fn spawn() -> Result<MockRadio> {
        let (base_port, control_sock, serial_sock, audio_sock) = bind_triple().await?;
        let shared = Arc::new(Shared {
            reject_login: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            civ_script: Mutex::new(Vec::new()),
            civ_received: Mutex::new(Vec::new()),
            civ_buf: Mutex::new(Vec::new()),
            control: Mutex::new(StreamState::default()),
            serial: Mutex::new(StreamState::default()),
            audio: Mutex::new(StreamState::default()),
        });

        let control_sock = Arc::new(control_sock);
        let serial_sock = Arc::new(serial_sock);
        let audio_sock = Arc::new(audio_sock);

        let tasks = vec![
            tokio::spawn(serve(
                Arc::clone(&control_sock),
                Arc::clone(&shared),
                Role::Control,
            )),
            tokio::spawn(serve(
                Arc::clone(&serial_sock),
                Arc::clone(&shared),
                Role::Serial,
            )),
            tokio::spawn(serve(
                Arc::clone(&audio_sock),
                Arc::clone(&shared),
                Role::Audio,
            )),
        ];

        debug!(base_port, "mock radio listening");
        Ok(MockRadio {
            base_port,
            control_sock,
            serial_sock,
            audio_sock,
            shared,
            tasks,
        })
    }

    /// Address of the control stream (serial and audio follow at +1
    /// and +2, as on a real radio).
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.base_port))
    }

    /// Base UDP port.
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Reject the next login (and all following ones).
    pub fn set_reject_login(&self, reject: bool) {
        self.shared.reject_login.store(reject, Ordering::SeqCst);
    }

    /// Stop answering anything, simulating a dead link. The client's
    /// watchdog should fire.
    pub fn go_silent(&self) {
        self.shared.silent.store(true, Ordering::SeqCst);
    }

    /// Resume answering after [`go_silent`](MockRadio::go_silent).
    pub fn resume(&self) {
        self.shared.silent.store(false, Ordering::SeqCst);
    }

    /// Expect `request` on the CI-V channel; ignore the first `drops`
    /// occurrences, then send each of `responses` back. The entry is
    /// consumed by the answering match.
    pub fn expect_civ(&self, request: Vec<u8>, drops: u32, responses: Vec<Vec<u8>>) {
        self.shared
            .civ_script
            .lock()
            .expect("script lock poisoned")
            .push(CivExpectation {
                request,
                drops_remaining: drops,
                responses,
                sticky: false,
            });
    }

    /// Permanently answer `request` with `responses` (for the client's
    /// periodic polls).
    pub fn answer_civ(&self, request: Vec<u8>, responses: Vec<Vec<u8>>) {
        self.shared
            .civ_script
            .lock()
            .expect("script lock poisoned")
            .push(CivExpectation {
                request,
                drops_remaining: 0,
                responses,
                sticky: true,
            });
    }

    /// All CI-V packets received so far, in arrival order.
    pub fn civ_received(&self) -> Vec<Vec<u8>> {
        self.shared
            .civ_received
            .lock()
            .expect("received lock poisoned")
            .clone()
    }

    /// How many times `request` has been received on the CI-V channel.
    pub fn civ_count(&self, request: &[u8]) -> usize {
        self.civ_received()
            .iter()
            .filter(|p| p.as_slice() == request)
            .count()
    }

    /// Send an unsolicited CI-V packet to the client (transceive
    /// broadcast).
    pub async fn send_civ(&self, pkt: Vec<u8>) -> Result<()> {
        send_data(&self.serial_sock, &self.shared.serial, pkt).await
    }

    /// Send a periodic status report on the control stream.
    pub async fn send_status(&self, battery: u8, flags: u8) -> Result<()> {
        let (addr, wire) = {
            let st = self.shared.control.lock().expect("control lock poisoned");
            let peer = st.peer.as_ref().ok_or(Error::NotConnected)?;
            let frame = Frame::Status {
                from: peer.my_sid,
                to: peer.client_sid,
                battery,
                flags,
            };
            (peer.addr, frame.encode())
        };
        self.control_sock.send_to(&wire, addr).await?;
        Ok(())
    }

    /// Send an audio frame to the client with an explicit sequence
    /// number (jitter and reorder tests pick their own).
    pub async fn send_audio(&self, seq: u16, pcm: Vec<u8>) -> Result<()> {
        let (addr, wire) = {
            let mut st = self.shared.audio.lock().expect("audio lock poisoned");
            let peer = st.peer.as_mut().ok_or(Error::NotConnected)?;
            let frame = Frame::Data {
                seq,
                from: peer.my_sid,
                to: peer.client_sid,
                payload: pcm,
            };
            (peer.addr, frame.encode())
        };
        self.audio_sock.send_to(&wire, addr).await?;
        Ok(())
    }

    /// Audio payloads received from the client, in arrival order.
    pub fn audio_payloads(&self) -> Vec<(u16, Vec<u8>)> {
        self.shared
            .audio
            .lock()
            .expect("audio lock poisoned")
            .payloads
            .clone()
    }

    /// The exact wire bytes of the serial data frame the client sent
    /// with `seq`, if seen.
    pub fn serial_raw_frame(&self, seq: u16) -> Option<Vec<u8>> {
        self.shared
            .serial
            .lock()
            .expect("serial lock poisoned")
            .raw_by_seq
            .get(&seq)
            .cloned()
    }

    /// Ask the client to retransmit serial seq `seq` and return the
    /// wire bytes it answers with.
    pub async fn request_serial_retransmit(&self, seq: u16) -> Result<Vec<u8>> {
        let (addr, wire) = {
            let st = self.shared.serial.lock().expect("serial lock poisoned");
            let peer = st.peer.as_ref().ok_or(Error::NotConnected)?;
            let frame = Frame::RetransmitRequest {
                from: peer.my_sid,
                to: peer.client_sid,
                seqs: vec![seq],
            };
            (peer.addr, frame.encode())
        };
        self.serial_sock.send_to(&wire, addr).await?;

        // The serving task records every data frame; wait for the
        // retransmitted copy to show up, then hand back its raw bytes
        // so callers can compare them against the original.
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(2);
        loop {
            if tokio::time::Instant::now() > deadline {
                return Err(Error::Timeout);
            }
            {
                let st = self.shared.serial.lock().expect("serial lock poisoned");
                let mut copies = st.raw_all.iter().filter(|(s, _)| *s == seq);
                if let (Some(_), Some((_, resent))) = (copies.next(), copies.next()) {
                    return Ok(resent.clone());
                }
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
    }

    /// Stop all serving tasks.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Bind three consecutive UDP ports on loopback.
async fn bind_triple() -> Result<(u16, UdpSocket, UdpSocket, UdpSocket)> {
    for _ in 0..32 {
        // Lean on the OS for a free port, then try its two neighbors.
        let probe = UdpSocket::bind("127.0.0.1:0").await?;
        let base = probe.local_addr()?.port();
        if base >= u16::MAX - 2 {
            continue;
        }
        let serial = match UdpSocket::bind(("127.0.0.1", base + 1)).await {
            Ok(s) => s,
            Err(_) => continue,
        };
        let audio = match UdpSocket::bind(("127.0.0.1", base + 2)).await {
            Ok(s) => s,
            Err(_) => continue,
        };
        return Ok((base, probe, serial, audio));
    }
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "no consecutive port triple available",
    )))
}

/// Serve one stream socket.
async fn serve(sock: Arc<UdpSocket>, shared: Arc<Shared>, role: Role) {
    let my_sid: u32 = match role {
        Role::Control => 0xD1A1_0001,
        Role::Serial => 0xD1A1_0002,
        Role::Audio => 0xD1A1_0003,
    };
    let mut buf = [0u8; 4096];

    loop {
        let (n, from_addr) = match sock.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(_) => return,
        };
        if shared.silent.load(Ordering::SeqCst) {
            continue;
        }
        let frame = match Frame::decode(&buf[..n]) {
            Ok(f) => f,
            Err(e) => {
                trace!(?role, error = %e, "mock radio ignoring malformed datagram");
                continue;
            }
        };

        match frame {
            Frame::SessionOpen { from, .. } => {
                set_peer(&shared, role, from_addr, from, my_sid);
                let resp = Frame::SessionResponse {
                    seq: 0,
                    from: my_sid,
                    to: from,
                };
                let _ = sock.send_to(&resp.encode(), from_addr).await;
            }
            Frame::Ping {
                reply: false,
                id,
                seq,
                from,
                ..
            } => {
                let resp = Frame::Ping {
                    seq,
                    from: my_sid,
                    to: from,
                    reply: true,
                    id,
                };
                let _ = sock.send_to(&resp.encode(), from_addr).await;
            }
            Frame::Login {
                from, username, ..
            } => {
                let rejected = shared.reject_login.load(Ordering::SeqCst);
                debug!(%username, rejected, "mock radio login");
                let resp = Frame::LoginResponse {
                    seq: 1,
                    from: my_sid,
                    to: from,
                    error: if rejected { AUTH_REJECTED } else { 0 },
                    token: MOCK_TOKEN,
                    radio_name: MOCK_RADIO_NAME.into(),
                    capabilities: 0x01,
                };
                let _ = sock.send_to(&resp.encode(), from_addr).await;
            }
            Frame::TokenAuth { from, token, .. } => {
                let resp = Frame::TokenAck {
                    seq: 1,
                    from: my_sid,
                    to: from,
                    token,
                    error: if token == MOCK_TOKEN { 0 } else { AUTH_REJECTED },
                };
                let _ = sock.send_to(&resp.encode(), from_addr).await;
            }
            Frame::Data { seq, payload, .. } => {
                record_data(&shared, role, seq, &buf[..n], &payload);
                if role == Role::Serial {
                    handle_civ_bytes(&sock, &shared, &payload).await;
                }
            }
            Frame::Disconnect { .. } => {
                debug!(?role, "mock radio saw disconnect");
                clear_peer(&shared, role);
            }
            _ => {}
        }
    }
}

fn stream_of(shared: &Shared, role: Role) -> Option<&Mutex<StreamState>> {
    match role {
        Role::Control => Some(&shared.control),
        Role::Serial => Some(&shared.serial),
        Role::Audio => Some(&shared.audio),
    }
}

fn set_peer(shared: &Shared, role: Role, addr: SocketAddr, client_sid: u32, my_sid: u32) {
    if let Some(stream) = stream_of(shared, role) {
        stream.lock().expect("stream lock poisoned").peer = Some(Peer {
            addr,
            client_sid,
            my_sid,
            tx_seq: 0,
        });
    }
}

fn clear_peer(shared: &Shared, role: Role) {
    if let Some(stream) = stream_of(shared, role) {
        stream.lock().expect("stream lock poisoned").peer = None;
    }
}

fn record_data(shared: &Shared, role: Role, seq: u16, raw: &[u8], payload: &[u8]) {
    if let Some(stream) = stream_of(shared, role) {
        let mut st = stream.lock().expect("stream lock poisoned");
        st.raw_by_seq.entry(seq).or_insert_with(|| raw.to_vec());
        st.raw_all.push((seq, raw.to_vec()));
        st.payloads.push((seq, payload.to_vec()));
    }
}

/// Extract CI-V packets from serial payload bytes, record them, and
/// answer per the script.
async fn handle_civ_bytes(sock: &Arc<UdpSocket>, shared: &Arc<Shared>, payload: &[u8]) {
    let packets = {
        let mut civ_buf = shared.civ_buf.lock().expect("civ buf poisoned");
        civ_buf.extend_from_slice(payload);
        let mut pkts = Vec::new();
        while let Some(pkt) = civ::extract_packet(&mut civ_buf) {
            pkts.push(pkt);
        }
        pkts
    };

    for pkt in packets {
        shared
            .civ_received
            .lock()
            .expect("received lock poisoned")
            .push(pkt.clone());

        let responses = {
            let mut script = shared.civ_script.lock().expect("script lock poisoned");
            match script.iter_mut().position(|e| e.request == pkt) {
                Some(i) => {
                    if script[i].drops_remaining > 0 {
                        script[i].drops_remaining -= 1;
                        trace!("mock radio dropping scripted request");
                        None
                    } else if script[i].sticky {
                        Some(script[i].responses.clone())
                    } else {
                        Some(script.remove(i).responses)
                    }
                }
                None => None,
            }
        };

        if let Some(responses) = responses {
            for resp in responses {
                let _ = send_data(sock, &shared.serial, resp).await;
            }
        }
    }
}

/// Send a payload to the recorded peer as the next sequenced data
/// frame.
async fn send_data(
    sock: &Arc<UdpSocket>,
    stream: &Mutex<StreamState>,
    payload: Vec<u8>,
) -> Result<()> {
    let (addr, wire) = {
        let mut st = stream.lock().expect("stream lock poisoned");
        let peer = st.peer.as_mut().ok_or(Error::NotConnected)?;
        let seq = peer.tx_seq;
        peer.tx_seq = peer.tx_seq.wrapping_add(1);
        let frame = Frame::Data {
            seq,
            from: peer.my_sid,
            to: peer.client_sid,
            payload,
        };
        (peer.addr, frame.encode())
    };
    sock.send_to(&wire, addr).await?;
    Ok(())
}
