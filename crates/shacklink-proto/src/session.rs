//! Generic UDP stream session.
//!
//! Each of the three streams (control, serial, audio) is one
//! [`StreamSession`]: a connected UDP socket plus the session-open
//! handshake, and -- once running -- a receive task and a send/timer
//! task. The concrete streams layer their own authentication and
//! payload handling on top.
//!
//! Lifecycle: `Idle -> Opening -> Authenticating -> Ready -> Closing ->
//! Closed`, with `Failed` terminal. Opening retries the session-open
//! frame every 100 ms; Ready runs a 100 ms idle ping and a 2 s receive
//! watchdog. Every outbound data frame is copied into the stream's
//! retransmit buffer so server-requested retransmits can be served with
//! the exact original bytes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use shacklink_core::{Error, Result};

use crate::frame::Frame;
use crate::seq::{RxOutcome, SeqTracker};
use crate::stats::NetStats;
use crate::txbuf::{RetransmitBuffer, AUDIO_TX_WINDOW};

/// Interval between idle pings while Ready.
pub const IDLE_PING_INTERVAL: Duration = Duration::from_millis(100);

/// Silence on the socket longer than this fails the stream.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry interval for handshake frames (session open, login, token).
pub const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Handshake attempts before giving up.
pub const HANDSHAKE_ATTEMPTS: u32 = 10;

/// Socket-level receive timeout; keeps the control loops responsive.
const RECV_TIMEOUT: Duration = Duration::from_millis(200);

/// Depth of the per-stream command channel between callers and the
/// send task.
const CMD_CHANNEL_DEPTH: usize = 64;

/// Which of the three streams a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// First stream; login, token, status.
    Control,
    /// CI-V byte pipe.
    Serial,
    /// PCM audio.
    Audio,
}

impl StreamKind {
    /// Stream name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Control => "control",
            StreamKind::Serial => "serial",
            StreamKind::Audio => "audio",
        }
    }

    /// Whether this stream requests retransmission of inbound gaps.
    fn requests_retransmits(&self) -> bool {
        !matches!(self, StreamKind::Control)
    }
}

/// Why a stream stopped, surfaced through [`StreamHandle::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHealth {
    /// Stream is up.
    Running,
    /// We closed it deliberately.
    Closed,
    /// The radio sent a session close.
    PeerClosed,
    /// Watchdog expired or the socket failed repeatedly.
    TimedOut,
}

/// Commands accepted by a stream's send task.
#[derive(Debug)]
pub(crate) enum TxCommand {
    /// Send an opaque payload as the next sequenced data frame.
    Payload(Vec<u8>),
    /// Serve a peer retransmit request from the TX buffer.
    Resend(Vec<u16>),
    /// Ask the radio to resend the listed seqs.
    RequestRetransmit(Vec<u16>),
    /// Answer a ping probe, echoing its id.
    PingReply { id: u32 },
    /// Send a session close and stop.
    Close,
}

/// Inbound delivery targets for a running session.
#[derive(Debug, Default)]
pub(crate) struct Delivery {
    /// Receives `(seq, payload)` for every deliverable data frame.
    pub payload_tx: Option<mpsc::Sender<(u16, Vec<u8>)>>,
    /// Receives non-data frames the generic layer does not consume
    /// (the control stream's status reports).
    pub status_tx: Option<mpsc::Sender<Frame>>,
}

/// An opened (but not yet running) stream session.
///
/// Produced by [`StreamSession::open`] after the open handshake has
/// learned the remote session id. The concrete streams authenticate on
/// it directly, then call [`StreamSession::start`].
#[derive(Debug)]
pub struct StreamSession {
    kind: StreamKind,
    socket: Arc<UdpSocket>,
    local_sid: u32,
    remote_sid: u32,
    handshake_seq: u16,
    stats: Arc<NetStats>,
    epoch: Instant,
}

impl StreamSession {
    /// Bind a socket, connect it to `addr`, and run the session-open
    /// handshake: send session-open every 100 ms until the radio's
    /// session-response arrives (at most [`HANDSHAKE_ATTEMPTS`] tries).
    ///
    /// The local session id is chosen at random; the remote id is
    /// learned from the first reply and echoed in every later frame.
    pub async fn open(
        kind: StreamKind,
        addr: std::net::SocketAddr,
        stats: Arc<NetStats>,
    ) -> Result<StreamSession> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        let local_sid: u32 = rand::thread_rng().gen();

        debug!(
            stream = kind.name(),
            remote = %addr,
            local_sid = format_args!("{local_sid:08x}"),
            "opening stream session"
        );

        let mut session = StreamSession {
            kind,
            socket: Arc::new(socket),
            local_sid,
            remote_sid: 0,
            handshake_seq: 0,
            stats,
            epoch: Instant::now(),
        };

        let open = Frame::SessionOpen {
            seq: session.next_handshake_seq(),
            from: local_sid,
            to: 0,
        };
        let response = session
            .request_response(&open, |f| matches!(f, Frame::SessionResponse { .. }))
            .await?;
        if let Frame::SessionResponse { from, .. } = response {
            session.remote_sid = from;
        }

        debug!(
            stream = kind.name(),
            remote_sid = format_args!("{:08x}", session.remote_sid),
            "session open"
        );
        Ok(session)
    }

    /// The randomly chosen local session id.
    pub fn local_sid(&self) -> u32 {
        self.local_sid
    }

    /// The radio's session id, learned from its session-response.
    pub fn remote_sid(&self) -> u32 {
        self.remote_sid
    }

    /// This stream's kind.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Allocate the next handshake-phase sequence number.
    pub(crate) fn next_handshake_seq(&mut self) -> u16 {
        let seq = self.handshake_seq;
        self.handshake_seq = self.handshake_seq.wrapping_add(1);
        seq
    }

    /// Fill in this session's ids on a handshake frame.
    pub(crate) fn addressed(&self, mut frame: Frame) -> Frame {
        match &mut frame {
            Frame::Login { from, to, .. }
            | Frame::TokenAuth { from, to, .. }
            | Frame::SessionOpen { from, to, .. }
            | Frame::Ready { from, to }
            | Frame::Disconnect { from, to } => {
                *from = self.local_sid;
                *to = self.remote_sid;
            }
            _ => {}
        }
        frame
    }

    /// Send `request`, then wait for a frame matching `accept`,
    /// retrying the send every [`HANDSHAKE_RETRY_INTERVAL`] up to
    /// [`HANDSHAKE_ATTEMPTS`] times.
    ///
    /// Frames that fail to decode are counted and skipped; frames that
    /// decode but do not match are ignored (the radio may interleave
    /// pings during a slow handshake).
    pub(crate) async fn request_response<F>(&self, request: &Frame, accept: F) -> Result<Frame>
    where
        F: Fn(&Frame) -> bool,
    {
        let wire = request.encode();
        let mut buf = [0u8; 2048];

        for attempt in 0..HANDSHAKE_ATTEMPTS {
            if attempt > 0 {
                trace!(
                    stream = self.kind.name(),
                    attempt,
                    "handshake retry"
                );
            }
            self.socket.send(&wire).await?;
            self.stats.add_bytes_up(wire.len());

            let deadline = Instant::now() + HANDSHAKE_RETRY_INTERVAL;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let n = match tokio::time::timeout(remaining, self.socket.recv(&mut buf)).await {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(Error::Io(e)),
                    Err(_) => break,
                };
                self.stats.add_bytes_down(n);
                match Frame::decode(&buf[..n]) {
                    Ok(frame) if accept(&frame) => return Ok(frame),
                    Ok(_) => continue,
                    Err(_) => {
                        self.stats.add_malformed();
                        continue;
                    }
                }
            }
        }
        Err(Error::Timeout)
    }

    /// Authenticate this session with the connection token obtained by
    /// the control stream's login. Used by the serial and audio streams.
    pub(crate) async fn authenticate_token(&mut self, token: u32) -> Result<()> {
        let token_auth_seq = self.next_handshake_seq();
        let request = self.addressed(Frame::TokenAuth {
            seq: token_auth_seq,
            from: 0,
            to: 0,
            token,
        });
        let response = self
            .request_response(&request, |f| matches!(f, Frame::TokenAck { .. }))
            .await?;
        if let Frame::TokenAck { error, .. } = response {
            if error == crate::frame::AUTH_REJECTED {
                return Err(Error::AuthFailed(format!(
                    "{} stream token rejected",
                    self.kind.name()
                )));
            }
            if error != 0 {
                return Err(Error::Protocol(format!(
                    "token ack carried error 0x{error:08x}"
                )));
            }
        }
        debug!(stream = self.kind.name(), "token accepted");
        Ok(())
    }

    /// Transition into Ready: announce readiness, then spawn the
    /// receive and send/timer tasks.
    pub(crate) fn start(self, delivery: Delivery) -> StreamHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_DEPTH);
        let (health_tx, health_rx) = watch::channel(StreamHealth::Running);
        let health_tx = Arc::new(health_tx);

        let tracker = Arc::new(Mutex::new(SeqTracker::new(
            self.kind.requests_retransmits(),
        )));
        // Seed the watchdog with "now" so a radio that goes silent right
        // after the handshake still trips it.
        let last_rx = Arc::new(AtomicU64::new(
            (self.epoch.elapsed().as_millis() as u64).max(1),
        ));

        let rx_task = tokio::spawn(rx_loop(RxLoop {
            kind: self.kind,
            socket: Arc::clone(&self.socket),
            tracker: Arc::clone(&tracker),
            stats: Arc::clone(&self.stats),
            cmd_tx: cmd_tx.clone(),
            delivery,
            health: Arc::clone(&health_tx),
            health_rx: health_rx.clone(),
            last_rx: Arc::clone(&last_rx),
            epoch: self.epoch,
        }));

        let tx_task = tokio::spawn(tx_loop(TxLoop {
            kind: self.kind,
            socket: Arc::clone(&self.socket),
            local_sid: self.local_sid,
            remote_sid: self.remote_sid,
            tracker,
            txbuf: RetransmitBuffer::new(AUDIO_TX_WINDOW),
            stats: Arc::clone(&self.stats),
            cmd_rx,
            health: health_tx,
            last_rx,
            epoch: self.epoch,
        }));

        StreamHandle {
            kind: self.kind,
            cmd_tx,
            health: health_rx,
            rx_task,
            tx_task,
        }
    }
}

/// Handle to a running stream.
#[derive(Debug)]
pub struct StreamHandle {
    kind: StreamKind,
    cmd_tx: mpsc::Sender<TxCommand>,
    health: watch::Receiver<StreamHealth>,
    rx_task: JoinHandle<()>,
    tx_task: JoinHandle<()>,
}

impl StreamHandle {
    /// This stream's kind.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Sender for this stream's command channel.
    pub(crate) fn sender(&self) -> mpsc::Sender<TxCommand> {
        self.cmd_tx.clone()
    }

    /// Queue an opaque payload for sequenced transmission.
    pub async fn send_payload(&self, bytes: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(TxCommand::Payload(bytes))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Watch for the stream leaving [`StreamHealth::Running`].
    pub fn health(&self) -> watch::Receiver<StreamHealth> {
        self.health.clone()
    }

    /// Orderly teardown: flush, send a session close, stop both tasks.
    pub async fn close(self) {
        let _ = self.cmd_tx.send(TxCommand::Close).await;
        let _ = self.tx_task.await;
        self.rx_task.abort();
        let _ = self.rx_task.await;
    }

    /// Abort both tasks without the close frame (used when the whole
    /// client is being torn down after a failure).
    pub fn abort(self) {
        self.rx_task.abort();
        self.tx_task.abort();
    }
}

struct RxLoop {
    kind: StreamKind,
    socket: Arc<UdpSocket>,
    tracker: Arc<Mutex<SeqTracker>>,
    stats: Arc<NetStats>,
    cmd_tx: mpsc::Sender<TxCommand>,
    delivery: Delivery,
    health: Arc<watch::Sender<StreamHealth>>,
    health_rx: watch::Receiver<StreamHealth>,
    last_rx: Arc<AtomicU64>,
    epoch: Instant,
}

/// Receive loop: decode datagrams, track sequence state, deliver
/// payloads in arrival order, answer pings, relay retransmit requests
/// to the send task.
async fn rx_loop(mut ctx: RxLoop) {
    let mut buf = [0u8; 4096];
    let mut io_errors: u32 = 0;

    loop {
        let n = tokio::select! {
            res = tokio::time::timeout(RECV_TIMEOUT, ctx.socket.recv(&mut buf)) => {
                match res {
                    Ok(Ok(n)) => {
                        io_errors = 0;
                        n
                    }
                    Ok(Err(e)) => {
                        // One transient retry, then escalate.
                        io_errors += 1;
                        if io_errors > 1 {
                            warn!(stream = ctx.kind.name(), error = %e, "socket failed");
                            let _ = ctx.health.send(StreamHealth::TimedOut);
                            return;
                        }
                        continue;
                    }
                    Err(_) => {
                        // Receive timeout: age the gap state while idle.
                        let now = Instant::now();
                        let (due, lost) = {
                            let mut tracker = ctx.tracker.lock().expect("tracker poisoned");
                            (tracker.due_requests(now), tracker.expire_lost(now))
                        };
                        ctx.stats.add_lost(lost);
                        if !due.is_empty() {
                            ctx.stats.add_retransmit_request();
                            let _ = ctx.cmd_tx.send(TxCommand::RequestRetransmit(due)).await;
                        }
                        continue;
                    }
                }
            }
            _ = ctx.health_rx.changed() => return,
        };

        ctx.stats.add_bytes_down(n);
        let now_ms = ctx.epoch.elapsed().as_millis() as u64;
        ctx.last_rx.store(now_ms, Ordering::Relaxed);

        let frame = match Frame::decode(&buf[..n]) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(stream = ctx.kind.name(), error = %e, "dropping malformed datagram");
                ctx.stats.add_malformed();
                continue;
            }
        };

        match frame {
            Frame::Idle { .. } => {}
            Frame::Data { seq, payload, .. } => {
                let now = Instant::now();
                let (outcome, due, lost) = {
                    let mut tracker = ctx.tracker.lock().expect("tracker poisoned");
                    (
                        tracker.note_rx(seq, now),
                        tracker.due_requests(now),
                        tracker.expire_lost(now),
                    )
                };
                ctx.stats.add_lost(lost);
                if !due.is_empty() {
                    ctx.stats.add_retransmit_request();
                    let _ = ctx.cmd_tx.send(TxCommand::RequestRetransmit(due)).await;
                }
                match outcome {
                    RxOutcome::Deliver | RxOutcome::FilledGap => {
                        if let Some(tx) = &ctx.delivery.payload_tx {
                            if tx.send((seq, payload)).await.is_err() {
                                // Consumer went away; nothing left to feed.
                                return;
                            }
                        }
                    }
                    RxOutcome::Duplicate => {
                        trace!(stream = ctx.kind.name(), seq, "dropping duplicate");
                    }
                }
            }
            Frame::Ping {
                reply: false, id, ..
            } => {
                let _ = ctx.cmd_tx.send(TxCommand::PingReply { id }).await;
            }
            Frame::Ping {
                reply: true, id, ..
            } => {
                let rtt = (now_ms as u32).wrapping_sub(id);
                // Guard against a peer echoing garbage ids.
                if rtt < 60_000 {
                    ctx.stats.record_rtt(rtt);
                }
            }
            Frame::RetransmitRequest { seqs, .. } => {
                trace!(
                    stream = ctx.kind.name(),
                    count = seqs.len(),
                    "peer requested retransmit"
                );
                let _ = ctx.cmd_tx.send(TxCommand::Resend(seqs)).await;
            }
            Frame::Disconnect { .. } => {
                debug!(stream = ctx.kind.name(), "peer closed session");
                let _ = ctx.health.send(StreamHealth::PeerClosed);
                return;
            }
            other => {
                if let Some(tx) = &ctx.delivery.status_tx {
                    let _ = tx.send(other).await;
                } else {
                    trace!(stream = ctx.kind.name(), "ignoring non-data frame");
                }
            }
        }
    }
}

struct TxLoop {
    kind: StreamKind,
    socket: Arc<UdpSocket>,
    local_sid: u32,
    remote_sid: u32,
    tracker: Arc<Mutex<SeqTracker>>,
    txbuf: RetransmitBuffer,
    stats: Arc<NetStats>,
    cmd_rx: mpsc::Receiver<TxCommand>,
    health: Arc<watch::Sender<StreamHealth>>,
    last_rx: Arc<AtomicU64>,
    epoch: Instant,
}

/// Send/timer loop: sequenced payload transmission with retransmit
/// buffering, idle pings, and the receive watchdog.
async fn tx_loop(mut ctx: TxLoop) {
    // Announce readiness before the first ping.
    let ready = Frame::Ready {
        from: ctx.local_sid,
        to: ctx.remote_sid,
    }
    .encode();
    if ctx.socket.send(&ready).await.is_ok() {
        ctx.stats.add_bytes_up(ready.len());
    }

    let mut ping = tokio::time::interval(IDLE_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ping_seq: u16 = 0;

    loop {
        tokio::select! {
            cmd = ctx.cmd_rx.recv() => {
                match cmd {
                    Some(TxCommand::Payload(bytes)) => {
                        let seq = ctx
                            .tracker
                            .lock()
                            .expect("tracker poisoned")
                            .next_tx();
                        let wire = Frame::Data {
                            seq,
                            from: ctx.local_sid,
                            to: ctx.remote_sid,
                            payload: bytes,
                        }
                        .encode();
                        ctx.txbuf.add(seq, wire.clone());
                        if send_wire(&mut ctx, &wire).await.is_err() {
                            return;
                        }
                    }
                    Some(TxCommand::Resend(seqs)) => {
                        for seq in seqs {
                            match ctx.txbuf.get(seq) {
                                Some(wire) => {
                                    if send_wire(&mut ctx, &wire).await.is_err() {
                                        return;
                                    }
                                }
                                None => {
                                    // Aged out of the buffer: skip silently.
                                    trace!(stream = ctx.kind.name(), seq, "retransmit miss");
                                }
                            }
                        }
                    }
                    Some(TxCommand::RequestRetransmit(seqs)) => {
                        let wire = Frame::RetransmitRequest {
                            from: ctx.local_sid,
                            to: ctx.remote_sid,
                            seqs,
                        }
                        .encode();
                        if send_wire(&mut ctx, &wire).await.is_err() {
                            return;
                        }
                    }
                    Some(TxCommand::PingReply { id }) => {
                        let wire = Frame::Ping {
                            seq: ping_seq,
                            from: ctx.local_sid,
                            to: ctx.remote_sid,
                            reply: true,
                            id,
                        }
                        .encode();
                        ping_seq = ping_seq.wrapping_add(1);
                        if send_wire(&mut ctx, &wire).await.is_err() {
                            return;
                        }
                    }
                    Some(TxCommand::Close) | None => {
                        let wire = Frame::Disconnect {
                            from: ctx.local_sid,
                            to: ctx.remote_sid,
                        }
                        .encode();
                        let _ = ctx.socket.send(&wire).await;
                        ctx.stats.add_bytes_up(wire.len());
                        let _ = ctx.health.send(StreamHealth::Closed);
                        debug!(stream = ctx.kind.name(), "session closed");
                        return;
                    }
                }
            }
            _ = ping.tick() => {
                // Watchdog: fail the stream when the radio goes silent.
                let now_ms = ctx.epoch.elapsed().as_millis() as u64;
                let last = ctx.last_rx.load(Ordering::Relaxed);
                if last > 0 && now_ms.saturating_sub(last) > WATCHDOG_TIMEOUT.as_millis() as u64 {
                    warn!(stream = ctx.kind.name(), "watchdog expired");
                    let _ = ctx.health.send(StreamHealth::TimedOut);
                    return;
                }

                let wire = Frame::Ping {
                    seq: ping_seq,
                    from: ctx.local_sid,
                    to: ctx.remote_sid,
                    reply: false,
                    id: now_ms as u32,
                }
                .encode();
                ping_seq = ping_seq.wrapping_add(1);
                if send_wire(&mut ctx, &wire).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Send one frame, with a single transient retry before escalating to
/// a stream failure.
async fn send_wire(ctx: &mut TxLoop, wire: &[u8]) -> Result<()> {
    for attempt in 0..2 {
        match ctx.socket.send(wire).await {
            Ok(_) => {
                ctx.stats.add_bytes_up(wire.len());
                return Ok(());
            }
            Err(e) if attempt == 0 => {
                debug!(stream = ctx.kind.name(), error = %e, "send failed, retrying");
            }
            Err(e) => {
                warn!(stream = ctx.kind.name(), error = %e, "send failed");
                let _ = ctx.health.send(StreamHealth::TimedOut);
                return Err(Error::Io(e));
            }
        }
    }
    unreachable!("send loop returns within two attempts")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal scripted peer: a plain UDP socket that answers the
    /// session-open handshake.
    async fn peer_socket() -> (UdpSocket, std::net::SocketAddr) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    async fn answer_open(peer: &UdpSocket, peer_sid: u32) -> (u32, std::net::SocketAddr) {
        let mut buf = [0u8; 256];
        let (n, from_addr) = peer.recv_from(&mut buf).await.unwrap();
        let frame = Frame::decode(&buf[..n]).unwrap();
        let client_sid = match frame {
            Frame::SessionOpen { from, .. } => from,
            other => panic!("expected SessionOpen, got {other:?}"),
        };
        let resp = Frame::SessionResponse {
            seq: 0,
            from: peer_sid,
            to: client_sid,
        };
        peer.send_to(&resp.encode(), from_addr).await.unwrap();
        (client_sid, from_addr)
    }

    #[tokio::test]
    async fn open_learns_remote_sid() {
        let (peer, addr) = peer_socket().await;
        let stats = Arc::new(NetStats::new());

        let open = tokio::spawn(async move {
            StreamSession::open(StreamKind::Control, addr, stats).await
        });
        let (client_sid, _) = answer_open(&peer, 0xBEEF_0001).await;

        let session = open.await.unwrap().unwrap();
        assert_eq!(session.remote_sid(), 0xBEEF_0001);
        assert_eq!(session.local_sid(), client_sid);
    }

    #[tokio::test]
    async fn open_retries_until_answered() {
        let (peer, addr) = peer_socket().await;
        let stats = Arc::new(NetStats::new());

        let open = tokio::spawn(async move {
            StreamSession::open(StreamKind::Serial, addr, stats).await
        });

        // Ignore the first two opens, answer the third.
        let mut buf = [0u8; 256];
        let mut client = None;
        for _ in 0..3 {
            let (n, from_addr) = peer.recv_from(&mut buf).await.unwrap();
            if let Frame::SessionOpen { from, .. } = Frame::decode(&buf[..n]).unwrap() {
                client = Some((from, from_addr));
            }
        }
        let (client_sid, from_addr) = client.unwrap();
        let resp = Frame::SessionResponse {
            seq: 0,
            from: 0x0D10_CAFE,
            to: client_sid,
        };
        peer.send_to(&resp.encode(), from_addr).await.unwrap();

        let session = open.await.unwrap().unwrap();
        assert_eq!(session.remote_sid(), 0x0D10_CAFE);
    }

    #[tokio::test]
    async fn open_times_out_without_peer() {
        // A bound socket nobody answers on.
        let (_peer, addr) = peer_socket().await;
        let stats = Arc::new(NetStats::new());
        let result = StreamSession::open(StreamKind::Audio, addr, stats).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn running_session_answers_pings_and_serves_retransmits() {
        let (peer, addr) = peer_socket().await;
        let stats = Arc::new(NetStats::new());

        let open = tokio::spawn(async move {
            StreamSession::open(StreamKind::Serial, addr, Arc::clone(&stats)).await
        });
        let (client_sid, client_addr) = answer_open(&peer, 0x1000_0001).await;
        let session = open.await.unwrap().unwrap();

        let handle = session.start(Delivery::default());

        // Send a payload; capture its data frame.
        handle.send_payload(vec![0xFE, 0xFD]).await.unwrap();
        let mut buf = [0u8; 2048];
        let (data_seq, original) = loop {
            let (n, _) = peer.recv_from(&mut buf).await.unwrap();
            match Frame::decode(&buf[..n]) {
                Ok(Frame::Data { seq, .. }) => break (seq, buf[..n].to_vec()),
                _ => continue, // ready frames, pings
            }
        };

        // Request a retransmit; expect byte-identical output.
        let req = Frame::RetransmitRequest {
            from: 0x1000_0001,
            to: client_sid,
            seqs: vec![data_seq],
        };
        peer.send_to(&req.encode(), client_addr).await.unwrap();
        let resent = loop {
            let (n, _) = peer.recv_from(&mut buf).await.unwrap();
            if let Ok(Frame::Data { .. }) = Frame::decode(&buf[..n]) {
                break buf[..n].to_vec();
            }
        };
        assert_eq!(resent, original);

        // Ping probe gets an echo with the same id.
        let probe = Frame::Ping {
            seq: 9,
            from: 0x1000_0001,
            to: client_sid,
            reply: false,
            id: 0x00C0FFEE,
        };
        peer.send_to(&probe.encode(), client_addr).await.unwrap();
        let echoed = loop {
            let (n, _) = peer.recv_from(&mut buf).await.unwrap();
            if let Ok(Frame::Ping {
                reply: true, id, ..
            }) = Frame::decode(&buf[..n])
            {
                break id;
            }
        };
        assert_eq!(echoed, 0x00C0FFEE);

        handle.close().await;
    }

    #[tokio::test]
    async fn close_sends_disconnect() {
        let (peer, addr) = peer_socket().await;
        let stats = Arc::new(NetStats::new());

        let open = tokio::spawn(async move {
            StreamSession::open(StreamKind::Control, addr, stats).await
        });
        let (_client_sid, _) = answer_open(&peer, 2).await;
        let session = open.await.unwrap().unwrap();
        let handle = session.start(Delivery::default());
        handle.close().await;

        let mut buf = [0u8; 256];
        let saw_disconnect = loop {
            let (n, _) = peer.recv_from(&mut buf).await.unwrap();
            match Frame::decode(&buf[..n]) {
                Ok(Frame::Disconnect { .. }) => break true,
                Ok(_) => continue,
                Err(_) => continue,
            }
        };
        assert!(saw_disconnect);
    }
}
