//! shacklink-proto: the Icom network (UDP) protocol engine.
//!
//! This crate implements the three-stream link layer the radio speaks:
//!
//! - [`frame`]: the datagram codec (header, kinds, auth frames)
//! - [`seq`]: sequence allocation, duplicate suppression, gap aging
//! - [`txbuf`]: the time-bounded retransmit buffer
//! - [`session`]: the generic open/auth/ping/watchdog session
//! - [`control`], [`serial`], [`audio`]: the three concrete streams
//! - [`stats`]: rolling per-minute network counters
//!
//! The control stream opens first and logs in; the token it learns
//! authenticates the serial and audio streams. CI-V interpretation of
//! the serial bytes lives in `shacklink-civ`; the supervisor in the
//! `shacklink` facade wires the two together.

pub mod audio;
pub mod control;
pub mod frame;
pub mod seq;
pub mod serial;
pub mod session;
pub mod stats;
pub mod txbuf;

pub use audio::{AudioReceiver, AudioSender, AudioStream, JitterBuffer};
pub use control::ControlStream;
pub use frame::Frame;
pub use seq::{SeqTracker, RxOutcome};
pub use serial::SerialStream;
pub use session::{StreamHandle, StreamHealth, StreamKind, StreamSession};
pub use stats::{NetStats, NetStatsSnapshot};
pub use txbuf::{RetransmitBuffer, AUDIO_TX_WINDOW};
