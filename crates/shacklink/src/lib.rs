//! # shacklink -- network remote control for Icom transceivers
//!
//! `shacklink` talks to an Icom networked transceiver (IC-705 class)
//! over the radio's native UDP remote-control protocol and exposes its
//! CI-V control channel and audio streams to local consumers --
//! replacing the vendor's Windows-only remote application on any host.
//!
//! ## Quick start
//!
//! ```no_run
//! use shacklink::{Config, RadioClient};
//!
//! #[tokio::main]
//! async fn main() -> shacklink::Result<()> {
//!     let config = Config {
//!         host: "ic-705.local".into(),
//!         username: "kilo".into(),
//!         password: "secret".into(),
//!         ..Config::default()
//!     };
//!
//!     let client = RadioClient::connect(config).await?;
//!     println!("connected to {}", client.radio_name());
//!
//!     client.civ().set_main_vfo_freq(14_250_000)?;
//!
//!     let mut events = client.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized as a workspace of focused crates:
//!
//! | Crate                    | Purpose                                      |
//! |--------------------------|----------------------------------------------|
//! | `shacklink-core`         | Types, errors, events, configuration         |
//! | `shacklink-proto`        | UDP link layer: frame codec, sessions, audio |
//! | `shacklink-civ`          | CI-V codec and controller                    |
//! | `shacklink-test-harness` | Mock radio for protocol-level tests          |
//! | **`shacklink`**          | This facade: re-exports + [`RadioClient`]    |
//!
//! Three UDP sessions (control, serial, audio) run in parallel, each
//! with sequence-numbered retransmission, idle pings, and a watchdog.
//! The control stream logs in and obtains the token that authenticates
//! the other two. The CI-V controller rides the serial stream and
//! keeps a mirror of the radio state (frequency, mode, PTT, meters)
//! with retries, periodic polling, and PTT/tune timeouts.
//!
//! External collaborators -- the terminal dashboard, the TCP/PTY
//! serial bridge, and the OS audio device -- attach through the
//! handles on [`RadioClient`]: [`RadioClient::subscribe`],
//! [`RadioClient::bridge_reader`] / [`RadioClient::bridge_writer`],
//! and [`RadioClient::audio_receiver`] / [`RadioClient::audio_sender`].

pub mod client;

pub use client::{run, RadioClient};

pub use shacklink_core::{
    AgcMode, Band, BandRange, Config, Error, Filter, Mode, PreampLevel, RadioEvent, Result,
    SplitMode, TuningStep,
};

/// The CI-V codec and controller.
pub mod civ {
    pub use shacklink_civ::{
        bcd, civ::*, commands, CivController, ControllerOptions, RadioState, SlotId,
    };
}

/// The UDP protocol engine.
pub mod proto {
    pub use shacklink_proto::{
        AudioReceiver, AudioSender, Frame, JitterBuffer, NetStats, NetStatsSnapshot,
        RetransmitBuffer, SeqTracker, StreamHealth, StreamKind, AUDIO_TX_WINDOW,
    };
}
