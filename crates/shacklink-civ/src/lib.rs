//! shacklink-civ: Icom CI-V codec and controller.
//!
//! CI-V is Icom's binary control protocol
//! (`0xFE 0xFE <dst> <src> <cmd> ... 0xFD`); here it rides the serial
//! UDP stream instead of a physical bus. This crate provides:
//!
//! - [`civ`]: packet framing and stream extraction
//! - [`bcd`]: BCD frequencies, level bytes, meter scales
//! - [`commands`]: the logical command catalog and request builder
//! - [`controller`]: the request/response state machine -- mirrored
//!   radio state, one command slot per operation, 500 ms retry, 1 s
//!   status polling, PTT and tune timeouts
//!
//! The controller is transport-agnostic: it writes request bytes into
//! an injected channel and is fed decoded packets by whoever owns the
//! serial stream.

pub mod bcd;
pub mod civ;
pub mod commands;
pub mod controller;

pub use commands::SlotId;
pub use controller::{
    CivController, ControllerOptions, RadioState, COMMAND_RETRY_TIMEOUT, PTT_TIMEOUT,
    STATUS_POLL_INTERVAL, TUNE_TIMEOUT,
};
