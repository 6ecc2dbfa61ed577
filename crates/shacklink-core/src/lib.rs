//! shacklink-core: shared types, errors, and events for shacklink.
//!
//! This crate defines the radio-state vocabulary that the protocol
//! engine (`shacklink-proto`) and the CI-V controller (`shacklink-civ`)
//! exchange, without pulling in any networking.
//!
//! # Key types
//!
//! - [`Error`] / [`Result`] -- error handling across the workspace
//! - [`Mode`], [`Filter`], [`SplitMode`], [`TuningStep`] -- mirrored
//!   radio state
//! - [`Band`] -- band table with the "general" sentinel
//! - [`RadioEvent`] -- asynchronous state change notifications
//! - [`Config`] -- the immutable startup configuration snapshot

pub mod band;
pub mod config;
pub mod error;
pub mod events;
pub mod types;

// Re-export key types at crate root for ergonomic `use shacklink_core::*`.
pub use band::{Band, BandRange};
pub use config::{Config, DEFAULT_CONTROL_PORT};
pub use error::{Error, Result};
pub use events::RadioEvent;
pub use types::{AgcMode, Filter, Mode, PreampLevel, SplitMode, TuningStep};
