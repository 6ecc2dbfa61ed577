//! Radio state change events.
//!
//! Events are emitted by the CI-V controller and the stream supervisor
//! through a [`tokio::sync::broadcast`] channel. The terminal status
//! dashboard (an external collaborator) subscribes to these instead of
//! polling the state mirror. Delivery is best-effort; a slow consumer
//! may miss events under load.

use crate::types::{AgcMode, Filter, Mode, SplitMode};

/// An event emitted when mirrored radio state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// Main VFO frequency changed.
    FrequencyChanged {
        /// New frequency in hertz.
        freq_hz: u64,
    },

    /// Sub VFO frequency changed. Only meaningful on radios that
    /// expose a sub VFO; stale otherwise.
    SubFrequencyChanged {
        /// New frequency in hertz.
        freq_hz: u64,
    },

    /// Operating mode, data-mode flag, or filter changed on the main VFO.
    ModeChanged {
        /// New operating mode.
        mode: Mode,
        /// Whether data mode is active.
        data: bool,
        /// Selected IF filter.
        filter: Filter,
    },

    /// Mode change on the sub VFO.
    SubModeChanged {
        /// New operating mode.
        mode: Mode,
        /// Whether data mode is active.
        data: bool,
        /// Selected IF filter.
        filter: Filter,
    },

    /// PTT or antenna-tuner state changed.
    PttChanged {
        /// `true` while transmitting.
        ptt: bool,
        /// `true` while the antenna tuner is running.
        tune: bool,
    },

    /// Split/duplex state changed.
    SplitChanged(SplitMode),

    /// Tuning step changed.
    TuningStepChanged {
        /// Step size in hertz.
        step_hz: u32,
    },

    /// S-meter reading.
    SMeter {
        /// S-level index 0..=18 (0..=9 plain, 10..=18 are the "9+"
        /// steps).
        level: u8,
        /// Rendered label, e.g. "S7" or "S9+20".
        label: String,
    },

    /// SWR reading (during TX or tune).
    Swr {
        /// Standing wave ratio, 1.0 = perfect match.
        swr: f64,
    },

    /// Drain voltage reading.
    Vd {
        /// Supply voltage in volts.
        volts: f64,
    },

    /// Receiver overflow indicator changed.
    Ovf(bool),

    /// RF power level changed (0..=255).
    PowerChanged(u8),

    /// RF gain changed (0..=255).
    RfGainChanged(u8),

    /// Squelch level changed (0..=255).
    SquelchChanged(u8),

    /// Noise reduction changed.
    NrChanged {
        /// Whether NR is enabled.
        enabled: bool,
        /// NR level (0..=255).
        level: u8,
    },

    /// Preamp setting changed (0 = off, 1..=2 = stage).
    PreampChanged(u8),

    /// AGC time constant changed.
    AgcChanged(AgcMode),

    /// Periodic status report from the control stream.
    Status {
        /// Battery level, 0..=255 as reported by the radio.
        battery: u8,
        /// Raw connection flags from the status frame.
        flags: u8,
    },

    /// All three streams reached Ready.
    Connected,

    /// The link was lost (watchdog or peer close).
    Disconnected,

    /// Attempting to reconnect after a connection loss.
    Reconnecting {
        /// The reconnection attempt number (1-based).
        attempt: u32,
    },
}
