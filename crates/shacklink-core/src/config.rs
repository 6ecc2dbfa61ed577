//! Client configuration.
//!
//! [`Config`] is the immutable snapshot the external argument parser
//! hands to [`RadioClient`](https://docs.rs/shacklink): it is built
//! once at startup and never mutated during a run. The library itself
//! does no CLI parsing.

use std::time::Duration;

/// Default UDP port of the control stream; serial and audio follow at
/// +1 and +2.
pub const DEFAULT_CONTROL_PORT: u16 = 50_001;

/// Configuration snapshot for one client run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Radio hostname or IP address.
    pub host: String,

    /// UDP port of the control stream (serial = +1, audio = +2).
    pub control_port: u16,

    /// Login username.
    pub username: String,

    /// Login password.
    pub password: String,

    /// CI-V address of the radio.
    pub civ_address: u8,

    /// CI-V address of this controller.
    pub controller_address: u8,

    /// TCP port where the external bridge exposes the serial stream.
    pub serial_tcp_port: u16,

    /// Whether the external bridge also creates a local pseudo-terminal.
    pub enable_serial_device: bool,

    /// TCP port for the external hamlib-compatible subprocess.
    pub rigctld_port: u16,

    /// Status dashboard refresh period.
    pub log_interval: Duration,

    /// Automatically switch the radio into data mode when keying PTT.
    pub set_data_mode_on_tx: bool,

    /// Log every CI-V packet at debug level.
    pub debug_packets: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "IC-705".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            username: String::new(),
            password: String::new(),
            civ_address: 0xA4,
            controller_address: 0xE0,
            serial_tcp_port: 4531,
            enable_serial_device: false,
            rigctld_port: 4532,
            log_interval: Duration::from_millis(150),
            set_data_mode_on_tx: false,
            debug_packets: false,
        }
    }
}

impl Config {
    /// UDP port of the serial stream.
    pub fn serial_port(&self) -> u16 {
        self.control_port + 1
    }

    /// UDP port of the audio stream.
    pub fn audio_port(&self) -> u16 {
        self.control_port + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_addresses() {
        let cfg = Config::default();
        assert_eq!(cfg.civ_address, 0xA4);
        assert_eq!(cfg.controller_address, 0xE0);
        assert_eq!(cfg.control_port, 50_001);
    }

    #[test]
    fn stream_ports_are_consecutive() {
        let cfg = Config {
            control_port: 50_001,
            ..Config::default()
        };
        assert_eq!(cfg.serial_port(), 50_002);
        assert_eq!(cfg.audio_port(), 50_003);
    }

    #[test]
    fn default_intervals() {
        let cfg = Config::default();
        assert_eq!(cfg.log_interval, Duration::from_millis(150));
        assert!(!cfg.set_data_mode_on_tx);
        assert!(!cfg.debug_packets);
    }
}
