//! Test harness for shacklink: a scriptable mock radio.
//!
//! Protocol engines are miserable to test against real hardware. This
//! crate provides [`MockRadio`], a loopback UDP implementation of the
//! radio side of the session protocol, with scriptable CI-V responses,
//! packet-drop injection, and capture of everything the client sends.

pub mod mock_radio;

pub use mock_radio::{MockRadio, MOCK_RADIO_NAME, MOCK_TOKEN};
