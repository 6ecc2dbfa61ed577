//! Error types for shacklink.
//!
//! All fallible operations across the workspace return [`Result<T>`],
//! which uses [`Error`] as the error type. Link-layer, handshake, CI-V,
//! and I/O failures are all captured here.

/// The error type for all shacklink operations.
///
/// Variants map onto the failure modes of the UDP link layer and the
/// CI-V control channel: malformed datagrams, rejected credentials,
/// watchdog expiry, orderly peer shutdown, and plain socket trouble.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A UDP frame that is too short, has a bad length prefix, or an
    /// unknown kind tag. Dropped and counted; never fatal by itself.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The radio rejected our login or connection token.
    ///
    /// Fatal for the stream that saw it: wrong credentials will not
    /// get better by retrying.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The stream watchdog expired with no frames from the radio.
    ///
    /// The supervisor responds by reconnecting the whole client (all
    /// three streams) from scratch.
    #[error("stream '{0}' timed out")]
    StreamTimeout(&'static str),

    /// The radio sent an orderly session close.
    #[error("peer closed the session")]
    PeerClosed,

    /// A protocol-level violation (unexpected handshake frame, CI-V
    /// response that cannot be parsed, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a response.
    #[error("timeout waiting for response")]
    Timeout,

    /// No connection to the radio has been established, or the stream
    /// the operation needed has already shut down.
    #[error("not connected")]
    NotConnected,

    /// The connection to the radio was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An invalid parameter was passed to a control operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_malformed() {
        let e = Error::MalformedFrame("short datagram".into());
        assert_eq!(e.to_string(), "malformed frame: short datagram");
    }

    #[test]
    fn error_display_auth_failed() {
        let e = Error::AuthFailed("bad password".into());
        assert_eq!(e.to_string(), "authentication failed: bad password");
    }

    #[test]
    fn error_display_stream_timeout() {
        let e = Error::StreamTimeout("serial");
        assert_eq!(e.to_string(), "stream 'serial' timed out");
    }

    #[test]
    fn error_display_peer_closed() {
        assert_eq!(Error::PeerClosed.to_string(), "peer closed the session");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn error_implements_std_error() {
        fn assert_std_error<T: std::error::Error>() {}
        assert_std_error::<Error>();
    }
}
