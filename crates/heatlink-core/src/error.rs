//! Error types for heatlink.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, framing, exchange and
//! schema errors are all captured here.
//!
//! Only transport and schema failures are fatal to the calling operation
//! (see [`Error::is_fatal`]). Everything the device can get wrong on the wire
//! is retried by the exchange state machine before it surfaces as one of the
//! recoverable variants.

/// Reason a received frame failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Fewer than the 5 bytes of header, checksum and footer.
    #[error("frame too short ({len} bytes)")]
    TooShort { len: usize },

    /// The first byte is not `HEADERSTART`.
    #[error("bad header byte 0x{found:02X}")]
    BadHeader { found: u8 },

    /// The frame does not end with `ESCAPE END`.
    #[error("missing ESCAPE END footer")]
    BadFooter,

    /// The checksum byte does not match the recomputed checksum.
    #[error("checksum mismatch: frame carries 0x{found:02X}, computed 0x{computed:02X}")]
    ChecksumMismatch { found: u8, computed: u8 },
}

/// The error type for all heatlink operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port open/configure/write failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (unexpected or malformed device reply).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a byte from the device.
    #[error("timeout waiting for data")]
    Timeout,

    /// The operation is not supported by this transport or request.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An invalid parameter was passed to a builder or setting encoder.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No connection to the device has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the device was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// The ingest buffer was stopped; no more bytes will be delivered.
    #[error("ingest buffer stopped")]
    Stopped,

    /// The ingest buffer is full and the byte was rejected.
    #[error("ingest buffer full (capacity {capacity} bytes)")]
    BufferFull { capacity: usize },

    /// The device never answered `STARTCOMMUNICATION` with `ESCAPE`.
    #[error("communication could not be established after {attempts} handshake attempts")]
    HandshakeFailed { attempts: u32 },

    /// The request retry budget ran out without a valid response frame.
    #[error("no data available for request {request} after {attempts} attempts")]
    NoDataAvailable { request: String, attempts: u32 },

    /// A received frame failed header, footer or checksum validation.
    #[error("frame validation failed: {0}")]
    FrameValidation(#[from] FrameError),

    /// The schema data is inconsistent or could not be parsed.
    #[error("schema error: {0}")]
    Schema(String),

    /// No schema exists for the requested device/firmware identifier.
    #[error("no schema found for {0}")]
    SchemaNotFound(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A schema file could not be deserialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error should abort the calling operation rather than
    /// being retried or reported as an empty result.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::NotConnected
                | Error::ConnectionLost
                | Error::Stopped
                | Error::Io(_)
                | Error::Schema(_)
                | Error::SchemaNotFound(_)
                | Error::Json(_)
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("port busy".into());
        assert_eq!(e.to_string(), "transport error: port busy");
    }

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for data");
    }

    #[test]
    fn error_display_handshake_failed() {
        let e = Error::HandshakeFailed { attempts: 3 };
        assert_eq!(
            e.to_string(),
            "communication could not be established after 3 handshake attempts"
        );
    }

    #[test]
    fn error_display_no_data_available() {
        let e = Error::NoDataAvailable {
            request: "Sensors".into(),
            attempts: 10,
        };
        assert_eq!(
            e.to_string(),
            "no data available for request Sensors after 10 attempts"
        );
    }

    #[test]
    fn error_display_checksum_mismatch() {
        let e: Error = FrameError::ChecksumMismatch {
            found: 0x10,
            computed: 0xFE,
        }
        .into();
        assert_eq!(
            e.to_string(),
            "frame validation failed: checksum mismatch: frame carries 0x10, computed 0xFE"
        );
    }

    #[test]
    fn error_display_buffer_full() {
        let e = Error::BufferFull { capacity: 16 };
        assert_eq!(e.to_string(), "ingest buffer full (capacity 16 bytes)");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::Transport("x".into()).is_fatal());
        assert!(Error::ConnectionLost.is_fatal());
        assert!(Error::SchemaNotFound("2.06".into()).is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::HandshakeFailed { attempts: 1 }.is_fatal());
        assert!(!Error::FrameValidation(FrameError::BadFooter).is_fatal());
        assert!(!Error::NoDataAvailable {
            request: "x".into(),
            attempts: 1
        }
        .is_fatal());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
