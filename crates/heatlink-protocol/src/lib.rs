//! Heat pump serial protocol engine for heatlink.
//!
//! This crate implements the half-duplex, byte-stuffed request/response
//! protocol spoken by the heat pump controller. It provides:
//!
//! - **Frame codec** ([`frame`]) -- checksum, `0x10` byte stuffing and
//!   de-stuffing, frame validation and GET/SET message construction.
//! - **Ingest buffer** ([`buffer`]) -- bounded byte FIFO between the IO task
//!   and the protocol logic, with mark/reset and stop semantics.
//! - **Exchange state machine** ([`exchange`]) -- handshake, data-available
//!   wait, acknowledgement, payload collection and recovery.
//! - **Record decoder** ([`decoder`]) -- turns a validated frame into named,
//!   scaled values using the schema's record definitions.
//! - **Session** ([`session`]) -- one connected heat pump: pacing, schema
//!   handling and grouped reads.
//! - **SessionBuilder** ([`builder`]) -- fluent builder for sessions.
//!
//! # Example
//!
//! ```
//! use heatlink_protocol::frame::{add_duplicated_bytes, build_get_request, validate_frame};
//!
//! // Request for the sensor block
//! let request = build_get_request(0xFB);
//! assert_eq!(request, vec![0x01, 0x00, 0xFC, 0xFB, 0x10, 0x03]);
//!
//! // A response carrying 0x10 is stuffed on the wire
//! let wire = add_duplicated_bytes(&[0x01, 0x00, 0x0C, 0xFB, 0x10, 0x00, 0x10, 0x03]);
//! assert_eq!(wire, vec![0x01, 0x00, 0x0C, 0xFB, 0x10, 0x10, 0x00, 0x10, 0x03]);
//! assert!(validate_frame(&[0x01, 0x00, 0x0C, 0xFB, 0x10, 0x00, 0x10, 0x03]).is_ok());
//! ```

pub mod buffer;
pub mod builder;
pub mod decoder;
pub mod exchange;
pub mod frame;
mod io;
pub mod session;

pub use buffer::IngestBuffer;
pub use builder::SessionBuilder;
pub use exchange::ExchangeConfig;
pub use session::{Session, SessionConfig};
