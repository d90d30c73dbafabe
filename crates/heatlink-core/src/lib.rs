//! heatlink-core: Core traits, types, and error definitions for heatlink.
//!
//! This crate defines the transport-agnostic pieces shared by the protocol
//! engine, the serial transport and the test harness.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel
//! - [`Request`] / [`RecordDefinition`] -- schema model of one device query
//! - [`Schema`] / [`SchemaProvider`] -- per-firmware request sets
//! - [`Readings`] / [`DecodedValue`] -- decoded response values
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod schema;
pub mod transport;
pub mod types;

pub use error::{Error, FrameError, Result};
pub use schema::{DirectorySchemaProvider, Schema, SchemaFile, SchemaProvider, StaticSchemaProvider};
pub use transport::Transport;
pub use types::*;
