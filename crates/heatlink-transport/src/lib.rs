//! Transport implementations for heatlink.
//!
//! This crate provides the concrete [`Transport`](heatlink_core::Transport)
//! used to reach a heat pump controller:
//!
//! - [`SerialTransport`]: RS-232 and USB serial adapters on the controller's
//!   service interface
//!
//! Tests use `MockTransport` from `heatlink-test-harness` instead.

pub mod serial;

pub use serial::{DataBits, Parity, SerialConfig, SerialTransport, StopBits};
