//! heatlink-test-harness: Test utilities for heatlink.
//!
//! This crate provides [`MockTransport`], a scripted stand-in for the heat
//! pump's serial line, so the protocol engine can be exercised
//! deterministically without hardware.

pub mod mock_serial;

pub use mock_serial::MockTransport;
