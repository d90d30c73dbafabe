//! Transport trait for heat pump communication.
//!
//! The [`Transport`] trait abstracts over the physical link to the heat pump
//! controller: in practice an RS-232 or USB serial adapter, and in tests the
//! scripted `MockTransport` from the `heatlink-test-harness` crate.
//!
//! The protocol engine never reads from a transport directly. A background
//! IO task owns it, pushes every received byte into the ingest buffer and
//! performs writes and reconnects on behalf of the exchange state machine.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{Error, Result};

/// Asynchronous byte-level transport to a heat pump.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the device.
    ///
    /// Implementations should block until all bytes have been written to
    /// the underlying transport.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the device into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`] if nothing is received
    /// within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`].
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Drop the current connection and open it again with the same settings.
    ///
    /// The exchange state machine calls this when the device starts echoing
    /// unrelated bytes instead of answering requests.
    async fn reconnect(&mut self) -> Result<()> {
        Err(Error::Unsupported("reconnect".into()))
    }
}
