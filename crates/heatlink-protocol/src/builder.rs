//! SessionBuilder -- fluent builder for constructing [`Session`] instances.
//!
//! Separates configuration from construction so that callers can set up
//! serial port parameters, buffer sizing, retry budgets and pacing before
//! the transport is opened.
//!
//! # Example
//!
//! ```no_run
//! use heatlink_protocol::builder::SessionBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> heatlink_core::Result<()> {
//! let mut session = SessionBuilder::new()
//!     .serial_port("/dev/ttyUSB0")
//!     .request_retries(5)
//!     .inter_request_delay(Duration::from_secs(2))
//!     .build()
//!     .await?;
//! let version = session.detect_version().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use heatlink_core::error::{Error, Result};
use heatlink_core::schema::Schema;
use heatlink_core::transport::Transport;
use heatlink_transport::{SerialConfig, SerialTransport};

use crate::buffer::{
    IngestBuffer, DEFAULT_CAPACITY, DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL,
};
use crate::exchange::ExchangeConfig;
use crate::frame::MIN_FRAME_LEN;
use crate::session::{Session, SessionConfig};

/// Fluent builder for [`Session`].
pub struct SessionBuilder {
    serial_port: Option<String>,
    serial: SerialConfig,
    buffer_capacity: usize,
    poll_interval: Duration,
    poll_attempts: u32,
    config: SessionConfig,
    schema: Option<Schema>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        SessionBuilder {
            serial_port: None,
            serial: SerialConfig::default(),
            buffer_capacity: DEFAULT_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            config: SessionConfig::default(),
            schema: None,
        }
    }

    /// Set the serial port path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the baud rate (default: 9600).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.serial.baud_rate = baud;
        self
    }

    /// Replace the whole serial line configuration.
    pub fn serial_config(mut self, config: SerialConfig) -> Self {
        self.serial = config;
        self
    }

    /// Capacity of the ingest buffer in bytes (default: 16383).
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// How long one buffer read waits for a byte: `attempts` polls of
    /// `interval` each (default: 5 x 10ms).
    pub fn poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.poll_interval = interval;
        self.poll_attempts = attempts;
        self
    }

    /// Handshake attempts per exchange (default: 3).
    pub fn handshake_attempts(mut self, n: u32) -> Self {
        self.config.exchange.handshake_attempts = n;
        self
    }

    /// Times a request is sent before giving up with no data (default: 10).
    pub fn request_retries(mut self, n: u32) -> Self {
        self.config.exchange.request_retries = n;
        self
    }

    /// Reads spent waiting for the data-available marker (default: 100).
    pub fn byte_wait_budget(mut self, n: u32) -> Self {
        self.config.exchange.byte_wait_budget = n;
        self
    }

    /// Reads spent collecting one response payload (default: 1000).
    pub fn payload_budget(mut self, n: u32) -> Self {
        self.config.exchange.payload_budget = n;
        self
    }

    /// Minimum pause between requests (default: 1500ms).
    pub fn inter_request_delay(mut self, delay: Duration) -> Self {
        self.config.inter_request_delay = delay;
        self
    }

    /// Timeout of each transport read in the IO task (default: 100ms).
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Start the session with `schema` already loaded.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_capacity < MIN_FRAME_LEN {
            return Err(Error::InvalidParameter(format!(
                "buffer capacity {} cannot hold a frame",
                self.buffer_capacity
            )));
        }
        if self.poll_attempts == 0 || self.poll_interval.is_zero() {
            return Err(Error::InvalidParameter(
                "buffer polling needs a non-zero interval and attempt count".into(),
            ));
        }
        let exchange = &self.config.exchange;
        if exchange.request_retries == 0
            || exchange.byte_wait_budget == 0
            || exchange.payload_budget == 0
        {
            return Err(Error::InvalidParameter(
                "retry and read budgets must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Build a [`Session`] with a caller-provided transport.
    ///
    /// This is the entry point for testing (pass a `MockTransport` from
    /// `heatlink-test-harness`). Must be called within a tokio runtime;
    /// the IO task is spawned here.
    pub async fn build_with_transport(self, transport: Box<dyn Transport>) -> Result<Session> {
        self.validate()?;
        let buffer =
            IngestBuffer::with_polling(self.buffer_capacity, self.poll_interval, self.poll_attempts);
        Ok(Session::new(transport, buffer, self.config, self.schema))
    }

    /// Build a [`Session`] on a serial port.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been called.
    pub async fn build(self) -> Result<Session> {
        let port = self
            .serial_port
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("serial_port is required for build()".into()))?;
        self.validate()?;

        let transport = SerialTransport::open_with_config(port, self.serial.clone()).await?;
        self.build_with_transport(Box::new(transport)).await
    }
}
