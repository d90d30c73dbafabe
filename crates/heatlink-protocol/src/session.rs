//! Session: one connected heat pump.
//!
//! A [`Session`] owns the IO task, the ingest buffer it feeds and the schema
//! describing the device's firmware. All reads go through
//! [`Session::exchange`], which paces requests, performs the handshake, runs
//! the exchange state machine and decodes the validated frame.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use heatlink_core::error::{Error, Result};
use heatlink_core::schema::{Schema, SchemaProvider};
use heatlink_core::transport::Transport;
use heatlink_core::types::{DataType, Readings, Request};

use crate::buffer::IngestBuffer;
use crate::decoder;
use crate::exchange::{self, ExchangeConfig};
use crate::frame::VERSION_REQUEST;
use crate::io::{spawn_io_task, DeviceIo};

/// Default pause between two requests to the device.
pub const DEFAULT_INTER_REQUEST_DELAY: Duration = Duration::from_millis(1500);

/// Default timeout of a single transport read in the IO task.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Runtime settings of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub exchange: ExchangeConfig,
    /// Minimum time between the end of one exchange and the next request.
    pub inter_request_delay: Duration,
    /// Timeout of each transport read.
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            exchange: ExchangeConfig::default(),
            inter_request_delay: DEFAULT_INTER_REQUEST_DELAY,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// A connected heat pump.
///
/// Constructed via [`SessionBuilder`](crate::builder::SessionBuilder).
pub struct Session {
    /// `None` after [`shutdown`](Self::shutdown).
    io: Option<DeviceIo>,
    buffer: Arc<IngestBuffer>,
    config: SessionConfig,
    schema: Option<Schema>,
    last_exchange: Option<Instant>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(io) = &self.io {
            io.cancel.cancel();
            // A transport read that ignores cancellation must not keep the
            // task alive.
            io.task.abort();
        }
    }
}

impl Session {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        buffer: IngestBuffer,
        config: SessionConfig,
        schema: Option<Schema>,
    ) -> Self {
        let buffer = Arc::new(buffer);
        let io = spawn_io_task(transport, Arc::clone(&buffer), config.read_timeout);
        Session {
            io: Some(io),
            buffer,
            config,
            schema,
            last_exchange: None,
        }
    }

    fn io(&self) -> Result<&DeviceIo> {
        self.io.as_ref().ok_or(Error::NotConnected)
    }

    /// The active settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The loaded schema, if any.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// Replace the schema.
    pub fn set_schema(&mut self, schema: Schema) {
        info!(schema = %schema.id(), "using heat pump schema");
        self.schema = Some(schema);
    }

    /// Load and validate the schema `id` from `provider`.
    pub fn load_schema(&mut self, provider: &dyn SchemaProvider, id: &str) -> Result<()> {
        let requests = provider.get_requests(id)?;
        self.set_schema(Schema::new(id, requests)?);
        Ok(())
    }

    /// Ask the device for its firmware version and load the matching schema.
    /// Returns the detected version.
    pub async fn load_schema_for_device(&mut self, provider: &dyn SchemaProvider) -> Result<String> {
        let version = self.detect_version().await?;
        self.load_schema(provider, &version)?;
        Ok(version)
    }

    /// Send `STARTCOMMUNICATION` until the device answers with `ESCAPE`.
    pub async fn establish_handshake(&self) -> Result<()> {
        exchange::establish_handshake(
            self.io()?,
            &self.buffer,
            self.config.exchange.handshake_attempts,
        )
        .await
    }

    /// Wait out the inter-request delay since the last exchange.
    async fn pace(&self) {
        if let Some(last) = self.last_exchange {
            let next = last + self.config.inter_request_delay;
            let wait = next.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, "pacing before next request");
                tokio::time::sleep_until(next).await;
            }
        }
    }

    /// Handshake, send `request_byte` and return the validated frame.
    async fn fetch_frame(&mut self, name: &str, request_byte: u8) -> Result<Vec<u8>> {
        self.pace().await;
        debug!(
            request = %name,
            request_byte = %format!("0x{request_byte:02X}"),
            "starting exchange"
        );

        let result = async {
            self.establish_handshake().await?;
            exchange::read_frame(
                self.io()?,
                &self.buffer,
                &self.config.exchange,
                name,
                request_byte,
            )
            .await
        }
        .await;

        self.last_exchange = Some(Instant::now());
        result
    }

    /// Run one request and decode its records.
    ///
    /// A device that never produces a valid frame within the retry budget
    /// yields an empty result and a warning log.
    pub async fn exchange(&mut self, request: &Request) -> Result<Readings> {
        let frame = match self.fetch_frame(&request.name, request.request_byte).await {
            Ok(frame) => frame,
            Err(Error::NoDataAvailable { request, attempts }) => {
                warn!(%request, attempts, "heat pump has no data available for request");
                return Ok(Readings::new());
            }
            Err(e) => return Err(e),
        };
        let readings = decoder::decode(&frame, &request.record_definitions);
        debug!(
            request = %request.name,
            values = readings.len(),
            warnings = readings.warnings.len(),
            "decoded response"
        );
        Ok(readings)
    }

    /// Run the schema request called `name`.
    pub async fn read_request(&mut self, name: &str) -> Result<Readings> {
        let request = self
            .schema
            .as_ref()
            .ok_or_else(|| Error::Schema("no schema loaded".into()))?
            .request(name)
            .cloned()
            .ok_or_else(|| Error::InvalidParameter(format!("unknown request {name}")))?;
        self.exchange(&request).await
    }

    /// Firmware version from the schema's `Version` request, or from the
    /// built-in version request when no schema defines one.
    pub async fn get_version(&mut self) -> Result<String> {
        let request = self
            .schema
            .as_ref()
            .and_then(|s| s.version_request())
            .cloned();
        match request {
            Some(request) => {
                let frame = self.fetch_frame(&request.name, request.request_byte).await?;
                decoder::parse_version(&frame, Some(&request))
            }
            None => self.detect_version().await,
        }
    }

    /// Firmware version via the built-in version request; needs no schema.
    pub async fn detect_version(&mut self) -> Result<String> {
        let frame = self.fetch_frame("Version", VERSION_REQUEST).await?;
        let version = decoder::parse_version(&frame, None)?;
        info!(version = %version, "heat pump firmware version");
        Ok(version)
    }

    /// Run every schema request carrying `data_type` records and collect the
    /// values of that type.
    ///
    /// Requests the device never answers contribute nothing.
    pub async fn read_group(&mut self, data_type: DataType) -> Result<Readings> {
        let requests: Vec<Request> = self
            .schema
            .as_ref()
            .ok_or_else(|| Error::Schema("no schema loaded".into()))?
            .requests_with(data_type)
            .into_iter()
            .cloned()
            .collect();

        let mut all = Readings::new();
        for request in &requests {
            debug!(request = %request.name, group = %data_type, "loading data for request");
            let mut readings = self.exchange(request).await?;
            readings.values.retain(|_, r| r.data_type == data_type);
            all.extend(readings);
        }
        Ok(all)
    }

    pub async fn read_sensors(&mut self) -> Result<Readings> {
        self.read_group(DataType::Sensor).await
    }

    pub async fn read_status(&mut self) -> Result<Readings> {
        self.read_group(DataType::Status).await
    }

    pub async fn read_settings(&mut self) -> Result<Readings> {
        self.read_group(DataType::Settings).await
    }

    /// Build the SET message writing `value` to the setting `name`. See
    /// [`decoder::build_setting_message`] for the layout.
    ///
    /// The message is only constructed, not sent.
    pub fn build_setting_message(&self, name: &str, value: f64) -> Result<Vec<u8>> {
        let schema = self
            .schema
            .as_ref()
            .ok_or_else(|| Error::Schema("no schema loaded".into()))?;
        let (request, record) = schema
            .find_record(name)
            .ok_or_else(|| Error::InvalidParameter(format!("unknown setting {name}")))?;
        decoder::build_setting_message(request, record, value)
    }

    /// Stop the IO task and close the transport. Later calls fail with
    /// [`Error::NotConnected`].
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(io) = self.io.take() {
            let mut transport = io.shutdown().await?;
            transport.close().await?;
            info!("session closed");
        }
        Ok(())
    }
}
