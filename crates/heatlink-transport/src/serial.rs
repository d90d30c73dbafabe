//! Serial port transport for heat pump communication.
//!
//! [`SerialTransport`] implements the [`Transport`] trait for RS-232 and USB
//! serial adapters wired to the heat pump's service interface. The controller
//! talks 8N1 without flow control; 9600 baud is the factory default, some
//! firmware revisions run at 19200 or 57600.
//!
//! # Example
//!
//! ```no_run
//! use heatlink_transport::SerialTransport;
//! use heatlink_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> heatlink_core::Result<()> {
//! let mut transport = SerialTransport::open("/dev/ttyUSB0", 9600).await?;
//!
//! // STARTCOMMUNICATION
//! transport.send(&[0x02]).await?;
//!
//! let mut buf = [0u8; 64];
//! let n = transport.receive(&mut buf, Duration::from_millis(500)).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use heatlink_core::error::{Error, Result};
use heatlink_core::transport::Transport;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Pause between closing and reopening the port on reconnect. USB serial
/// adapters need a moment before the device node can be opened again.
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Serial port configuration.
///
/// Defaults match the heat pump service interface: 9600 baud, 8 data bits,
/// 1 stop bit, no parity, no flow control.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Baud rate (e.g., 9600, 19200, 57600)
    pub baud_rate: u32,
    /// Number of data bits (typically 8)
    pub data_bits: DataBits,
    /// Number of stop bits (typically 1)
    pub stop_bits: StopBits,
    /// Parity checking (typically None)
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Serial port transport to a heat pump controller.
pub struct SerialTransport {
    /// The underlying serial port stream; `None` once closed.
    port: Option<SerialStream>,
    /// Port name for logging and reopening.
    port_name: String,
    /// Settings reused when the port is reopened.
    config: SerialConfig,
}

impl SerialTransport {
    /// Open a serial port with the given baud rate and 8N1 settings.
    ///
    /// # Arguments
    ///
    /// * `port` - Serial port path (e.g., "/dev/ttyUSB0" on Linux, "COM3" on Windows)
    /// * `baud_rate` - Baud rate (e.g., 9600)
    pub async fn open(port: &str, baud_rate: u32) -> Result<Self> {
        let config = SerialConfig {
            baud_rate,
            ..Default::default()
        };
        Self::open_with_config(port, config).await
    }

    /// Open a serial port with full configuration control.
    pub async fn open_with_config(port: &str, config: SerialConfig) -> Result<Self> {
        let stream = open_stream(port, &config)?;
        Ok(Self {
            port: Some(stream),
            port_name: port.to_string(),
            config,
        })
    }

    /// Get the name of the serial port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Get the settings the port was opened with.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

fn open_stream(port: &str, config: &SerialConfig) -> Result<SerialStream> {
    tracing::debug!(
        port = %port,
        baud_rate = config.baud_rate,
        data_bits = ?config.data_bits,
        stop_bits = ?config.stop_bits,
        parity = ?config.parity,
        "Opening serial port"
    );

    let mut stream = tokio_serial::new(port, config.baud_rate)
        .data_bits(config.data_bits.into())
        .stop_bits(config.stop_bits.into())
        .parity(config.parity.into())
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| {
            tracing::error!(port = %port, error = %e, "Failed to open serial port");
            Error::Transport(format!("Failed to open serial port {}: {}", port, e))
        })?;

    // The device line uses no modem control; DTR and RTS stay deasserted.
    if let Err(e) = stream.write_data_terminal_ready(false) {
        tracing::warn!(port = %port, error = %e, "Failed to de-assert DTR");
    }
    if let Err(e) = stream.write_request_to_send(false) {
        tracing::warn!(port = %port, error = %e, "Failed to de-assert RTS");
    }

    tracing::info!(port = %port, baud_rate = config.baud_rate, "Serial port opened successfully");
    Ok(stream)
}

fn map_io_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::BrokenPipe || e.kind() == std::io::ErrorKind::NotConnected {
        Error::ConnectionLost
    } else {
        Error::Io(e)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(
            port = %self.port_name,
            bytes = data.len(),
            data = ?data,
            "Sending data"
        );

        port.write_all(data).await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to send data");
            map_io_error(e)
        })?;

        // The device is half-duplex; everything must be on the wire before
        // we start waiting for its answer.
        port.flush().await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to flush serial port");
            Error::Io(e)
        })?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(0)) => {
                tracing::warn!(port = %self.port_name, "Serial port reported end of stream");
                Err(Error::ConnectionLost)
            }
            Ok(Ok(n)) => {
                tracing::trace!(
                    port = %self.port_name,
                    bytes = n,
                    data = ?&buf[..n],
                    "Received data"
                );
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(port = %self.port_name, error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            tracing::debug!(port = %self.port_name, "Closing serial port");

            if let Err(e) = port.flush().await {
                tracing::warn!(
                    port = %self.port_name,
                    error = %e,
                    "Failed to flush before closing (continuing anyway)"
                );
            }

            tracing::info!(port = %self.port_name, "Serial port closed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn reconnect(&mut self) -> Result<()> {
        tracing::info!(port = %self.port_name, "Reconnecting serial port");
        self.close().await?;
        tokio::time::sleep(REOPEN_DELAY).await;
        self.port = Some(open_stream(&self.port_name, &self.config)?);
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            tracing::debug!(port = %self.port_name, "SerialTransport dropped, closing port");
        }
    }
}
