//! Handshake and request/response state machine.
//!
//! One exchange walks these states:
//!
//! ```text
//! SendRequest -> AwaitDataAvailable -> Acknowledge -> ReceivePayload -> Validate -> done
//!      ^                |  nothing arrived                                  |
//!      +----------------+                                                   | bad frame
//!      ^                |  garbled reply                                    v
//!      +-- Reconnect <--+                        SendRequest <-- Rehandshake
//! ```
//!
//! Every `SendRequest` spends one unit of the shared `request_retries`
//! budget; running out yields [`Error::NoDataAvailable`]. Byte timeouts only
//! spend the budget of the wait they occur in and are never returned.

use tracing::{debug, trace, warn};

use heatlink_core::error::{Error, Result};

use crate::buffer::IngestBuffer;
use crate::frame::{
    build_get_request, fix_duplicated_bytes, is_terminated, validate_frame, DATA_AVAILABLE,
    ESCAPE, STARTCOMMUNICATION,
};
use crate::io::DeviceIo;

/// Default number of `STARTCOMMUNICATION` attempts per handshake.
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 3;

/// Default number of times one request is (re)sent.
pub const DEFAULT_REQUEST_RETRIES: u32 = 10;

/// Default number of reads spent waiting for the data-available marker.
pub const DEFAULT_BYTE_WAIT_BUDGET: u32 = 100;

/// Default number of reads spent receiving one response frame.
pub const DEFAULT_PAYLOAD_BUDGET: u32 = 1000;

/// Retry budgets of the exchange state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
    pub handshake_attempts: u32,
    pub request_retries: u32,
    pub byte_wait_budget: u32,
    pub payload_budget: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            request_retries: DEFAULT_REQUEST_RETRIES,
            byte_wait_budget: DEFAULT_BYTE_WAIT_BUDGET,
            payload_budget: DEFAULT_PAYLOAD_BUDGET,
        }
    }
}

#[derive(Debug)]
enum State {
    SendRequest,
    AwaitDataAvailable,
    Acknowledge,
    ReceivePayload,
    Validate(Vec<u8>),
    Rehandshake,
    Reconnect,
}

/// Outcome of waiting for the data-available marker.
#[derive(Debug, PartialEq, Eq)]
enum DataWait {
    Available,
    /// Nothing at all arrived.
    Silent,
    /// Bytes arrived but did not start with the marker.
    Garbled,
}

/// Send `STARTCOMMUNICATION` until the device answers with `ESCAPE`.
pub(crate) async fn establish_handshake(
    io: &DeviceIo,
    buffer: &IngestBuffer,
    attempts: u32,
) -> Result<()> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        buffer.clear().await;
        io.write(vec![STARTCOMMUNICATION]).await?;
        match buffer.get().await {
            Ok(ESCAPE) => {
                debug!(attempt, "handshake acknowledged");
                return Ok(());
            }
            Ok(other) => {
                warn!(attempt, reply = other, "device answered handshake without ESCAPE");
            }
            Err(Error::Timeout) => {
                debug!(attempt, "no handshake reply");
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::HandshakeFailed { attempts })
}

/// Run one request through the state machine and return the validated,
/// de-stuffed response frame.
pub(crate) async fn read_frame(
    io: &DeviceIo,
    buffer: &IngestBuffer,
    config: &ExchangeConfig,
    name: &str,
    request_byte: u8,
) -> Result<Vec<u8>> {
    let message = build_get_request(request_byte);
    let mut sent = 0u32;
    let mut state = State::SendRequest;

    loop {
        trace!(request = %name, state = ?state, "exchange step");
        state = match state {
            State::SendRequest => {
                if sent >= config.request_retries {
                    warn!(request = %name, attempts = sent, "device has no data available");
                    return Err(Error::NoDataAvailable {
                        request: name.to_string(),
                        attempts: sent,
                    });
                }
                sent += 1;
                io.write(message.clone()).await?;
                State::AwaitDataAvailable
            }
            State::AwaitDataAvailable => {
                match await_data_available(buffer, config.byte_wait_budget).await? {
                    DataWait::Available => State::Acknowledge,
                    DataWait::Silent => {
                        debug!(request = %name, attempt = sent, "no reply, resending request");
                        State::SendRequest
                    }
                    DataWait::Garbled => State::Reconnect,
                }
            }
            State::Acknowledge => {
                io.write(vec![ESCAPE]).await?;
                State::ReceivePayload
            }
            State::ReceivePayload => match receive_payload(buffer, config.payload_budget).await? {
                Some(raw) => State::Validate(raw),
                None => {
                    warn!(request = %name, "response frame never terminated");
                    State::Rehandshake
                }
            },
            State::Validate(raw) => {
                let frame = fix_duplicated_bytes(&raw);
                match validate_frame(&frame) {
                    Ok(()) => {
                        debug!(request = %name, len = frame.len(), "received valid frame");
                        return Ok(frame);
                    }
                    Err(e) => {
                        warn!(request = %name, error = %e, frame = ?frame, "discarding invalid frame");
                        State::Rehandshake
                    }
                }
            }
            State::Rehandshake => {
                match establish_handshake(io, buffer, config.handshake_attempts).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(request = %name, error = %e, "re-handshake failed"),
                }
                State::SendRequest
            }
            State::Reconnect => {
                warn!(request = %name, "garbled reply to request, reconnecting");
                io.reconnect().await?;
                buffer.clear().await;
                State::SendRequest
            }
        };
    }
}

/// Read until the first two bytes received are the data-available marker,
/// or `budget` reads (bytes and timeouts alike) have been spent.
async fn await_data_available(buffer: &IngestBuffer, budget: u32) -> Result<DataWait> {
    let mut head: Vec<u8> = Vec::with_capacity(2);
    let mut received = 0usize;

    for _ in 0..budget {
        match buffer.get().await {
            Ok(byte) => {
                received += 1;
                if head.len() < 2 {
                    head.push(byte);
                }
                if head.len() == 2 && head == DATA_AVAILABLE {
                    return Ok(DataWait::Available);
                }
            }
            Err(Error::Timeout) => {}
            Err(e) => return Err(e),
        }
    }

    if head.len() == 2 {
        debug!(head = ?head, received, "reply did not start with data-available marker");
        Ok(DataWait::Garbled)
    } else {
        Ok(DataWait::Silent)
    }
}

/// Collect raw frame bytes until a real `ESCAPE END` footer. `None` when
/// the budget runs out first.
async fn receive_payload(buffer: &IngestBuffer, budget: u32) -> Result<Option<Vec<u8>>> {
    let mut raw = Vec::new();
    for _ in 0..budget {
        match buffer.get().await {
            Ok(byte) => {
                raw.push(byte);
                if is_terminated(&raw) {
                    trace!(len = raw.len(), "reached end of response frame");
                    return Ok(Some(raw));
                }
            }
            Err(Error::Timeout) => {}
            Err(e) => return Err(e),
        }
    }
    debug!(len = raw.len(), "payload budget exhausted");
    Ok(None)
}
