//! Scripted heat pump link for deterministic protocol tests.
//!
//! [`MockTransport`] implements the [`Transport`] trait by replaying a script
//! of write/reply steps. Each `send()` must match the next scripted write
//! exactly; the scripted reply then becomes readable through `receive()`.
//! This covers the whole half-duplex conversation (STARTCOMMUNICATION, the
//! data-available marker, the acknowledge byte and the response frame)
//! without a serial adapter.
//!
//! # Example
//!
//! ```
//! use heatlink_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // Handshake: host sends STARTCOMMUNICATION, device answers ESCAPE.
//! mock.expect(&[0x02], &[0x10]);
//! // Request 0xFB; device signals that data is available.
//! mock.expect(&[0x01, 0x00, 0xFC, 0xFB, 0x10, 0x03], &[0x10, 0x02]);
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use heatlink_core::error::{Error, Result};
use heatlink_core::transport::Transport;

/// One scripted step: the bytes the host must write and what the device
/// answers with.
#[derive(Debug, Clone)]
struct Step {
    request: Vec<u8>,
    response: Vec<u8>,
}

/// A scripted [`Transport`] standing in for the heat pump.
///
/// Steps are consumed in order. A write that does not match the next step,
/// or a write after the script is exhausted, fails with
/// [`Error::Protocol`]. A step with an empty reply models a device that
/// stays silent: the following `receive()` calls time out.
#[derive(Debug)]
pub struct MockTransport {
    script: VecDeque<Step>,
    /// Reply bytes not yet handed out by `receive()`.
    pending: VecDeque<u8>,
    /// Largest chunk returned by a single `receive()`; `None` is unlimited.
    chunk_size: Option<usize>,
    connected: bool,
    reconnect_supported: bool,
    reconnects: Arc<AtomicU32>,
    sent_log: Vec<Vec<u8>>,
}

impl MockTransport {
    /// Create a connected mock with an empty script.
    pub fn new() -> Self {
        MockTransport {
            script: VecDeque::new(),
            pending: VecDeque::new(),
            chunk_size: None,
            connected: true,
            reconnect_supported: true,
            reconnects: Arc::new(AtomicU32::new(0)),
            sent_log: Vec::new(),
        }
    }

    /// Script one exchange: when the host writes `request`, the device
    /// answers with `response`.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.script.push_back(Step {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Script a write the device never answers.
    pub fn expect_silence(&mut self, request: &[u8]) {
        self.expect(request, &[]);
    }

    /// Hand out replies at most `size` bytes per `receive()` call, the way a
    /// slow serial line trickles them in.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Make `reconnect()` fail with [`Error::Unsupported`].
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect_supported = false;
        self
    }

    /// Counter of successful `reconnect()` calls. The returned handle stays
    /// valid after the mock has been moved into a session.
    pub fn reconnect_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.reconnects)
    }

    /// Everything written through this transport, one entry per `send()`.
    pub fn sent_data(&self) -> &[Vec<u8>] {
        &self.sent_log
    }

    /// Number of scripted steps not yet consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.script.len()
    }

    /// Force the connected state. While disconnected, `send()` and
    /// `receive()` fail with [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        self.sent_log.push(data.to_vec());

        let step = self.script.pop_front().ok_or_else(|| {
            Error::Protocol(format!("unscripted write {:02X?}", data))
        })?;
        if data != step.request.as_slice() {
            return Err(Error::Protocol(format!(
                "unexpected write: expected {:02X?}, got {:02X?}",
                step.request, data
            )));
        }
        tracing::trace!(request = ?data, response = ?step.response, "mock step");
        self.pending.extend(step.response);
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if self.pending.is_empty() {
            return Err(Error::Timeout);
        }

        let limit = self.chunk_size.unwrap_or(usize::MAX);
        let n = self.pending.len().min(buf.len()).min(limit);
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn reconnect(&mut self) -> Result<()> {
        if !self.reconnect_supported {
            return Err(Error::Unsupported("reconnect".into()));
        }
        self.pending.clear();
        self.connected = true;
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
