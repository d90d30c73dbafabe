//! IO task owning the transport.
//!
//! The session never touches the transport directly. A single spawned task
//! owns it, copies every received byte into the [`IngestBuffer`] in arrival
//! order and performs writes and reconnects requested over a channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use heatlink_core::error::{Error, Result};
use heatlink_core::transport::Transport;

use crate::buffer::IngestBuffer;

/// Upper bound on a single write round trip through the IO task.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed or empty read so the loop does not spin.
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// Size of one transport read.
const READ_CHUNK: usize = 256;

/// A request sent from the session to the IO task.
pub(crate) enum IoRequest {
    /// Write raw bytes to the device.
    Write {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Close and reopen the transport.
    Reconnect { reply: oneshot::Sender<Result<()>> },
    /// Stop the task and hand the transport back.
    Shutdown {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Handle to the IO task, stored inside the session.
pub(crate) struct DeviceIo {
    pub cmd_tx: mpsc::Sender<IoRequest>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl DeviceIo {
    /// Write `bytes` to the device.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(IoRequest::Write {
                bytes,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;

        match tokio::time::timeout(WRITE_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::Transport("write did not complete".into())),
        }
    }

    /// Reopen the transport.
    pub async fn reconnect(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(IoRequest::Reconnect { reply: reply_tx })
            .await
            .map_err(|_| Error::NotConnected)?;

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::NotConnected),
        }
    }

    /// Shut down the IO task and recover the transport.
    pub async fn shutdown(self) -> Result<Box<dyn Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(IoRequest::Shutdown { reply: reply_tx })
            .await;
        let transport = reply_rx.await.map_err(|_| Error::NotConnected)?;
        let _ = self.task.await;
        Ok(transport)
    }
}

/// Spawn the IO task feeding `buffer` from `transport`.
///
/// `read_timeout` bounds each transport read so the loop stays responsive
/// to requests and cancellation.
pub(crate) fn spawn_io_task(
    transport: Box<dyn Transport>,
    buffer: Arc<IngestBuffer>,
    read_timeout: Duration,
) -> DeviceIo {
    let (cmd_tx, cmd_rx) = mpsc::channel::<IoRequest>(16);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(io_loop(
        transport,
        buffer,
        read_timeout,
        cmd_rx,
        cancel.clone(),
    ));

    DeviceIo {
        cmd_tx,
        cancel,
        task,
    }
}

/// The IO loop. Priorities: cancellation, then session requests, then
/// reading from the device.
async fn io_loop(
    mut transport: Box<dyn Transport>,
    buffer: Arc<IngestBuffer>,
    read_timeout: Duration,
    mut cmd_rx: mpsc::Receiver<IoRequest>,
    cancel: CancellationToken,
) {
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("IO task cancelled");
                break;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(IoRequest::Write { bytes, reply }) => {
                        trace!(data = ?bytes, "writing to device");
                        let _ = reply.send(transport.send(&bytes).await);
                    }
                    Some(IoRequest::Reconnect { reply }) => {
                        let result = transport.reconnect().await;
                        if let Err(ref e) = result {
                            warn!(error = %e, "transport reconnect failed");
                        }
                        let _ = reply.send(result);
                    }
                    Some(IoRequest::Shutdown { reply }) => {
                        debug!("IO task shutdown requested");
                        buffer.stop();
                        let _ = reply.send(transport);
                        return;
                    }
                    None => {
                        debug!("session dropped, exiting IO task");
                        break;
                    }
                }
            }

            // Only the read itself is raced against requests; delivery to
            // the buffer below runs to completion so no byte is lost.
            read = async {
                let result = transport.receive(&mut chunk, read_timeout).await;
                if result.is_err() {
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
                result
            } => {
                match read {
                    Ok(n) => {
                        if deliver(&buffer, &chunk[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(Error::Timeout) => {}
                    Err(e) => trace!(error = %e, "device read failed"),
                }
            }
        }
    }

    buffer.stop();
}

/// Push received bytes into the buffer. Fails only once the buffer has been
/// stopped.
async fn deliver(buffer: &IngestBuffer, bytes: &[u8]) -> Result<()> {
    for &byte in bytes {
        match buffer.put(byte).await {
            Ok(()) => {}
            Err(Error::Stopped) => return Err(Error::Stopped),
            Err(e) => warn!(error = %e, byte, "dropping received byte"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use heatlink_test_harness::MockTransport;
    use std::sync::atomic::Ordering;

    fn test_buffer() -> Arc<IngestBuffer> {
        Arc::new(IngestBuffer::with_polling(64, Duration::from_millis(10), 20))
    }

    #[tokio::test]
    async fn write_not_connected_when_task_gone() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        drop(cmd_rx);
        let io = DeviceIo {
            cmd_tx,
            cancel: CancellationToken::new(),
            task: tokio::spawn(async {}),
        };

        assert!(matches!(io.write(vec![0x02]).await, Err(Error::NotConnected)));
        assert!(matches!(io.reconnect().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn write_reply_is_forwarded() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<IoRequest>(4);
        let io = DeviceIo {
            cmd_tx,
            cancel: CancellationToken::new(),
            task: tokio::spawn(async {}),
        };

        let handler = tokio::spawn(async move {
            if let Some(IoRequest::Write { bytes, reply }) = cmd_rx.recv().await {
                assert_eq!(bytes, vec![0x02]);
                let _ = reply.send(Err(Error::ConnectionLost));
            }
        });

        assert!(matches!(io.write(vec![0x02]).await, Err(Error::ConnectionLost)));
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn device_reply_lands_in_buffer() {
        let mut mock = MockTransport::new();
        mock.expect(&[0x02], &[0x10]);
        let buffer = test_buffer();
        let io = spawn_io_task(Box::new(mock), Arc::clone(&buffer), Duration::from_millis(20));

        io.write(vec![0x02]).await.unwrap();
        assert_eq!(buffer.get().await.unwrap(), 0x10);

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn bytes_keep_arrival_order_across_writes() {
        let mut mock = MockTransport::new().with_chunk_size(1);
        mock.expect(&[0x02], &[0x10]);
        mock.expect(&[0x10], &[0x01, 0x00, 0x06, 0x05, 0x10, 0x03]);
        let buffer = test_buffer();
        let io = spawn_io_task(Box::new(mock), Arc::clone(&buffer), Duration::from_millis(20));

        io.write(vec![0x02]).await.unwrap();
        io.write(vec![0x10]).await.unwrap();
        assert_eq!(
            buffer.get_n(7).await.unwrap(),
            vec![0x10, 0x01, 0x00, 0x06, 0x05, 0x10, 0x03]
        );

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn unexpected_write_is_reported() {
        let buffer = test_buffer();
        let io = spawn_io_task(
            Box::new(MockTransport::new()),
            Arc::clone(&buffer),
            Duration::from_millis(20),
        );

        assert!(matches!(io.write(vec![0x02]).await, Err(Error::Protocol(_))));
        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_reaches_transport() {
        let mock = MockTransport::new();
        let counter = mock.reconnect_counter();
        let io = spawn_io_task(Box::new(mock), test_buffer(), Duration::from_millis(20));

        io.reconnect().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_failure_is_returned() {
        let mock = MockTransport::new().without_reconnect();
        let io = spawn_io_task(Box::new(mock), test_buffer(), Duration::from_millis(20));

        assert!(matches!(io.reconnect().await, Err(Error::Unsupported(_))));
        let _ = io.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_recovers_transport_and_stops_buffer() {
        let buffer = test_buffer();
        let io = spawn_io_task(
            Box::new(MockTransport::new()),
            Arc::clone(&buffer),
            Duration::from_millis(20),
        );

        let transport = io.shutdown().await.unwrap();
        assert!(transport.is_connected());
        assert!(buffer.is_stopped());
        assert!(matches!(buffer.get().await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn cancel_ends_task_and_stops_buffer() {
        let buffer = test_buffer();
        let io = spawn_io_task(
            Box::new(MockTransport::new()),
            Arc::clone(&buffer),
            Duration::from_millis(20),
        );

        io.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), io.task)
            .await
            .unwrap()
            .unwrap();
        assert!(buffer.is_stopped());
    }
}
