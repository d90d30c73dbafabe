//! Bounded ring buffer between the IO task and the exchange state machine.
//!
//! The IO task is the only producer and pushes every received byte with
//! [`IngestBuffer::put`]. The session is the only consumer; its reads wait
//! for at most `poll_interval * poll_attempts` before giving up with
//! [`Error::Timeout`]. The ring lock is taken per operation and never held
//! while waiting.

use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use heatlink_core::error::{Error, Result};

/// Default ring capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 16383;

/// Default granularity of a consumer wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default number of poll intervals a single `get` may wait.
pub const DEFAULT_POLL_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy)]
struct Mark {
    pos: usize,
    /// Bytes consumed since the mark was taken.
    consumed: usize,
}

#[derive(Debug)]
struct Ring {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    count: usize,
    mark: Option<Mark>,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Ring {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            count: 0,
            mark: None,
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn push(&mut self, byte: u8) -> bool {
        let capacity = self.capacity();
        if self.count == capacity {
            return false;
        }
        // Writing over already consumed bytes behind the mark makes it
        // impossible to rewind to it.
        if let Some(mark) = self.mark {
            if self.count + mark.consumed >= capacity {
                trace!("ingest buffer mark overwritten");
                self.mark = None;
            }
        }
        self.data[self.write_pos] = byte;
        self.write_pos = (self.write_pos + 1) % capacity;
        self.count += 1;
        true
    }

    fn pop(&mut self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let byte = self.data[self.read_pos];
        self.read_pos = (self.read_pos + 1) % self.capacity();
        self.count -= 1;
        if let Some(mark) = self.mark.as_mut() {
            mark.consumed += 1;
        }
        Some(byte)
    }
}

/// Single-producer, single-consumer byte ring with bounded-wait reads.
#[derive(Debug)]
pub struct IngestBuffer {
    ring: Mutex<Ring>,
    capacity: usize,
    available: Notify,
    stop: CancellationToken,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl IngestBuffer {
    /// Create a buffer holding up to `capacity` unread bytes, with the
    /// default 10 ms x 5 read wait.
    pub fn new(capacity: usize) -> Self {
        Self::with_polling(capacity, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_ATTEMPTS)
    }

    /// Create a buffer whose reads wait `poll_interval * poll_attempts`.
    pub fn with_polling(capacity: usize, poll_interval: Duration, poll_attempts: u32) -> Self {
        let capacity = capacity.max(1);
        IngestBuffer {
            ring: Mutex::new(Ring::new(capacity)),
            capacity,
            available: Notify::new(),
            stop: CancellationToken::new(),
            poll_interval,
            poll_attempts: poll_attempts.max(1),
        }
    }

    /// Longest time a single [`get`](Self::get) waits for a byte.
    pub fn max_wait(&self) -> Duration {
        self.poll_interval * self.poll_attempts
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of unread bytes.
    pub async fn len(&self) -> usize {
        self.ring.lock().await.count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Append one received byte. Fails with [`Error::BufferFull`] when the
    /// consumer has fallen a whole ring behind.
    pub async fn put(&self, byte: u8) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }
        let accepted = self.ring.lock().await.push(byte);
        if !accepted {
            return Err(Error::BufferFull {
                capacity: self.capacity,
            });
        }
        self.available.notify_one();
        Ok(())
    }

    /// Take the next byte, waiting up to [`max_wait`](Self::max_wait).
    pub async fn get(&self) -> Result<u8> {
        let deadline = Instant::now() + self.max_wait();
        loop {
            if self.stop.is_cancelled() {
                return Err(Error::Stopped);
            }
            if let Some(byte) = self.ring.lock().await.pop() {
                return Ok(byte);
            }

            tokio::select! {
                biased;

                _ = self.stop.cancelled() => return Err(Error::Stopped),
                _ = self.available.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => {
                    // A byte may have landed between the check and the wait.
                    return self.ring.lock().await.pop().ok_or(Error::Timeout);
                }
            }
        }
    }

    /// Take `n` bytes. A timeout on any of them fails the whole call.
    pub async fn get_n(&self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.get().await?);
        }
        Ok(out)
    }

    /// Take two bytes as a big-endian `u16`.
    pub async fn get_short(&self) -> Result<u16> {
        let hi = self.get().await?;
        let lo = self.get().await?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// Remember the current read position.
    pub async fn mark(&self) {
        let mut ring = self.ring.lock().await;
        let pos = ring.read_pos;
        ring.mark = Some(Mark { pos, consumed: 0 });
    }

    /// Rewind to the last [`mark`](Self::mark), making the bytes read since
    /// then readable again.
    pub async fn reset(&self) -> Result<()> {
        let mut ring = self.ring.lock().await;
        let mark = ring
            .mark
            .ok_or_else(|| Error::InvalidParameter("ingest buffer has no valid mark".into()))?;
        ring.read_pos = mark.pos;
        ring.count += mark.consumed;
        ring.mark = Some(Mark {
            pos: mark.pos,
            consumed: 0,
        });
        Ok(())
    }

    /// Drop all unread bytes and the mark.
    pub async fn clear(&self) {
        let mut ring = self.ring.lock().await;
        if ring.count > 0 {
            trace!(dropped = ring.count, "clearing ingest buffer");
        }
        ring.read_pos = ring.write_pos;
        ring.count = 0;
        ring.mark = None;
    }

    /// Wake any waiting reader and fail all further reads with
    /// [`Error::Stopped`].
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Default for IngestBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn bytes_come_out_in_order() {
        let buf = IngestBuffer::new(16);
        for b in [0x10, 0x02, 0x01] {
            buf.put(b).await.unwrap();
        }
        assert_eq!(buf.len().await, 3);
        assert_eq!(buf.get_n(3).await.unwrap(), vec![0x10, 0x02, 0x01]);
        assert!(buf.is_empty().await);
    }

    #[tokio::test]
    async fn wraps_around() {
        let buf = IngestBuffer::new(4);
        for round in 0..5u8 {
            buf.put(round).await.unwrap();
            buf.put(round + 100).await.unwrap();
            buf.put(round + 200).await.unwrap();
            assert_eq!(buf.get().await.unwrap(), round);
            assert_eq!(buf.get().await.unwrap(), round + 100);
            assert_eq!(buf.get().await.unwrap(), round + 200);
        }
    }

    #[tokio::test]
    async fn full_ring_rejects_put() {
        let buf = IngestBuffer::new(2);
        buf.put(1).await.unwrap();
        buf.put(2).await.unwrap();
        assert!(matches!(
            buf.put(3).await,
            Err(Error::BufferFull { capacity: 2 })
        ));
        assert_eq!(buf.get().await.unwrap(), 1);
        buf.put(3).await.unwrap();
        assert_eq!(buf.get_n(2).await.unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn get_short_is_big_endian() {
        let buf = IngestBuffer::new(8);
        buf.put(0x00).await.unwrap();
        buf.put(0xCE).await.unwrap();
        assert_eq!(buf.get_short().await.unwrap(), 206);
    }

    #[tokio::test]
    async fn empty_buffer_times_out() {
        let buf = IngestBuffer::with_polling(8, Duration::from_millis(5), 4);
        let started = std::time::Instant::now();
        assert!(matches!(buf.get().await, Err(Error::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn get_n_fails_when_short() {
        let buf = IngestBuffer::with_polling(8, Duration::from_millis(1), 2);
        buf.put(0x10).await.unwrap();
        assert!(matches!(buf.get_n(2).await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn concurrent_put_wakes_waiter() {
        let buf = Arc::new(IngestBuffer::with_polling(8, Duration::from_millis(100), 10));
        let producer = Arc::clone(&buf);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.put(0x42).await.unwrap();
        });

        let started = std::time::Instant::now();
        assert_eq!(buf.get().await.unwrap(), 0x42);
        assert!(started.elapsed() < buf.max_wait());
    }

    #[tokio::test]
    async fn stop_unblocks_waiter() {
        let buf = Arc::new(IngestBuffer::with_polling(8, Duration::from_secs(1), 10));
        let waiter = Arc::clone(&buf);
        let handle = tokio::spawn(async move { waiter.get().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Stopped)));
        assert!(buf.is_stopped());
        assert!(matches!(buf.get().await, Err(Error::Stopped)));
        assert!(matches!(buf.put(1).await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn mark_and_reset_rewind() {
        let buf = IngestBuffer::new(8);
        for b in 1..=4 {
            buf.put(b).await.unwrap();
        }
        assert_eq!(buf.get().await.unwrap(), 1);
        buf.mark().await;
        assert_eq!(buf.get_n(2).await.unwrap(), vec![2, 3]);
        buf.reset().await.unwrap();
        assert_eq!(buf.len().await, 3);
        assert_eq!(buf.get_n(3).await.unwrap(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn reset_across_wrap() {
        let buf = IngestBuffer::new(4);
        for b in [1, 2, 3] {
            buf.put(b).await.unwrap();
        }
        buf.get_n(2).await.unwrap();
        buf.mark().await;
        buf.put(4).await.unwrap();
        buf.put(5).await.unwrap();
        assert_eq!(buf.get_n(3).await.unwrap(), vec![3, 4, 5]);
        buf.reset().await.unwrap();
        assert_eq!(buf.get_n(3).await.unwrap(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn reset_without_mark_fails() {
        let buf = IngestBuffer::new(4);
        assert!(matches!(buf.reset().await, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn overwritten_mark_is_dropped() {
        let buf = IngestBuffer::new(2);
        buf.put(1).await.unwrap();
        buf.mark().await;
        buf.get().await.unwrap();
        buf.put(2).await.unwrap();
        // Slot of byte 1 is reused here.
        buf.put(3).await.unwrap();
        assert!(buf.reset().await.is_err());
        assert_eq!(buf.get_n(2).await.unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn clear_drops_unread_bytes() {
        let buf = IngestBuffer::new(8);
        buf.put(0x55).await.unwrap();
        buf.put(0xAA).await.unwrap();
        buf.clear().await;
        assert!(buf.is_empty().await);
        buf.put(0x10).await.unwrap();
        assert_eq!(buf.get().await.unwrap(), 0x10);
    }
}
