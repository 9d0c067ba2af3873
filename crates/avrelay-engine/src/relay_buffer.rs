//! Bounded byte ring between the capture thread and the processing thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::BufferError;
use crate::BufferResult;

#[derive(Debug, Default)]
struct Ring {
    data: VecDeque<u8>,
    closed: bool,
    written: u64,
    consumed: u64,
}

impl Ring {
    fn take(&mut self, size: usize) -> Bytes {
        self.consumed += size as u64;
        let out: Vec<u8> = self.data.drain(..size).collect();
        Bytes::from(out)
    }
}

/// Fixed-capacity FIFO of raw bytes shared by one producer and one consumer.
///
/// A producer that would overflow the ring waits for the consumer instead of
/// dropping data. The lock is held only while bytes are copied; waiting
/// releases it.
#[derive(Debug)]
pub struct RelayBuffer {
    ring: Mutex<Ring>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
    stalls: AtomicU64,
}

impl RelayBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                data: VecDeque::with_capacity(capacity),
                ..Ring::default()
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
            stalls: AtomicU64::new(0),
        }
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.ring.lock().data.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes accepted by [`write`](Self::write).
    pub fn bytes_written(&self) -> u64 {
        self.ring.lock().written
    }

    /// Total bytes handed out to the consumer.
    pub fn bytes_consumed(&self) -> u64 {
        self.ring.lock().consumed
    }

    /// Writes that had to wait for space.
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }

    /// Append `bytes`, waiting for space as needed.
    ///
    /// Input larger than the free space is copied in pieces as the consumer
    /// makes room. Returns true if the write stalled at least once.
    pub fn write(&self, bytes: &[u8]) -> BufferResult<bool> {
        let mut stalled = false;
        let mut remaining = bytes;
        let mut ring = self.ring.lock();

        while !remaining.is_empty() {
            if ring.closed {
                return Err(BufferError::Closed);
            }

            let free = self.capacity - ring.data.len();
            if free == 0 {
                if !stalled {
                    stalled = true;
                    self.stalls.fetch_add(1, Ordering::Relaxed);
                    trace!(pending = remaining.len(), "Relay buffer full, producer waiting");
                }
                self.writable.wait(&mut ring);
                continue;
            }

            let n = free.min(remaining.len());
            ring.data.extend(&remaining[..n]);
            ring.written += n as u64;
            remaining = &remaining[n..];
            self.readable.notify_one();
        }

        Ok(stalled)
    }

    fn check_request(&self, size: usize) -> BufferResult<()> {
        if size > self.capacity {
            return Err(BufferError::TooLarge {
                requested: size,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Take exactly `size` bytes if that many are buffered.
    ///
    /// Returns `Ok(None)` when fewer are available, or `Closed` once the
    /// buffer is closed and can no longer fill the request.
    pub fn try_consume(&self, size: usize) -> BufferResult<Option<Bytes>> {
        self.check_request(size)?;
        let mut ring = self.ring.lock();

        if ring.data.len() >= size {
            let out = ring.take(size);
            self.writable.notify_one();
            return Ok(Some(out));
        }
        if ring.closed {
            return Err(BufferError::Closed);
        }
        Ok(None)
    }

    /// Like [`try_consume`](Self::try_consume), but waits up to `timeout` for
    /// the producer to supply enough bytes.
    pub fn consume_timeout(&self, size: usize, timeout: Duration) -> BufferResult<Option<Bytes>> {
        self.check_request(size)?;
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();

        loop {
            if ring.data.len() >= size {
                let out = ring.take(size);
                self.writable.notify_one();
                return Ok(Some(out));
            }
            if ring.closed {
                return Err(BufferError::Closed);
            }
            if self.readable.wait_until(&mut ring, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    /// Stop accepting writes and wake every waiter. Buffered bytes stay
    /// available to the consumer.
    pub fn close(&self) {
        self.ring.lock().closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Discard buffered bytes.
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        let dropped = ring.data.len();
        ring.data.clear();
        ring.consumed += dropped as u64;
        drop(ring);
        self.writable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_partial_writes_consumed_in_exact_units() {
        // Capacity 5F, writes of 0.5F, 0.7F and 1.0F.
        const F: usize = 1000;
        let buffer = RelayBuffer::new(5 * F);
        let mut successes = Vec::new();

        for (step, size) in [F / 2, F * 7 / 10, F].into_iter().enumerate() {
            buffer.write(&vec![step as u8; size]).unwrap();
            if let Some(unit) = buffer.try_consume(F).unwrap() {
                assert_eq!(unit.len(), F);
                successes.push((step, buffer.len()));
            }
        }

        assert_eq!(successes.len(), 2);
        assert_eq!(successes[0], (1, F / 5));
        assert_eq!(successes[1], (2, F / 5));
        assert_eq!(buffer.try_consume(F).unwrap(), None);
    }

    #[test]
    fn test_fifo_order() {
        let buffer = RelayBuffer::new(8);
        buffer.write(&[1, 2, 3]).unwrap();
        buffer.write(&[4, 5]).unwrap();
        assert_eq!(buffer.try_consume(4).unwrap().unwrap().as_ref(), &[1, 2, 3, 4]);
        buffer.write(&[6, 7, 8]).unwrap();
        assert_eq!(buffer.try_consume(4).unwrap().unwrap().as_ref(), &[5, 6, 7, 8]);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let buffer = RelayBuffer::new(4);
        assert_eq!(
            buffer.try_consume(5),
            Err(BufferError::TooLarge {
                requested: 5,
                capacity: 4
            })
        );
    }

    #[test]
    fn test_close_wakes_consumer_and_keeps_data() {
        let buffer = Arc::new(RelayBuffer::new(16));
        buffer.write(&[9; 6]).unwrap();

        let waiter = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.consume_timeout(8, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        buffer.close();

        assert_eq!(waiter.join().unwrap(), Err(BufferError::Closed));
        assert_eq!(buffer.write(&[1]), Err(BufferError::Closed));
        assert_eq!(buffer.try_consume(4).unwrap().unwrap().as_ref(), &[9; 4]);
        assert_eq!(buffer.try_consume(4), Err(BufferError::Closed));
    }

    #[test]
    fn test_consume_timeout_expires() {
        let buffer = RelayBuffer::new(16);
        let start = Instant::now();
        assert_eq!(buffer.consume_timeout(4, Duration::from_millis(20)), Ok(None));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_full_buffer_blocks_producer_and_counts_stall() {
        let buffer = Arc::new(RelayBuffer::new(4));
        buffer.write(&[0; 4]).unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.write(&[1, 2]))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(buffer.len(), 4);

        buffer.try_consume(2).unwrap().unwrap();
        assert_eq!(producer.join().unwrap(), Ok(true));
        assert_eq!(buffer.stalls(), 1);
        assert_eq!(buffer.try_consume(4).unwrap().unwrap().as_ref(), &[0, 0, 1, 2]);
    }

    #[test]
    fn test_conservation_under_concurrency() {
        const TOTAL: usize = 64 * 1024;
        const UNIT: usize = 256;
        let buffer = Arc::new(RelayBuffer::new(4 * UNIT));

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let data: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
                // Odd chunk sizes so writes never line up with units.
                for chunk in data.chunks(333) {
                    buffer.write(chunk).unwrap();
                }
                buffer.close();
            })
        };

        let mut received = Vec::with_capacity(TOTAL);
        loop {
            assert!(buffer.bytes_consumed() <= buffer.bytes_written());
            match buffer.consume_timeout(UNIT, Duration::from_millis(50)) {
                Ok(Some(unit)) => received.extend_from_slice(&unit),
                Ok(None) => {}
                Err(BufferError::Closed) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        producer.join().unwrap();

        assert_eq!(received.len(), TOTAL);
        assert!(received.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
        assert_eq!(buffer.bytes_consumed(), TOTAL as u64);
    }

    #[test]
    fn test_clear_discards_and_unblocks() {
        let buffer = RelayBuffer::new(4);
        buffer.write(&[1, 2, 3]).unwrap();
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.write(&[4, 5, 6, 7]).unwrap());
    }
}
