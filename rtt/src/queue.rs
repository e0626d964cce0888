use crate::Error;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A byte queue shared between the poll loop and the bridge thread.
///
/// Producers append in bulk, consumers either wait for data with a timeout or take everything
/// that is queued. With a capacity, a bulk append that does not fit is rejected as a whole.
#[derive(Debug, Default)]
pub struct RelayQueue {
    bytes: Mutex<VecDeque<u8>>,
    available: Condvar,
    capacity: Option<usize>,
}

impl RelayQueue {
    /// Creates an unbounded queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Default::default()
        }
    }

    /// Appends all of `data`, or nothing if it does not fit.
    pub fn push_bulk(&self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let mut bytes = self.bytes.lock();
        if let Some(capacity) = self.capacity {
            let free = capacity.saturating_sub(bytes.len());
            if data.len() > free {
                return Err(Error::QueueFull {
                    requested: data.len(),
                    free,
                });
            }
        }

        bytes.extend(data);
        drop(bytes);

        self.available.notify_one();
        Ok(())
    }

    /// Number of queued bytes. May be stale by the time it is used.
    pub fn len_approx(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Removes up to `max` bytes, waiting at most `timeout` for the queue to become non-empty.
    ///
    /// Returns an empty vector on timeout.
    pub fn pop_bulk_timeout(&self, max: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut bytes = self.bytes.lock();

        while bytes.is_empty() {
            if self
                .available
                .wait_until(&mut bytes, deadline)
                .timed_out()
            {
                break;
            }
        }

        let n = max.min(bytes.len());
        bytes.drain(..n).collect()
    }

    /// Removes and returns everything queued.
    pub fn take_all(&self) -> Vec<u8> {
        let mut bytes = self.bytes.lock();
        bytes.drain(..).collect()
    }

    /// Discards everything queued.
    pub fn clear(&self) {
        self.bytes.lock().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pop_in_chunks() {
        let queue = RelayQueue::new();
        queue.push_bulk(b"abcdef").unwrap();
        queue.push_bulk(b"gh").unwrap();
        assert_eq!(queue.len_approx(), 8);

        assert_eq!(queue.pop_bulk_timeout(5, Duration::ZERO), b"abcde");
        assert_eq!(queue.pop_bulk_timeout(5, Duration::ZERO), b"fgh");
        assert!(queue.pop_bulk_timeout(5, Duration::ZERO).is_empty());
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue = RelayQueue::new();
        let start = Instant::now();
        assert!(queue
            .pop_bulk_timeout(16, Duration::from_millis(20))
            .is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn pop_wakes_on_push() {
        let queue = Arc::new(RelayQueue::new());

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push_bulk(b"late").unwrap();
            })
        };

        let data = queue.pop_bulk_timeout(16, Duration::from_secs(5));
        producer.join().unwrap();
        assert_eq!(data, b"late");
    }

    #[test]
    fn capacity_rejects_whole_push() {
        let queue = RelayQueue::with_capacity(4);
        queue.push_bulk(b"abc").unwrap();

        assert!(matches!(
            queue.push_bulk(b"de"),
            Err(Error::QueueFull {
                requested: 2,
                free: 1
            })
        ));
        assert_eq!(queue.take_all(), b"abc");
    }

    #[test]
    fn take_all_and_clear() {
        let queue = RelayQueue::new();
        queue.push_bulk(b"xyz").unwrap();
        assert_eq!(queue.take_all(), b"xyz");
        assert!(queue.take_all().is_empty());

        queue.push_bulk(b"stale").unwrap();
        queue.clear();
        assert_eq!(queue.len_approx(), 0);
    }
}
