//! Pending write buffers
//!
//! The hot path only enqueues; records reach their files when the runtime
//! flushes at `init_all` / `destroy_all`. Both queue flavours are lock-free
//! and never block the caller.
//!
//! ```text
//! instrumented code ──push──▶ PendingBuffer ──drain (flush)──▶ OffsetFile
//!    (any context)          ArrayQueue / SegQueue          (process context)
//! ```
//!
//! A bounded buffer drops on full and counts the drop, so a saturated trace
//! has detectable gaps instead of stalling the traced system.

use crossbeam::queue::{ArrayQueue, SegQueue};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Queue policy for pending records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BufferPolicy {
    /// Grow without limit
    #[default]
    Unbounded,
    /// Hold at most `capacity` records, dropping the rest
    Bounded { capacity: usize },
}

#[derive(Debug)]
enum Queue<T> {
    Bounded(ArrayQueue<T>),
    Unbounded(SegQueue<T>),
}

/// Lock-free pending-record queue with push/drop counters
///
/// # Example
///
/// ```
/// use pmtrace::runtime::buffer::{BufferPolicy, PendingBuffer};
///
/// let buffer = PendingBuffer::new(BufferPolicy::Bounded { capacity: 2 });
/// assert!(buffer.push(1));
/// assert!(buffer.push(2));
/// assert!(!buffer.push(3));
///
/// let stats = buffer.stats();
/// assert_eq!(stats.total_pushed, 3);
/// assert_eq!(stats.total_dropped, 1);
/// assert_eq!(buffer.drain(), vec![1, 2]);
/// ```
#[derive(Debug)]
pub struct PendingBuffer<T> {
    queue: Queue<T>,

    /// Records offered to the buffer
    total_pushed: AtomicU64,

    /// Records refused because the buffer was full
    total_dropped: AtomicU64,
}

impl<T> PendingBuffer<T> {
    /// Create a buffer; a bounded capacity of zero is raised to one
    pub fn new(policy: BufferPolicy) -> Self {
        let queue = match policy {
            BufferPolicy::Bounded { capacity } => Queue::Bounded(ArrayQueue::new(capacity.max(1))),
            BufferPolicy::Unbounded => Queue::Unbounded(SegQueue::new()),
        };
        Self {
            queue,
            total_pushed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a record; returns `false` if it was dropped
    pub fn push(&self, record: T) -> bool {
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        let accepted = match &self.queue {
            Queue::Bounded(queue) => queue.push(record).is_ok(),
            Queue::Unbounded(queue) => {
                queue.push(record);
                true
            }
        };
        if !accepted {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    pub fn pop(&self) -> Option<T> {
        match &self.queue {
            Queue::Bounded(queue) => queue.pop(),
            Queue::Unbounded(queue) => queue.pop(),
        }
    }

    /// Take every pending record in FIFO order
    pub fn drain(&self) -> Vec<T> {
        let mut records = Vec::with_capacity(self.len());
        while let Some(record) = self.pop() {
            records.push(record);
        }
        records
    }

    /// Discard pending records, returning how many were discarded
    pub fn clear(&self) -> usize {
        let mut count = 0;
        while self.pop().is_some() {
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        match &self.queue {
            Queue::Bounded(queue) => queue.len(),
            Queue::Unbounded(queue) => queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        match &self.queue {
            Queue::Bounded(queue) => Some(queue.capacity()),
            Queue::Unbounded(_) => None,
        }
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity(),
        }
    }
}

/// Pending buffer statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub capacity: Option<usize>,
}

impl BufferStats {
    /// Calculate drop rate (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        if self.total_pushed == 0 {
            0.0
        } else {
            self.total_dropped as f64 / self.total_pushed as f64
        }
    }

    /// Calculate buffer utilization (0.0 to 1.0); always 0 when unbounded
    pub fn utilization(&self) -> f64 {
        match self.capacity {
            Some(capacity) if capacity > 0 => self.current_size as f64 / capacity as f64,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unbounded_never_drops() {
        let buffer = PendingBuffer::new(BufferPolicy::Unbounded);
        for i in 0..10_000 {
            assert!(buffer.push(i));
        }
        let stats = buffer.stats();
        assert_eq!(stats.total_pushed, 10_000);
        assert_eq!(stats.total_dropped, 0);
        assert_eq!(stats.capacity, None);
        assert_eq!(buffer.drain().len(), 10_000);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_capacity_raised() {
        let buffer = PendingBuffer::<u8>::new(BufferPolicy::Bounded { capacity: 0 });
        assert_eq!(buffer.capacity(), Some(1));
    }

    #[test]
    fn test_backpressure_drops_records() {
        let buffer = PendingBuffer::new(BufferPolicy::Bounded { capacity: 4 });
        let accepted = (0..10).filter(|i| buffer.push(*i)).count();
        assert_eq!(accepted, 4);
        let stats = buffer.stats();
        assert_eq!(stats.total_dropped, 6);
        assert_eq!(stats.utilization(), 1.0);
        assert_eq!(buffer.drain(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_concurrent_push_accounting() {
        let buffer = Arc::new(PendingBuffer::new(BufferPolicy::Bounded { capacity: 100 }));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..1000 {
                        buffer.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = buffer.stats();
        assert_eq!(stats.total_pushed, 4000);
        assert_eq!(stats.total_dropped as usize + buffer.len(), 4000);
    }

    #[test]
    fn test_clear_counts() {
        let buffer = PendingBuffer::new(BufferPolicy::Unbounded);
        buffer.push("a");
        buffer.push("b");
        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drop_rate_calculation() {
        let stats = BufferStats {
            total_pushed: 100,
            total_dropped: 5,
            current_size: 50,
            capacity: Some(1024),
        };
        assert_eq!(stats.drop_rate(), 0.05);
        assert_eq!(stats.utilization(), 50.0 / 1024.0);
    }
}
