//! Bounded exchange rings between the hardware and simulation domains
//!
//! One ring per direction. Each ring is split into a producer and a
//! consumer half; neither half is `Clone`, so exactly one owner enqueues
//! and exactly one owner dequeues.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::pool::PacketBuffer;

/// Create a ring with room for `capacity` buffers.
///
/// # Panics
/// Panics if `capacity` is zero.
pub fn exchange_ring(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "ring capacity must be non-zero");
    let queue = Arc::new(ArrayQueue::new(capacity));
    (
        RingProducer {
            queue: Arc::clone(&queue),
        },
        RingConsumer { queue },
    )
}

/// Enqueue side of an exchange ring
pub struct RingProducer {
    queue: Arc<ArrayQueue<PacketBuffer>>,
}

impl RingProducer {
    /// Append a buffer. A full ring hands the buffer back untouched.
    #[inline]
    pub fn try_enqueue(&self, buf: PacketBuffer) -> Result<(), PacketBuffer> {
        self.queue.push(buf)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Dequeue side of an exchange ring
pub struct RingConsumer {
    queue: Arc<ArrayQueue<PacketBuffer>>,
}

impl RingConsumer {
    #[inline]
    pub fn try_dequeue(&self) -> Option<PacketBuffer> {
        self.queue.pop()
    }

    /// Move up to `max` buffers, oldest first, onto the end of `out`.
    /// Returns how many were moved.
    pub fn try_dequeue_burst(&self, max: usize, out: &mut Vec<PacketBuffer>) -> usize {
        let mut count = 0;
        while count < max {
            match self.queue.pop() {
                Some(buf) => {
                    out.push(buf);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl std::fmt::Debug for RingProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingProducer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl std::fmt::Debug for RingConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingConsumer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
