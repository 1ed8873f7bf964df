//! Host-to-device completion handoff ring.
//!
//! Network paths that complete on a host CPU thread (the host-NIC
//! scale-out transport) hand their completion notifications to the
//! engine performing the final device-side signal through this ring.
//!
//! Contract: capacity is a power of two; the producer index is written
//! only by the producer thread and the consumer index only by the
//! consumer thread. A continuous-write request that does not fit before
//! the end of the buffer wraps around, recording a watermark so the
//! consumer knows where the contiguous region ends and skips the dead
//! slots.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, WeftError};
use crate::types::{QueueId, TargetValue};

/// One completion notification crossing the host/device boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    pub queue: QueueId,
    pub target: TargetValue,
}

/// Sentinel: no live watermark.
const NO_WATERMARK: usize = usize::MAX;

struct Shared {
    buf: Box<[UnsafeCell<MaybeUninit<CompletionRecord>>]>,
    mask: usize,
    /// Absolute producer position (monotonic); written by the producer.
    head: AtomicUsize,
    /// Absolute consumer position (monotonic); written by the consumer.
    tail: AtomicUsize,
    /// Absolute position where the last continuous write wrapped;
    /// written by the producer. At most one watermark is live at a
    /// time: a second wrap cannot be admitted until the consumer has
    /// passed the first.
    watermark: AtomicUsize,
}

// SAFETY: slots are only written by the producer between tail and head
// reservations, and only read by the consumer after the head release
// made them visible; the two halves never touch the same slot
// concurrently.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Create a completion ring of `capacity` slots (must be a power of
/// two), returning the producer and consumer halves.
pub fn completion_ring(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(
        capacity.is_power_of_two() && capacity > 0,
        "completion ring capacity must be a power of two"
    );
    let buf = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(Shared {
        buf,
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        watermark: AtomicUsize::new(NO_WATERMARK),
    });
    (
        RingProducer {
            shared: Arc::clone(&shared),
            head: 0,
        },
        RingConsumer { shared, tail: 0 },
    )
}

/// Producer half; owned by the host completion thread.
pub struct RingProducer {
    shared: Arc<Shared>,
    head: usize,
}

impl RingProducer {
    /// Push one record.
    pub fn push(&mut self, record: CompletionRecord) -> Result<()> {
        let tail = self.shared.tail.load(Ordering::Acquire);
        if self.head - tail == self.capacity() {
            return Err(WeftError::CompletionRingFull {
                capacity: self.capacity(),
            });
        }
        self.write(self.head, record);
        self.head += 1;
        self.shared.head.store(self.head, Ordering::Release);
        Ok(())
    }

    /// Push `records` as one contiguous region.
    ///
    /// If the region does not fit before the end of the buffer, the
    /// current position is recorded as the watermark and the write
    /// wraps to the start; the slots between watermark and boundary are
    /// dead. Returns the slot index of the region's first record.
    pub fn push_contiguous(&mut self, records: &[CompletionRecord]) -> Result<usize> {
        let n = records.len();
        let cap = self.capacity();
        if n == 0 {
            return Ok(self.head & self.shared.mask);
        }
        let to_boundary = cap - (self.head & self.shared.mask);
        let skip = if n <= to_boundary { 0 } else { to_boundary };
        let tail = self.shared.tail.load(Ordering::Acquire);
        if self.head + skip + n - tail > cap {
            return Err(WeftError::CompletionRingFull { capacity: cap });
        }
        if skip > 0 {
            self.shared.watermark.store(self.head, Ordering::Release);
            self.head += skip;
        }
        let start = self.head & self.shared.mask;
        for (i, rec) in records.iter().enumerate() {
            self.write(self.head + i, *rec);
        }
        self.head += n;
        self.shared.head.store(self.head, Ordering::Release);
        Ok(start)
    }

    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }

    /// Whether a push would currently be rejected.
    pub fn is_full(&self) -> bool {
        self.head - self.shared.tail.load(Ordering::Acquire) == self.capacity()
    }

    fn write(&self, pos: usize, record: CompletionRecord) {
        let slot = &self.shared.buf[pos & self.shared.mask];
        // SAFETY: pos is between the consumer's published tail and our
        // unpublished head, so the consumer cannot be reading it.
        unsafe { (*slot.get()).write(record) };
    }
}

/// Consumer half; owned by the engine-side drain thread.
pub struct RingConsumer {
    shared: Arc<Shared>,
    tail: usize,
}

impl RingConsumer {
    /// Pop the oldest record, skipping any dead region a continuous
    /// write left behind the watermark.
    pub fn pop(&mut self) -> Option<CompletionRecord> {
        let head = self.shared.head.load(Ordering::Acquire);
        loop {
            if self.tail == head {
                return None;
            }
            let wm = self.shared.watermark.load(Ordering::Acquire);
            if wm == self.tail {
                // Contiguous region ended here; jump to the boundary.
                self.tail += self.capacity() - (self.tail & self.shared.mask);
                self.shared.tail.store(self.tail, Ordering::Release);
                continue;
            }
            let slot = &self.shared.buf[self.tail & self.shared.mask];
            // SAFETY: tail < head, so the producer published this slot.
            let record = unsafe { (*slot.get()).assume_init() };
            self.tail += 1;
            self.shared.tail.store(self.tail, Ordering::Release);
            return Some(record);
        }
    }

    /// Records currently available, counting dead watermark slots.
    pub fn len(&self) -> usize {
        self.shared.head.load(Ordering::Acquire) - self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(target: TargetValue) -> CompletionRecord {
        CompletionRecord { queue: 0, target }
    }

    #[test]
    fn test_push_pop_fifo() {
        let (mut p, mut c) = completion_ring(8);
        for t in 1..=5 {
            p.push(rec(t)).unwrap();
        }
        for t in 1..=5 {
            assert_eq!(c.pop(), Some(rec(t)));
        }
        assert!(c.pop().is_none());
    }

    #[test]
    fn test_full_ring_rejects() {
        let (mut p, mut c) = completion_ring(4);
        for t in 0..4 {
            p.push(rec(t)).unwrap();
        }
        assert!(matches!(
            p.push(rec(9)),
            Err(WeftError::CompletionRingFull { capacity: 4 })
        ));
        c.pop().unwrap();
        p.push(rec(9)).unwrap();
    }

    #[test]
    fn test_contiguous_fits_without_wrap() {
        let (mut p, mut c) = completion_ring(8);
        let start = p.push_contiguous(&[rec(1), rec(2), rec(3)]).unwrap();
        assert_eq!(start, 0);
        assert_eq!(c.pop(), Some(rec(1)));
        assert_eq!(c.pop(), Some(rec(2)));
        assert_eq!(c.pop(), Some(rec(3)));
    }

    #[test]
    fn test_contiguous_wraps_with_watermark() {
        let (mut p, mut c) = completion_ring(8);
        // Advance to position 6.
        for t in 0..6 {
            p.push(rec(t)).unwrap();
        }
        for _ in 0..6 {
            c.pop().unwrap();
        }
        // 3 records do not fit in the remaining 2 slots: wrap to 0.
        let start = p.push_contiguous(&[rec(10), rec(11), rec(12)]).unwrap();
        assert_eq!(start, 0);
        // The consumer skips the dead region and reads in order.
        assert_eq!(c.pop(), Some(rec(10)));
        assert_eq!(c.pop(), Some(rec(11)));
        assert_eq!(c.pop(), Some(rec(12)));
        assert!(c.pop().is_none());
    }

    #[test]
    fn test_contiguous_wrap_respects_capacity() {
        let (mut p, mut c) = completion_ring(8);
        for t in 0..6 {
            p.push(rec(t)).unwrap();
        }
        // Only 2 consumed: wrapping (2 dead + 3 new) would need 11 > 8.
        c.pop().unwrap();
        c.pop().unwrap();
        assert!(p.push_contiguous(&[rec(10), rec(11), rec(12)]).is_err());
        // Nothing was written; normal traffic continues.
        p.push(rec(6)).unwrap();
        assert_eq!(c.pop(), Some(rec(2)));
    }

    #[test]
    fn test_empty_contiguous_is_noop() {
        let (mut p, mut c) = completion_ring(4);
        p.push_contiguous(&[]).unwrap();
        assert!(c.pop().is_none());
    }

    #[test]
    fn test_threaded_handoff() {
        let (mut p, mut c) = completion_ring(64);
        let producer = std::thread::spawn(move || {
            let mut t = 0u64;
            while t < 1000 {
                if p.push(rec(t)).is_ok() {
                    t += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });
        let mut expect = 0u64;
        while expect < 1000 {
            match c.pop() {
                Some(r) => {
                    assert_eq!(r.target, expect);
                    expect += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }
}
