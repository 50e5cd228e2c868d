use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam_utils::CachePadded;

/// One fixed-capacity region of the log.
///
/// A partition is a non-owning view into the backing buffer plus the
/// tail counter tracking how many bytes have been claimed in the current
/// generation. The tail only ever grows while a generation is active and
/// may transiently exceed the capacity; a tail beyond capacity means the
/// partition is exhausted and the producer must roll over.
#[derive(Debug)]
pub struct Partition {
    data: *mut u8,
    capacity: usize,
    tail: CachePadded<AtomicI32>,
}

impl Partition {
    pub(crate) fn new(data: *mut u8, capacity: usize) -> Self {
        Self {
            data,
            capacity,
            tail: CachePadded::new(AtomicI32::new(0)),
        }
    }

    /// Base pointer of this partition's data region.
    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.data
    }

    /// Fixed byte capacity of the data region.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Volatile read of the tail counter.
    #[inline]
    pub fn tail_counter_volatile(&self) -> i32 {
        self.tail.load(Ordering::Acquire)
    }

    /// Atomically reserves `length` bytes and returns the prior tail.
    ///
    /// The reservation is unconditional: the returned offset may lie at
    /// or beyond the capacity, which the caller must treat as "does not
    /// fit".
    #[inline]
    pub(crate) fn claim(&self, length: i32) -> i32 {
        self.tail.fetch_add(length, Ordering::AcqRel)
    }

    /// Zeroes the data region and resets the tail for reuse by a new
    /// generation. The caller must guarantee no reader is inside the
    /// region (the publisher-limit window provides this).
    pub(crate) fn clear(&self) {
        unsafe { ptr::write_bytes(self.data, 0, self.capacity) };
        self.tail.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(len: usize) -> Box<[u64]> {
        vec![0u64; len / 8].into_boxed_slice()
    }

    #[test]
    fn claim_returns_prior_tail() {
        let mut buf = backing(256);
        let partition = Partition::new(buf.as_mut_ptr() as *mut u8, 256);
        assert_eq!(partition.claim(64), 0);
        assert_eq!(partition.claim(32), 64);
        assert_eq!(partition.tail_counter_volatile(), 96);
    }

    #[test]
    fn tail_may_exceed_capacity() {
        let mut buf = backing(64);
        let partition = Partition::new(buf.as_mut_ptr() as *mut u8, 64);
        partition.claim(48);
        let prior = partition.claim(48);
        assert_eq!(prior, 48);
        assert!(partition.tail_counter_volatile() as usize > partition.capacity());
    }

    #[test]
    fn clear_resets_tail_and_zeroes_data() {
        let mut buf = backing(64);
        let base = buf.as_mut_ptr() as *mut u8;
        let partition = Partition::new(base, 64);
        partition.claim(40);
        unsafe { base.write(0xAB) };
        partition.clear();
        assert_eq!(partition.tail_counter_volatile(), 0);
        assert_eq!(unsafe { base.read() }, 0);
    }
}
