use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::partition::Partition;

/// Cache-line alignment for the backing allocation.
const REGION_ALIGNMENT: usize = 64;

/// The partitioned backing store of the transport.
///
/// One contiguous allocation divided into a fixed number of equally
/// sized partitions. Partition generations grow without bound; a
/// generation maps onto the physical slot `generation % partition_count`.
/// The buffer tracks which generation the producer is currently writing
/// and prepares reused slots ahead of the producer on rollover.
#[derive(Debug)]
pub struct LogBuffer {
    base: *mut u8,
    layout: Layout,
    partition_size: usize,
    partitions: Box<[Partition]>,
    active_partition_id: AtomicI32,
}

// The raw pointers only ever address the allocation owned by this
// struct; all cross-thread access is mediated by atomics.
unsafe impl Send for LogBuffer {}
unsafe impl Sync for LogBuffer {}

impl LogBuffer {
    pub(crate) fn allocate(partition_count: usize, partition_size: usize) -> Self {
        let total = partition_count * partition_size;
        // geometry is validated by the config before allocation
        let layout = unsafe { Layout::from_size_align_unchecked(total, REGION_ALIGNMENT) };
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            std::alloc::handle_alloc_error(layout);
        }

        let partitions = (0..partition_count)
            .map(|slot| {
                let data = unsafe { base.add(slot * partition_size) };
                Partition::new(data, partition_size)
            })
            .collect();

        Self {
            base,
            layout,
            partition_size,
            partitions,
            active_partition_id: AtomicI32::new(0),
        }
    }

    #[inline]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    #[inline]
    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    /// Total byte capacity across all partitions.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Generation the producer is currently writing.
    #[inline]
    pub fn active_partition_id(&self) -> i32 {
        self.active_partition_id.load(Ordering::Acquire)
    }

    /// Maps a generation to its physical partition.
    #[inline]
    pub fn partition(&self, generation: i32) -> &Partition {
        let slot = generation as usize % self.partitions.len();
        &self.partitions[slot]
    }

    /// Base pointer of the whole backing region, for zero-copy reads.
    #[inline]
    pub(crate) fn raw(&self) -> *mut u8 {
        self.base
    }

    /// Absolute byte offset of a generation's data region within the
    /// backing region.
    #[inline]
    pub(crate) fn partition_base_offset(&self, generation: i32) -> usize {
        (generation as usize % self.partitions.len()) * self.partition_size
    }

    /// Called by the producer after it wrote the trailing padding of
    /// `generation`. Prepares the slot two generations ahead (the next
    /// one was prepared by the previous rollover) and publishes the new
    /// active generation.
    pub(crate) fn on_active_partition_filled(&self, generation: i32) {
        self.partition(generation + 2).clear();
        self.active_partition_id
            .store(generation + 1, Ordering::Release);
    }
}

impl Drop for LogBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}
