use std::slice;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::frame::{self, aligned_length, message_length, FLAG_FAILED, TYPE_PADDING};
use crate::log_buffer::LogBuffer;
use crate::position::{AtomicPosition, Position};

/// Receives one committed fragment at a time during a poll.
///
/// `buffer` is a view of the whole backing region; `offset` and `length`
/// delimit the payload bytes. Returning normally counts the fragment as
/// consumed.
pub trait FragmentHandler {
    fn on_fragment(&mut self, buffer: &[u8], offset: usize, length: usize, stream_id: i32);
}

impl<F> FragmentHandler for F
where
    F: FnMut(&[u8], usize, usize, i32),
{
    fn on_fragment(&mut self, buffer: &[u8], offset: usize, length: usize, stream_id: i32) {
        self(buffer, offset, length, stream_id)
    }
}

/// Wake-up hook for an external scheduler: signaled whenever a
/// subscription makes consumption progress.
pub trait ConsumerCondition: Send + Sync {
    fn signal(&self);
}

impl<F> ConsumerCondition for F
where
    F: Fn() + Send + Sync,
{
    fn signal(&self) {
        self()
    }
}

type ConditionRegistry = Mutex<Vec<Arc<dyn ConsumerCondition>>>;

fn signal_all(registry: &ConditionRegistry) {
    let conditions: Vec<_> = registry.lock().iter().cloned().collect();
    for condition in conditions {
        condition.signal();
    }
}

/// An independent consumer cursor over the log.
///
/// Each subscription owns exactly one position cell and advances it only
/// forward, only after a successful read. Concurrent progress of other
/// subscriptions is invisible to it.
pub struct Subscription {
    name: String,
    log: Arc<LogBuffer>,
    publisher_position: Arc<AtomicPosition>,
    position: Arc<AtomicPosition>,
    conditions: Arc<ConditionRegistry>,
}

impl Subscription {
    pub(crate) fn new(
        name: String,
        log: Arc<LogBuffer>,
        publisher_position: Arc<AtomicPosition>,
        start: Position,
        on_consumption: Arc<dyn ConsumerCondition>,
    ) -> Self {
        Self {
            name,
            log,
            publisher_position,
            position: Arc::new(AtomicPosition::new(start)),
            conditions: Arc::new(Mutex::new(vec![on_consumption])),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current cursor of this subscription.
    #[inline]
    pub fn position(&self) -> Position {
        self.position.get()
    }

    #[cfg(test)]
    pub(crate) fn position_cell(&self) -> &Arc<AtomicPosition> {
        &self.position
    }

    pub fn register_consumer(&self, condition: Arc<dyn ConsumerCondition>) {
        self.conditions.lock().push(condition);
    }

    pub fn remove_consumer(&self, condition: &Arc<dyn ConsumerCondition>) {
        self.conditions
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, condition));
    }

    /// Notifies every registered consumer condition.
    pub fn signal_consumers(&self) {
        signal_all(&self.conditions);
    }

    fn region(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.log.raw() as *const u8, self.log.capacity()) }
    }

    /// Delivers up to `max_fragments` committed fragments to `handler`,
    /// fragment at a time, and advances the cursor past everything
    /// consumed. Returns the number of fragments delivered; `0` means no
    /// committed data was available.
    pub fn poll<H>(&self, handler: &mut H, max_fragments: usize) -> usize
    where
        H: FragmentHandler + ?Sized,
    {
        let limit = self.publisher_position.get();
        let current = self.position.get();
        if current >= limit {
            return 0;
        }

        let partition_size = self.log.partition_size();
        let mut generation = current.generation();
        let mut offset = current.offset() as usize;
        let mut fragments_read = 0;

        while fragments_read < max_fragments
            && Position::from_parts(generation, offset as i32) < limit
        {
            let base = self.log.partition(generation).data_ptr();
            let framed = unsafe { frame::frame_length_volatile(base, offset) };
            if framed <= 0 {
                // producer is still writing this frame
                break;
            }
            let aligned = aligned_length(framed as usize);
            if unsafe { frame::frame_type(base, offset) } == TYPE_PADDING {
                offset += aligned;
            } else {
                let stream_id = unsafe { frame::stream_id(base, offset) };
                let payload_offset = self.log.partition_base_offset(generation)
                    + frame::payload_offset(offset);
                handler.on_fragment(
                    self.region(),
                    payload_offset,
                    message_length(framed as usize),
                    stream_id,
                );
                fragments_read += 1;
                offset += aligned;
            }
            if offset >= partition_size {
                generation += 1;
                offset = 0;
            }
        }

        let advanced = self
            .position
            .propose_max_ordered(Position::from_parts(generation, offset as i32));
        if advanced {
            self.signal_consumers();
        }
        fragments_read
    }

    /// Builds the largest contiguous run of committed message frames at
    /// the cursor into `peek`, bounded by `max_block_length`, by the
    /// producer's position, and (when `stream_aware`) by the first
    /// change of stream id. Returns the block length in bytes; `0` means
    /// no payload is ready, though the cursor may have advanced past
    /// padding.
    ///
    /// `max_block_length` must be at least the configured max fragment
    /// length, otherwise an oversized frame can never be handed out and
    /// the subscription stalls.
    pub fn peek_block(
        &self,
        peek: &mut BlockPeek,
        max_block_length: usize,
        stream_aware: bool,
    ) -> usize {
        let limit = self.publisher_position.get();
        let current = self.position.get();
        if current >= limit {
            return 0;
        }

        let partition_size = self.log.partition_size();
        let generation = current.generation();
        let start = current.offset() as usize;
        let base = self.log.partition(generation).data_ptr();

        let mut offset = start;
        let mut block_length = 0usize;
        let mut stream_id = -1i32;

        loop {
            if Position::from_parts(generation, offset as i32) >= limit {
                break;
            }
            let framed = unsafe { frame::frame_length_volatile(base, offset) };
            if framed <= 0 {
                break;
            }
            let aligned = aligned_length(framed as usize);
            if unsafe { frame::frame_type(base, offset) } == TYPE_PADDING {
                if block_length == 0 {
                    let end = offset + aligned;
                    let next = if end == partition_size {
                        Position::from_parts(generation + 1, 0)
                    } else {
                        Position::from_parts(generation, end as i32)
                    };
                    self.position.propose_max_ordered(next);
                    return 0;
                }
                // later padding is left for the next peek
                break;
            }
            if block_length + aligned > max_block_length {
                break;
            }
            let frame_stream = unsafe { frame::stream_id(base, offset) };
            if stream_aware {
                if block_length == 0 {
                    stream_id = frame_stream;
                } else if frame_stream != stream_id {
                    break;
                }
            }
            block_length += aligned;
            offset += aligned;
        }

        if block_length == 0 {
            return 0;
        }

        peek.populate(
            Arc::clone(&self.log),
            Arc::clone(&self.position),
            Arc::clone(&self.conditions),
            generation,
            start,
            block_length,
            stream_id,
        );
        block_length
    }

    /// Peeks one block, hands each fragment in it to `handler` and
    /// completes the block. Returns the number of bytes consumed.
    pub fn peek_and_consume<H>(&self, handler: &mut H, max_block_length: usize) -> usize
    where
        H: FragmentHandler + ?Sized,
    {
        let mut peek = BlockPeek::new();
        let available = self.peek_block(&mut peek, max_block_length, false);
        if available == 0 {
            return 0;
        }

        let generation = peek.partition_id();
        let partition_base = self.log.partition_base_offset(generation);
        let base = self.log.partition(generation).data_ptr();
        let mut offset = peek.block_offset() - partition_base;
        let end = offset + peek.block_length();
        while offset < end {
            let framed = unsafe { frame::frame_length_volatile(base, offset) } as usize;
            let stream_id = unsafe { frame::stream_id(base, offset) };
            handler.on_fragment(
                self.region(),
                partition_base + frame::payload_offset(offset),
                message_length(framed),
                stream_id,
            );
            offset += aligned_length(framed);
        }
        peek.mark_completed();
        available
    }
}

/// A peeked run of committed frames, pending explicit completion.
///
/// Populated by [`Subscription::peek_block`]; the caller reads
/// [`bytes`](Self::bytes) and then calls exactly one of
/// [`mark_completed`](Self::mark_completed) or
/// [`mark_failed`](Self::mark_failed). Skipping both leaves the
/// subscription's cursor stalled at the block start.
#[derive(Default)]
pub struct BlockPeek {
    log: Option<Arc<LogBuffer>>,
    position: Option<Arc<AtomicPosition>>,
    conditions: Option<Arc<ConditionRegistry>>,
    generation: i32,
    start_offset: usize,
    block_length: usize,
    stream_id: i32,
    pending: bool,
}

impl BlockPeek {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    fn populate(
        &mut self,
        log: Arc<LogBuffer>,
        position: Arc<AtomicPosition>,
        conditions: Arc<ConditionRegistry>,
        generation: i32,
        start_offset: usize,
        block_length: usize,
        stream_id: i32,
    ) {
        self.log = Some(log);
        self.position = Some(position);
        self.conditions = Some(conditions);
        self.generation = generation;
        self.start_offset = start_offset;
        self.block_length = block_length;
        self.stream_id = stream_id;
        self.pending = true;
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Partition generation the block lives in.
    #[inline]
    pub fn partition_id(&self) -> i32 {
        self.generation
    }

    /// Absolute byte offset of the block within the backing region.
    pub fn block_offset(&self) -> usize {
        match &self.log {
            Some(log) => log.partition_base_offset(self.generation) + self.start_offset,
            None => 0,
        }
    }

    /// Byte length of the block, frame headers included.
    #[inline]
    pub fn block_length(&self) -> usize {
        self.block_length
    }

    /// Stream id shared by the block's frames, or `-1` when the peek was
    /// not stream aware.
    #[inline]
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Position the subscription resumes at once the block is resolved.
    pub fn resume_position(&self) -> Position {
        let end = self.start_offset + self.block_length;
        Position::from_parts(self.generation, end as i32)
    }

    /// Zero-copy view of the block: the run of committed frames,
    /// headers and payloads at their fixed offsets. Empty until the
    /// peek has been populated.
    pub fn bytes(&self) -> &[u8] {
        match &self.log {
            Some(log) => {
                let start = log.partition_base_offset(self.generation) + self.start_offset;
                unsafe {
                    slice::from_raw_parts((log.raw() as *const u8).add(start), self.block_length)
                }
            }
            None => &[],
        }
    }

    /// Consumes the block: advances the subscription cursor past it and
    /// signals every registered consumer condition.
    pub fn mark_completed(&mut self) {
        debug_assert!(self.pending, "peek resolved twice");
        if !self.pending {
            return;
        }
        self.advance_and_signal();
    }

    /// Consumes the block like [`mark_completed`](Self::mark_completed),
    /// but first raises the failed flag on each frame in place so
    /// downstream observers can see the processing failure.
    pub fn mark_failed(&mut self) {
        debug_assert!(self.pending, "peek resolved twice");
        if !self.pending {
            return;
        }
        let Some(log) = &self.log else {
            return;
        };
        let base = log.partition(self.generation).data_ptr();
        let end = self.start_offset + self.block_length;
        let mut offset = self.start_offset;
        while offset < end {
            let framed = unsafe { frame::frame_length_volatile(base, offset) };
            unsafe { frame::raise_flags(base, offset, FLAG_FAILED) };
            offset += aligned_length(framed as usize);
        }
        debug!(
            partition = self.generation,
            offset = self.start_offset,
            length = self.block_length,
            "marked peeked block failed"
        );
        self.advance_and_signal();
    }

    fn advance_and_signal(&mut self) {
        if let Some(position) = &self.position {
            position.propose_max_ordered(self.resume_position());
        }
        if let Some(conditions) = &self.conditions {
            signal_all(conditions);
        }
        self.pending = false;
    }
}
