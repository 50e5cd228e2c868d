use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::claim::{ClaimedFragment, ClaimedFragmentBatch};
use crate::config::DispatchConfig;
use crate::error::{BackpressureKind, DispatchError, DispatchResult};
use crate::frame::{
    self, aligned_length, claimed_batch_length, framed_length, HEADER_LENGTH, TYPE_MESSAGE,
    TYPE_PADDING,
};
use crate::log_buffer::LogBuffer;
use crate::position::{AtomicPosition, Position};
use crate::subscription::{ConsumerCondition, Subscription};

/// Stream id claims fall back to when the producer has no stream to tag.
pub const DEFAULT_STREAM_ID: i32 = 0;

enum Reserved {
    /// Space was reserved; the frame starts at this in-partition offset.
    Frame(usize),
    /// The claim hit the end of the partition; trailing padding was
    /// written and the next generation activated.
    Rolled,
    /// The tail was already beyond capacity; the partition was rolled by
    /// an earlier claim and the caller should retry.
    Exhausted,
}

/// Reserves `aligned` bytes in the generation's partition.
///
/// The tail advance is unconditional; a reservation landing beyond the
/// usable capacity is resolved here by filling the remainder of the
/// partition with committed padding and activating the next generation.
fn reserve_frame(log: &LogBuffer, generation: i32, aligned: usize) -> Reserved {
    let partition = log.partition(generation);
    let capacity = partition.capacity() as i64;
    let frame_offset = partition.claim(aligned as i32) as i64;
    let new_tail = frame_offset + aligned as i64;

    if new_tail <= capacity - HEADER_LENGTH as i64 {
        Reserved::Frame(frame_offset as usize)
    } else if frame_offset < capacity {
        let offset = frame_offset as usize;
        let pad = capacity as usize - offset;
        unsafe {
            let data = partition.data_ptr();
            frame::set_frame_type(data, offset, TYPE_PADDING);
            frame::set_flags(data, offset, 0);
            frame::set_stream_id(data, offset, DEFAULT_STREAM_ID);
            frame::set_frame_length_ordered(data, offset, pad as i32);
        }
        log.on_active_partition_filled(generation);
        Reserved::Rolled
    } else {
        Reserved::Exhausted
    }
}

/// The producer side of the transport.
///
/// A dispatcher owns the partitioned log, hands out claim windows to a
/// single producer and recomputes the publisher limit from the slowest
/// open subscription. Claims are not internally serialized: driving the
/// claim methods from more than one thread at a time is outside the
/// contract.
pub struct Dispatcher {
    log: Arc<LogBuffer>,
    publisher_position: Arc<AtomicPosition>,
    publisher_limit: Arc<AtomicPosition>,
    fragment_sequence: AtomicI64,
    window_size: usize,
    max_fragment_length: usize,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> DispatchResult<Self> {
        config.validate()?;
        let log = Arc::new(LogBuffer::allocate(
            config.partition_count,
            config.partition_size,
        ));
        debug!(
            partitions = config.partition_count,
            partition_size = config.partition_size,
            window = config.window_size,
            "created dispatcher"
        );
        Ok(Self {
            log,
            publisher_position: Arc::new(AtomicPosition::new(Position::from_parts(0, 0))),
            publisher_limit: Arc::new(AtomicPosition::new(Position::from_parts(
                0,
                config.window_size as i32,
            ))),
            fragment_sequence: AtomicI64::new(0),
            window_size: config.window_size,
            max_fragment_length: config.max_fragment_length,
            subscriptions: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn log_buffer(&self) -> &LogBuffer {
        &self.log
    }

    #[inline]
    pub fn publisher_position(&self) -> Position {
        self.publisher_position.get()
    }

    #[inline]
    pub fn publisher_limit(&self) -> Position {
        self.publisher_limit.get()
    }

    #[inline]
    pub fn max_fragment_length(&self) -> usize {
        self.max_fragment_length
    }

    #[inline]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Rejects further claims. Open subscriptions keep draining.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("dispatcher closed");
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> DispatchResult<()> {
        if self.is_closed() {
            return Err(DispatchError::invalid_state("dispatcher is closed"));
        }
        Ok(())
    }

    /// Admission check against the publisher limit. No side effects on
    /// failure.
    fn admit(&self, generation: i32, aligned: usize) -> DispatchResult<()> {
        let tail = self.log.partition(generation).tail_counter_volatile().max(0) as i64;
        let candidate_end = Position::from_parts(generation, (tail + aligned as i64) as i32);
        if candidate_end > self.publisher_limit.get() {
            return Err(DispatchError::would_block(BackpressureKind::PublisherLimit));
        }
        Ok(())
    }

    /// Claims a window for one fragment of `payload_length` bytes.
    ///
    /// On success the returned handle must be committed (or aborted)
    /// once the payload is written. The handle's position is the
    /// fragment sequence number: consecutive successful claims return
    /// consecutive values.
    pub fn claim_single_fragment(
        &self,
        payload_length: usize,
        stream_id: i32,
    ) -> DispatchResult<ClaimedFragment> {
        self.ensure_open()?;
        let framed = framed_length(payload_length);
        let aligned = aligned_length(framed);
        if aligned > self.max_fragment_length {
            return Err(DispatchError::FragmentTooLarge {
                framed: aligned,
                max: self.max_fragment_length,
            });
        }

        loop {
            let generation = self.log.active_partition_id();
            self.admit(generation, aligned)?;

            match reserve_frame(&self.log, generation, aligned) {
                Reserved::Frame(frame_offset) => {
                    unsafe {
                        let data = self.log.partition(generation).data_ptr();
                        frame::set_frame_length_relaxed(data, frame_offset, -(framed as i32));
                        frame::set_frame_type(data, frame_offset, TYPE_MESSAGE);
                        frame::set_flags(data, frame_offset, 0);
                        frame::set_stream_id(data, frame_offset, stream_id);
                    }
                    self.publisher_position.propose_max_ordered(Position::from_parts(
                        generation,
                        (frame_offset + aligned) as i32,
                    ));
                    let position = self.fragment_sequence.fetch_add(1, Ordering::Relaxed);
                    return Ok(ClaimedFragment::new(
                        Arc::clone(&self.log),
                        generation,
                        frame_offset,
                        framed,
                        position,
                    ));
                }
                Reserved::Rolled => {
                    self.publisher_position
                        .propose_max_ordered(Position::from_parts(generation + 1, 0));
                    debug!(generation, "partition filled, rolled to next generation");
                }
                Reserved::Exhausted => {
                    return Err(DispatchError::would_block(BackpressureKind::Rollover));
                }
            }
        }
    }

    /// Claims one contiguous reservation for `fragment_count` frames
    /// carrying `total_payload_length` bytes in total. The fragments are
    /// appended through the returned batch handle and become visible
    /// atomically on commit.
    pub fn claim_fragment_batch(
        &self,
        fragment_count: usize,
        total_payload_length: usize,
    ) -> DispatchResult<ClaimedFragmentBatch> {
        self.ensure_open()?;
        if fragment_count == 0 {
            return Err(DispatchError::invalid_state(
                "batch must contain at least one fragment",
            ));
        }
        let claimed = claimed_batch_length(fragment_count, total_payload_length);
        if claimed > self.max_fragment_length {
            return Err(DispatchError::FragmentTooLarge {
                framed: claimed,
                max: self.max_fragment_length,
            });
        }

        loop {
            let generation = self.log.active_partition_id();
            self.admit(generation, claimed)?;

            match reserve_frame(&self.log, generation, claimed) {
                Reserved::Frame(first_offset) => {
                    self.publisher_position.propose_max_ordered(Position::from_parts(
                        generation,
                        (first_offset + claimed) as i32,
                    ));
                    let position = self
                        .fragment_sequence
                        .fetch_add(fragment_count as i64, Ordering::Relaxed);
                    return Ok(ClaimedFragmentBatch::new(
                        Arc::clone(&self.log),
                        generation,
                        first_offset,
                        claimed,
                        fragment_count,
                        position,
                    ));
                }
                Reserved::Rolled => {
                    self.publisher_position
                        .propose_max_ordered(Position::from_parts(generation + 1, 0));
                    debug!(generation, "partition filled, rolled to next generation");
                }
                Reserved::Exhausted => {
                    return Err(DispatchError::would_block(BackpressureKind::Rollover));
                }
            }
        }
    }

    /// Feasibility of a batch claim, independent of current occupancy:
    /// false when the framed batch cannot fit a single reservation.
    pub fn can_claim_fragment_batch(
        &self,
        fragment_count: usize,
        total_payload_length: usize,
    ) -> bool {
        fragment_count > 0
            && claimed_batch_length(fragment_count, total_payload_length)
                <= self.max_fragment_length
    }

    /// Recomputes the publisher limit from the slowest open subscription
    /// plus the look-ahead window; the publisher position is the floor
    /// when no subscription is open. Returns true if the limit advanced.
    pub fn update_publisher_limit(&self) -> bool {
        let floor = {
            let subscriptions = self.subscriptions.read();
            subscriptions
                .values()
                .map(|subscription| subscription.position())
                .min()
                .unwrap_or_else(|| self.publisher_position.get())
        };

        let mut generation = floor.generation();
        let mut offset = floor.offset() as usize + self.window_size;
        if offset >= self.log.partition_size() {
            generation += 1;
            offset = self.window_size;
        }
        self.publisher_limit
            .propose_max_ordered(Position::from_parts(generation, offset as i32))
    }

    /// Opens a named subscription starting at the current publisher
    /// position. The name must be unused.
    pub fn open_subscription(
        &self,
        name: impl Into<String>,
        on_consumption: Arc<dyn ConsumerCondition>,
    ) -> DispatchResult<Arc<Subscription>> {
        let start = self.publisher_position.get();
        self.open_subscription_at(name, on_consumption, start)
    }

    /// Opens a named subscription with an explicit starting position.
    pub fn open_subscription_at(
        &self,
        name: impl Into<String>,
        on_consumption: Arc<dyn ConsumerCondition>,
        start: Position,
    ) -> DispatchResult<Arc<Subscription>> {
        let name = name.into();
        let start = if start.is_set() {
            start
        } else {
            self.publisher_position.get()
        };
        let mut subscriptions = self.subscriptions.write();
        if subscriptions.contains_key(&name) {
            return Err(DispatchError::SubscriptionExists(name));
        }
        let subscription = Arc::new(Subscription::new(
            name.clone(),
            Arc::clone(&self.log),
            Arc::clone(&self.publisher_position),
            start,
            on_consumption,
        ));
        subscriptions.insert(name.clone(), Arc::clone(&subscription));
        debug!(subscription = %name, position = %start, "opened subscription");
        Ok(subscription)
    }

    /// Removes a subscription from the registry, releasing its hold on
    /// the publisher limit. Returns false if the name was unknown.
    pub fn close_subscription(&self, name: &str) -> bool {
        let removed = self.subscriptions.write().remove(name).is_some();
        if removed {
            debug!(subscription = %name, "closed subscription");
        }
        removed
    }

    pub fn subscription(&self, name: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(name).cloned()
    }

    pub fn subscription_names(&self) -> Vec<String> {
        self.subscriptions.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FRAME_ALIGNMENT;

    fn config() -> DispatchConfig {
        DispatchConfig {
            partition_count: 3,
            partition_size: 4096,
            window_size: 4096,
            max_fragment_length: 1024,
        }
    }

    fn noop() -> Arc<dyn ConsumerCondition> {
        Arc::new(|| {})
    }

    #[test]
    fn sequential_claims_count_fragments() {
        let dispatcher = Dispatcher::new(config()).expect("dispatcher");
        let first = dispatcher
            .claim_single_fragment(64, DEFAULT_STREAM_ID)
            .expect("first claim");
        assert_eq!(first.position(), 0);
        first.commit();
        let second = dispatcher
            .claim_single_fragment(64, DEFAULT_STREAM_ID)
            .expect("second claim");
        assert_eq!(second.position(), 1);
        second.commit();
    }

    #[test]
    fn batch_claim_advances_sequence_by_fragment_count() {
        let dispatcher = Dispatcher::new(config()).expect("dispatcher");
        let batch = dispatcher.claim_fragment_batch(3, 96).expect("batch");
        assert_eq!(batch.position(), 0);
        batch.abort();
        let next = dispatcher
            .claim_single_fragment(8, DEFAULT_STREAM_ID)
            .expect("claim");
        assert_eq!(next.position(), 3);
        next.commit();
    }

    #[test]
    fn claim_beyond_limit_is_rejected_without_side_effects() {
        let mut cfg = config();
        cfg.window_size = 1024;
        let dispatcher = Dispatcher::new(cfg).expect("dispatcher");

        // aligned framed length of 128 bytes per claim
        for _ in 0..8 {
            dispatcher
                .claim_single_fragment(116, DEFAULT_STREAM_ID)
                .expect("claim within window")
                .commit();
        }
        let tail_before = dispatcher.log_buffer().partition(0).tail_counter_volatile();
        assert_eq!(tail_before, 1024);

        let result = dispatcher.claim_single_fragment(116, DEFAULT_STREAM_ID);
        assert!(matches!(
            result,
            Err(DispatchError::WouldBlock(BackpressureKind::PublisherLimit))
        ));
        assert_eq!(
            dispatcher.log_buffer().partition(0).tail_counter_volatile(),
            tail_before
        );
    }

    #[test]
    fn oversized_claim_fails_fast() {
        let dispatcher = Dispatcher::new(config()).expect("dispatcher");
        let result = dispatcher.claim_single_fragment(1020, DEFAULT_STREAM_ID);
        assert!(matches!(
            result,
            Err(DispatchError::FragmentTooLarge { .. })
        ));
        assert_eq!(dispatcher.log_buffer().partition(0).tail_counter_volatile(), 0);
    }

    #[test]
    fn batch_feasibility_boundary() {
        let dispatcher = Dispatcher::new(config()).expect("dispatcher");
        let max = dispatcher.max_fragment_length();
        assert!(!dispatcher.can_claim_fragment_batch(1, max));
        assert!(dispatcher.can_claim_fragment_batch(2, max / 2));
        assert!(!dispatcher.can_claim_fragment_batch(0, 8));
    }

    #[test]
    fn publisher_limit_tracks_slowest_subscriber() {
        let mut cfg = config();
        cfg.window_size = 512;
        cfg.max_fragment_length = 512;
        let dispatcher = Dispatcher::new(cfg).expect("dispatcher");
        let fast = dispatcher
            .open_subscription("fast", noop())
            .expect("subscription");
        let slow = dispatcher
            .open_subscription("slow", noop())
            .expect("subscription");

        fast.position_cell()
            .propose_max_ordered(Position::from_parts(0, 2048));
        slow.position_cell()
            .propose_max_ordered(Position::from_parts(0, 1024));

        assert!(dispatcher.update_publisher_limit());
        assert_eq!(
            dispatcher.publisher_limit(),
            Position::from_parts(0, 1024 + 512)
        );
    }

    #[test]
    fn publisher_limit_rolls_into_next_partition() {
        let mut cfg = config();
        cfg.window_size = 512;
        cfg.max_fragment_length = 512;
        let dispatcher = Dispatcher::new(cfg).expect("dispatcher");
        let subscription = dispatcher
            .open_subscription("reader", noop())
            .expect("subscription");
        subscription
            .position_cell()
            .propose_max_ordered(Position::from_parts(0, 3840));

        assert!(dispatcher.update_publisher_limit());
        assert_eq!(dispatcher.publisher_limit(), Position::from_parts(1, 512));
    }

    #[test]
    fn duplicate_subscription_name_rejected() {
        let dispatcher = Dispatcher::new(config()).expect("dispatcher");
        dispatcher
            .open_subscription("consumer", noop())
            .expect("first open");
        let result = dispatcher.open_subscription("consumer", noop());
        assert!(matches!(
            result,
            Err(DispatchError::SubscriptionExists(name)) if name == "consumer"
        ));
        assert!(dispatcher.subscription("consumer").is_some());
        assert_eq!(dispatcher.subscription_names().len(), 1);
    }

    #[test]
    fn rollover_writes_padding_and_activates_next_partition() {
        let dispatcher = Dispatcher::new(config()).expect("dispatcher");

        // seven 512-byte frames leave 512 bytes, which no further frame
        // may use without crossing the header reserve
        for _ in 0..7 {
            dispatcher
                .claim_single_fragment(500, DEFAULT_STREAM_ID)
                .expect("claim")
                .commit();
        }
        let result = dispatcher.claim_single_fragment(500, DEFAULT_STREAM_ID);
        assert!(matches!(
            result,
            Err(DispatchError::WouldBlock(BackpressureKind::PublisherLimit))
        ));
        assert_eq!(dispatcher.log_buffer().active_partition_id(), 1);
        assert_eq!(dispatcher.publisher_position(), Position::from_parts(1, 0));

        let data = dispatcher.log_buffer().partition(0).data_ptr();
        unsafe {
            assert_eq!(frame::frame_length_volatile(data, 3584), 512);
            assert_eq!(frame::frame_type(data, 3584), TYPE_PADDING);
        }

        assert!(dispatcher.update_publisher_limit());
        let claim = dispatcher
            .claim_single_fragment(500, DEFAULT_STREAM_ID)
            .expect("claim in fresh partition");
        claim.commit();
        assert_eq!(
            dispatcher.publisher_position(),
            Position::from_parts(1, 512)
        );
    }

    #[test]
    fn closed_dispatcher_rejects_claims() {
        let dispatcher = Dispatcher::new(config()).expect("dispatcher");
        dispatcher.close();
        assert!(dispatcher.is_closed());
        assert!(matches!(
            dispatcher.claim_single_fragment(8, DEFAULT_STREAM_ID),
            Err(DispatchError::InvalidState(_))
        ));
    }

    #[test]
    fn aligned_claims_keep_frame_alignment() {
        let dispatcher = Dispatcher::new(config()).expect("dispatcher");
        for payload in [1usize, 7, 8, 13] {
            let claim = dispatcher
                .claim_single_fragment(payload, DEFAULT_STREAM_ID)
                .expect("claim");
            claim.commit();
            let tail = dispatcher.log_buffer().partition(0).tail_counter_volatile();
            assert_eq!(tail as usize % FRAME_ALIGNMENT, 0);
        }
    }
}
