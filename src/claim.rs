use std::slice;
use std::sync::Arc;

use crate::error::{DispatchError, DispatchResult};
use crate::frame::{
    self, aligned_length, framed_length, message_length, FLAG_BATCH_BEGIN, FLAG_BATCH_END,
    TYPE_PADDING,
};
use crate::log_buffer::LogBuffer;

/// A claimed single-fragment window, pending commit.
///
/// The producer fills [`payload_mut`](Self::payload_mut) and then calls
/// exactly one of [`commit`](Self::commit) or [`abort`](Self::abort).
/// Dropping the handle without either leaves the frame permanently
/// unreadable and will eventually stall every subscription behind it.
#[must_use = "call commit() or abort() to resolve the claimed fragment"]
pub struct ClaimedFragment {
    log: Arc<LogBuffer>,
    generation: i32,
    frame_offset: usize,
    framed_length: usize,
    position: i64,
    completed: bool,
}

impl ClaimedFragment {
    pub(crate) fn new(
        log: Arc<LogBuffer>,
        generation: i32,
        frame_offset: usize,
        framed_length: usize,
        position: i64,
    ) -> Self {
        Self {
            log,
            generation,
            frame_offset,
            framed_length,
            position,
            completed: false,
        }
    }

    /// Fragment sequence number assigned by the claim.
    #[inline]
    pub fn position(&self) -> i64 {
        self.position
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        message_length(self.framed_length)
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        self.log.partition(self.generation).data_ptr()
    }

    /// Writable window for the payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = frame::payload_offset(self.frame_offset);
        unsafe { slice::from_raw_parts_mut(self.data_ptr().add(start), self.payload_len()) }
    }

    /// Publishes the fragment: flips the length field positive, making
    /// the frame visible to every subscription.
    pub fn commit(mut self) {
        unsafe {
            frame::set_frame_length_ordered(
                self.data_ptr(),
                self.frame_offset,
                self.framed_length as i32,
            );
        }
        self.completed = true;
    }

    /// Gives the claimed window up: rewrites the frame as committed
    /// padding so readers skip it without delivering anything.
    pub fn abort(mut self) {
        unsafe {
            let data = self.data_ptr();
            frame::set_frame_type(data, self.frame_offset, TYPE_PADDING);
            frame::set_flags(data, self.frame_offset, 0);
            frame::set_frame_length_ordered(data, self.frame_offset, self.framed_length as i32);
        }
        self.completed = true;
    }
}

impl Drop for ClaimedFragment {
    fn drop(&mut self) {
        debug_assert!(
            self.completed,
            "claimed fragment dropped without commit or abort"
        );
    }
}

/// A claimed run of consecutive fragment windows, pending commit.
///
/// Fragments are appended with [`next_fragment`](Self::next_fragment);
/// commit makes the whole run visible atomically: a scanner either sees
/// no fragment of the batch or all of them.
#[must_use = "call commit() or abort() to resolve the claimed batch"]
pub struct ClaimedFragmentBatch {
    log: Arc<LogBuffer>,
    generation: i32,
    first_offset: usize,
    claimed_length: usize,
    next_offset: usize,
    last_offset: usize,
    fragment_count: usize,
    fragments_written: usize,
    position: i64,
    completed: bool,
}

impl ClaimedFragmentBatch {
    pub(crate) fn new(
        log: Arc<LogBuffer>,
        generation: i32,
        first_offset: usize,
        claimed_length: usize,
        fragment_count: usize,
        position: i64,
    ) -> Self {
        Self {
            log,
            generation,
            first_offset,
            claimed_length,
            next_offset: first_offset,
            last_offset: first_offset,
            fragment_count,
            fragments_written: 0,
            position,
            completed: false,
        }
    }

    /// Fragment sequence number of the first fragment in the batch.
    #[inline]
    pub fn position(&self) -> i64 {
        self.position
    }

    #[inline]
    pub fn fragments_written(&self) -> usize {
        self.fragments_written
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        self.log.partition(self.generation).data_ptr()
    }

    #[inline]
    fn reservation_end(&self) -> usize {
        self.first_offset + self.claimed_length
    }

    /// Opens the next fragment window in the batch and returns its
    /// writable payload slice.
    pub fn next_fragment(
        &mut self,
        payload_length: usize,
        stream_id: i32,
    ) -> DispatchResult<&mut [u8]> {
        if self.fragments_written == self.fragment_count {
            return Err(DispatchError::invalid_state(
                "batch fragment count exhausted",
            ));
        }
        let framed = framed_length(payload_length);
        let aligned = aligned_length(framed);
        if self.next_offset + aligned > self.reservation_end() {
            return Err(DispatchError::invalid_state(
                "batch reservation exhausted",
            ));
        }

        let frame_offset = self.next_offset;
        let flags = if self.fragments_written == 0 {
            FLAG_BATCH_BEGIN
        } else {
            0
        };
        unsafe {
            let data = self.data_ptr();
            frame::set_frame_length_relaxed(data, frame_offset, -(framed as i32));
            frame::set_frame_type(data, frame_offset, frame::TYPE_MESSAGE);
            frame::set_flags(data, frame_offset, flags);
            frame::set_stream_id(data, frame_offset, stream_id);
        }

        self.last_offset = frame_offset;
        self.next_offset = frame_offset + aligned;
        self.fragments_written += 1;

        let start = frame::payload_offset(frame_offset);
        Ok(unsafe {
            slice::from_raw_parts_mut(self.data_ptr().add(start), message_length(framed))
        })
    }

    /// Publishes every fragment of the batch at once.
    ///
    /// The unused remainder of the reservation is committed as padding.
    /// All non-first frames are finalized before the first frame's
    /// length is released, so a forward scanner observes the batch
    /// all-or-nothing.
    pub fn commit(mut self) {
        if self.fragments_written == 0 {
            return self.abort();
        }
        let data = self.data_ptr();
        unsafe {
            frame::raise_flags(data, self.last_offset, FLAG_BATCH_END);

            let leftover = self.reservation_end() - self.next_offset;
            if leftover > 0 {
                frame::set_frame_type(data, self.next_offset, TYPE_PADDING);
                frame::set_flags(data, self.next_offset, 0);
                frame::set_frame_length_relaxed(data, self.next_offset, leftover as i32);
            }

            let first_framed = -frame::frame_length_volatile(data, self.first_offset);
            debug_assert!(first_framed > 0, "first batch frame already published");

            let mut offset = self.first_offset + aligned_length(first_framed as usize);
            while offset < self.next_offset {
                let framed = -frame::frame_length_volatile(data, offset);
                debug_assert!(framed > 0, "batch frame already published");
                frame::set_frame_length_relaxed(data, offset, framed);
                offset += aligned_length(framed as usize);
            }

            frame::set_frame_length_ordered(data, self.first_offset, first_framed);
        }
        self.completed = true;
    }

    /// Gives the whole reservation up as one committed padding frame.
    pub fn abort(mut self) {
        unsafe {
            let data = self.data_ptr();
            frame::set_frame_type(data, self.first_offset, TYPE_PADDING);
            frame::set_flags(data, self.first_offset, 0);
            frame::set_frame_length_ordered(data, self.first_offset, self.claimed_length as i32);
        }
        self.completed = true;
    }
}

impl Drop for ClaimedFragmentBatch {
    fn drop(&mut self) {
        debug_assert!(
            self.completed,
            "claimed batch dropped without commit or abort"
        );
    }
}
