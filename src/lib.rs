//! Partitioned in-memory transport moving opaque byte payloads from one
//! producer to many independently progressing consumers.
//!
//! The crate wires together a fixed set of recycled log partitions, a
//! two-phase claim/commit publishing protocol, and per-subscription
//! cursors with window-based back-pressure. Nothing blocks: claims
//! return a would-block error when the window is exhausted, reads return
//! zero when no committed data is available, and an external scheduler
//! decides when to retry.

pub mod claim;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod log_buffer;
pub mod partition;
pub mod position;
pub mod subscription;

pub use claim::{ClaimedFragment, ClaimedFragmentBatch};
pub use config::DispatchConfig;
pub use dispatcher::{Dispatcher, DEFAULT_STREAM_ID};
pub use error::{BackpressureKind, DispatchError, DispatchResult};
pub use frame::{FLAG_BATCH_BEGIN, FLAG_BATCH_END, FLAG_FAILED, FRAME_ALIGNMENT, HEADER_LENGTH};
pub use log_buffer::LogBuffer;
pub use partition::Partition;
pub use position::{AtomicPosition, Position};
pub use subscription::{BlockPeek, ConsumerCondition, FragmentHandler, Subscription};
