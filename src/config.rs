use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};
use crate::frame::{FRAME_ALIGNMENT, HEADER_LENGTH};

/// Minimum allowed partition size (4 KiB).
const PARTITION_SIZE_MIN_LIMIT: usize = 4 * 1024;

/// Maximum allowed partition size (1 GiB).
///
/// In-partition offsets are carried in the low 32 bits of a position,
/// so the partition size must stay well inside the i32 range.
const PARTITION_SIZE_MAX_LIMIT: usize = 1 << 30;

/// Default partition size.
const DEFAULT_PARTITION_SIZE: usize = 512 * 1024;

/// Default number of partitions.
///
/// Three is the minimum that lets the producer prepare a recycled
/// partition ahead of itself without zeroing one a reader may still
/// be draining.
const DEFAULT_PARTITION_COUNT: usize = 3;

/// Computes the largest power of two that is less than or equal to the
/// input value.
#[inline]
fn floor_power_of_two(value: usize) -> usize {
    if value == 0 {
        0
    } else {
        let shift = usize::BITS - 1 - value.leading_zeros();
        1usize << shift
    }
}

/// Clamps a value to the given range and rounds to the nearest power of
/// two.
#[inline]
fn clamp_power_of_two(value: usize, min: usize, max: usize) -> usize {
    let clamped = value.clamp(min, max);
    if clamped.is_power_of_two() {
        return clamped;
    }

    let lower = floor_power_of_two(clamped).max(min);
    let upper = (lower << 1).min(max).max(min);

    if clamped - lower <= upper.saturating_sub(clamped) {
        lower
    } else {
        upper
    }
}

/// Construction parameters of a dispatcher.
///
/// The window size bounds how far the producer may run ahead of the
/// slowest subscription; the max fragment length bounds what a single
/// claim may carry and is the admission unit for batch feasibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of partitions in the backing buffer.
    pub partition_count: usize,
    /// Byte size of each partition. Must be a power of two.
    pub partition_size: usize,
    /// Look-ahead window granted past the slowest subscriber, in bytes.
    pub window_size: usize,
    /// Largest framed length a single claim (or batch reservation) may
    /// occupy.
    pub max_fragment_length: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::with_partition_size(DEFAULT_PARTITION_SIZE)
    }
}

impl DispatchConfig {
    /// Derives a config from a partition size using the conventional
    /// ratios: a quarter-partition window and a sixteenth-partition max
    /// fragment length.
    pub fn with_partition_size(partition_size: usize) -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            partition_size,
            window_size: partition_size / 4,
            max_fragment_length: partition_size / 16,
        }
    }

    /// Returns a copy with the partition size clamped and rounded to a
    /// power of two within the supported bounds, and the dependent sizes
    /// re-derived when they no longer fit the adjusted partition.
    pub fn normalized(&self) -> Self {
        let partition_size = clamp_power_of_two(
            self.partition_size,
            PARTITION_SIZE_MIN_LIMIT,
            PARTITION_SIZE_MAX_LIMIT,
        );
        let mut normalized = self.clone();
        normalized.partition_count = self.partition_count.max(DEFAULT_PARTITION_COUNT);
        normalized.partition_size = partition_size;
        if normalized.window_size == 0 || normalized.window_size > partition_size {
            normalized.window_size = partition_size / 4;
        }
        if normalized.max_fragment_length == 0
            || normalized.max_fragment_length > normalized.window_size
        {
            normalized.max_fragment_length = partition_size / 16;
        }
        normalized
    }

    /// Validates the configuration for use by [`crate::Dispatcher::new`].
    pub fn validate(&self) -> DispatchResult<()> {
        if self.partition_count < DEFAULT_PARTITION_COUNT {
            return Err(DispatchError::invalid_config(format!(
                "partition_count must be at least {DEFAULT_PARTITION_COUNT}"
            )));
        }
        if !self.partition_size.is_power_of_two() {
            return Err(DispatchError::invalid_config(
                "partition_size must be a power of two",
            ));
        }
        if self.partition_size < PARTITION_SIZE_MIN_LIMIT
            || self.partition_size > PARTITION_SIZE_MAX_LIMIT
        {
            return Err(DispatchError::invalid_config(format!(
                "partition_size must lie within [{PARTITION_SIZE_MIN_LIMIT}, {PARTITION_SIZE_MAX_LIMIT}]"
            )));
        }
        if self.window_size == 0 || self.window_size > self.partition_size {
            return Err(DispatchError::invalid_config(
                "window_size must be positive and no larger than partition_size",
            ));
        }
        if self.max_fragment_length < HEADER_LENGTH + FRAME_ALIGNMENT {
            return Err(DispatchError::invalid_config(
                "max_fragment_length leaves no room for a framed payload",
            ));
        }
        if self.max_fragment_length > self.window_size {
            return Err(DispatchError::invalid_config(
                "max_fragment_length must not exceed window_size",
            ));
        }
        if self.max_fragment_length > self.partition_size - HEADER_LENGTH {
            return Err(DispatchError::invalid_config(
                "max_fragment_length must leave room for end-of-partition padding",
            ));
        }
        Ok(())
    }
}
