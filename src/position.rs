use std::fmt::{self, Display};
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

/// Logical position in the partitioned log.
///
/// Positions encode both the partition generation and the byte offset
/// within that generation, enabling a single ordered comparison to
/// answer "who is further ahead".
///
/// # Encoding Format
///
/// ```text
/// |  32 bits   |  32 bits  |
/// | Generation | Offset    |
/// |------------|-----------|
/// | High bits  | Low bits  |
/// ```
///
/// The raw value `-1` is the unset sentinel and compares below every
/// valid position.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(pub i64);

impl Position {
    /// Sentinel for "no position yet".
    pub const UNSET: Position = Position(-1);

    /// Creates a position from a raw i64 value.
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the position as a raw i64.
    #[inline]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Creates a position from generation and in-partition byte offset.
    #[inline]
    pub const fn from_parts(generation: i32, offset: i32) -> Self {
        Self(((generation as i64) << 32) | (offset as u32 as i64))
    }

    /// Extracts the partition generation (high 32 bits).
    #[inline]
    pub const fn generation(self) -> i32 {
        (self.0 >> 32) as i32
    }

    /// Extracts the byte offset within the partition (low 32 bits).
    #[inline]
    pub const fn offset(self) -> i32 {
        self.0 as i32
    }

    /// True unless this is the unset sentinel.
    #[inline]
    pub const fn is_set(self) -> bool {
        self.0 >= 0
    }
}

impl From<i64> for Position {
    #[inline]
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Position> for i64 {
    #[inline]
    fn from(value: Position) -> Self {
        value.0
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "{}:{}", self.generation(), self.offset())
        } else {
            write!(f, "unset")
        }
    }
}

/// A single shared position cell.
///
/// Plain get/set plus a monotonic propose-if-greater update: the cell
/// only ever moves forward under `propose_max_ordered`, regardless of
/// how many threads race on it.
#[derive(Debug)]
pub struct AtomicPosition {
    cell: CachePadded<AtomicI64>,
}

impl AtomicPosition {
    pub fn new(initial: Position) -> Self {
        Self {
            cell: CachePadded::new(AtomicI64::new(initial.as_i64())),
        }
    }

    /// Creates the cell in the unset state.
    pub fn unset() -> Self {
        Self::new(Position::UNSET)
    }

    #[inline]
    pub fn get(&self) -> Position {
        Position::new(self.cell.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, position: Position) {
        self.cell.store(position.as_i64(), Ordering::Release);
    }

    /// Resets the cell to the unset sentinel.
    #[inline]
    pub fn reset(&self) {
        self.set(Position::UNSET);
    }

    /// Moves the cell forward to `candidate` if it compares greater than
    /// the current value. Returns true if the cell was updated.
    pub fn propose_max_ordered(&self, candidate: Position) -> bool {
        let proposed = candidate.as_i64();
        let mut current = self.cell.load(Ordering::Acquire);
        while current < proposed {
            match self.cell.compare_exchange(
                current,
                proposed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }
}
