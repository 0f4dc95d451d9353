use std::fmt;

use crate::result::*;

pub(crate) mod chunk_heap;
pub use chunk_heap::{ChunkHeap, ChunkInfo, ChunkStatus};

/// Policy used to pick between multiple free chunks that can hold a request.
///
/// Ties are always resolved in favour of the chunk that comes first in enumeration order, which
/// keeps placement reproducible between heaps that saw the same sequence of operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// The first chunk that fits.
    #[default]
    FirstFit,
    /// The smallest chunk that fits.
    BestFit,
    /// The largest chunk that fits.
    WorstFit,
}

/// Index of a chunk inside a [`ChunkHeap`], stable until the chunk is deallocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkIndex(pub(crate) usize);

impl ChunkIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct AllocationReport {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two.
pub fn align_up(value: u64, alignment: u64) -> Result<u64> {
    if !alignment.is_power_of_two() {
        return Err(AllocationError::InvalidAlignment(alignment));
    }

    Ok(align_up_unchecked(value, alignment))
}

#[inline]
pub(crate) fn align_up_unchecked(value: u64, alignment: u64) -> u64 {
    (value + (alignment - 1)) & !(alignment - 1)
}

pub(crate) fn fmt_bytes(mut amount: u64) -> String {
    const SUFFIX: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut idx = 0;
    let mut print_amount = amount as f64;
    loop {
        if amount < 1024 || idx == SUFFIX.len() - 1 {
            return format!("{:.2} {}", print_amount, SUFFIX[idx]);
        }

        print_amount = amount as f64 / 1024.0;
        amount /= 1024;
        idx += 1;
    }
}
