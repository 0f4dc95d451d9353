#![deny(unsafe_code, clippy::unwrap_used)]


use log::{log, trace, Level};

use super::{
    align_up, align_up_unchecked, fmt_bytes, AllocationReport, AllocationStrategy, ChunkIndex,
};
use crate::stable_vec::StableVec;
use crate::{AllocationError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    Available,
    Occupied,
}

#[derive(Clone, Debug)]
struct Chunk<T> {
    status: ChunkStatus,
    actual_start: u64,
    aligned_start: u64,
    size: u64,
    metadata: T,
}

impl<T: Default> Chunk<T> {
    fn available(start: u64, size: u64, metadata: T) -> Self {
        Self {
            status: ChunkStatus::Available,
            actual_start: start,
            aligned_start: start,
            size,
            metadata,
        }
    }

    fn end(&self) -> u64 {
        self.actual_start + self.size
    }
}

/// Plain-data view of a chunk, as returned by [`ChunkHeap::chunks()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: ChunkIndex,
    pub status: ChunkStatus,
    /// First byte covered by the chunk, including alignment padding.
    pub actual_start: u64,
    /// First byte handed out to the user of the chunk.
    pub aligned_start: u64,
    /// Size including alignment padding.
    pub size: u64,
}

impl ChunkInfo {
    /// Bytes from [`Self::aligned_start`] to the end of the chunk.
    pub fn usable_size(&self) -> u64 {
        self.size - (self.aligned_start - self.actual_start)
    }
}

/// Offset based sub-allocator over the address range `[0, total_size)`.
///
/// Every byte of the range belongs to exactly one chunk. Each occupied chunk carries a piece of
/// caller-defined metadata `T`, which is reset to `T::default()` when the chunk is released.
/// Free neighbours are merged on every deallocation, so free space is never split into
/// adjacent chunks.
#[derive(Debug)]
pub struct ChunkHeap<T> {
    chunks: StableVec<Chunk<T>>,
    total_size: u64,
    allocated: u64,
}

impl<T: Default> ChunkHeap<T> {
    pub fn new(size: u64) -> Self {
        Self::with_metadata(size, T::default())
    }

    /// Creates a heap whose initial free chunk carries `metadata`.
    pub fn with_metadata(size: u64, metadata: T) -> Self {
        let mut chunks = StableVec::new();
        chunks.push(Chunk::available(0, size, metadata));

        Self {
            chunks,
            total_size: size,
            allocated: 0,
        }
    }

    /// Carves `size` bytes aligned to `alignment` out of a free chunk picked by `strategy`.
    ///
    /// Returns `Ok(None)` when no free chunk is large enough; the heap is left untouched in that
    /// case and the caller decides whether to [`Self::add_chunk()`] or give up.
    pub fn allocate_chunk(
        &mut self,
        size: u64,
        strategy: AllocationStrategy,
        alignment: u64,
    ) -> Result<Option<ChunkIndex>> {
        // Validates the alignment once for the whole search.
        align_up(0, alignment)?;

        if size == 0 {
            return Err(AllocationError::ZeroSizedAllocation);
        }

        let Some(index) = self.find_available_chunk(size, strategy, alignment) else {
            trace!(
                "no free chunk for {} bytes aligned to {} ({:?})",
                size,
                alignment,
                strategy
            );
            return Ok(None);
        };

        self.split_chunk(index, size, alignment);

        Ok(Some(ChunkIndex(index)))
    }

    /// Releases an occupied chunk and merges it with any free neighbours.
    pub fn deallocate_chunk(&mut self, index: ChunkIndex) -> Result<()> {
        let chunk = self
            .chunks
            .get_mut(index.0)
            .filter(|chunk| chunk.status == ChunkStatus::Occupied)
            .ok_or(AllocationError::InvalidResourceIndex(index.0))?;

        chunk.status = ChunkStatus::Available;
        chunk.aligned_start = chunk.actual_start;
        chunk.metadata = T::default();
        self.allocated -= chunk.size;

        self.combine_adjacent_chunks(index.0);

        Ok(())
    }

    /// Grows the heap by appending a free chunk of `size` bytes at the current end.
    ///
    /// With `combine` set the new chunk is merged with a free chunk ending at the old boundary.
    pub fn add_chunk(&mut self, size: u64, combine: bool) -> ChunkIndex {
        let index = self
            .chunks
            .push(Chunk::available(self.total_size, size, T::default()));
        self.total_size += size;

        if combine {
            ChunkIndex(self.combine_adjacent_chunks(index))
        } else {
            ChunkIndex(index)
        }
    }

    /// Deallocates every occupied chunk whose metadata matches `predicate`.
    ///
    /// Returns the number of evicted chunks.
    pub fn remove_if(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Result<usize> {
        let evicted = self
            .chunks
            .iter()
            .filter(|(_, chunk)| {
                chunk.status == ChunkStatus::Occupied && predicate(&chunk.metadata)
            })
            .map(|(index, _)| ChunkIndex(index))
            .collect::<Vec<_>>();

        // Merging only ever removes free chunks, so the collected indices stay valid.
        for &index in &evicted {
            self.deallocate_chunk(index)?;
        }

        Ok(evicted.len())
    }

    /// Drops every chunk and starts over with a single free chunk.
    ///
    /// The heap keeps its current size unless `new_size` is given.
    pub fn clear_heap(&mut self, new_size: Option<u64>) {
        self.chunks.clear();
        self.total_size = new_size.unwrap_or(self.total_size);
        self.allocated = 0;
        self.chunks
            .push(Chunk::available(0, self.total_size, T::default()));
    }

    fn find_available_chunk(
        &self,
        size: u64,
        strategy: AllocationStrategy,
        alignment: u64,
    ) -> Option<usize> {
        let mut candidates = self
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.status == ChunkStatus::Available)
            .filter(|(_, chunk)| {
                let aligned_start = align_up_unchecked(chunk.actual_start, alignment);
                let padding = aligned_start - chunk.actual_start;
                chunk.size >= padding && chunk.size - padding >= size
            });

        let mut best: Option<(usize, u64)> = None;
        match strategy {
            AllocationStrategy::FirstFit => {
                best = candidates.next().map(|(index, chunk)| (index, chunk.size));
            }
            AllocationStrategy::BestFit => {
                for (index, chunk) in candidates {
                    if best.map_or(true, |(_, best_size)| chunk.size < best_size) {
                        best = Some((index, chunk.size));
                    }
                }
            }
            AllocationStrategy::WorstFit => {
                for (index, chunk) in candidates {
                    if best.map_or(true, |(_, best_size)| chunk.size > best_size) {
                        best = Some((index, chunk.size));
                    }
                }
            }
        }

        best.map(|(index, _)| index)
    }

    fn split_chunk(&mut self, index: usize, size: u64, alignment: u64) {
        let chunk = &mut self.chunks[index];
        let aligned_start = align_up_unchecked(chunk.actual_start, alignment);
        let used = aligned_start - chunk.actual_start + size;
        let remainder = chunk.size - used;

        chunk.status = ChunkStatus::Occupied;
        chunk.aligned_start = aligned_start;
        chunk.size = used;
        chunk.metadata = T::default();
        self.allocated += used;

        if remainder > 0 {
            self.chunks
                .push(Chunk::available(aligned_start + size, remainder, T::default()));
        }
    }

    /// Merges the free chunk at `index` with free neighbours on either edge, repeating until no
    /// neighbour is left. Returns the index of the surviving chunk.
    fn combine_adjacent_chunks(&mut self, mut index: usize) -> usize {
        loop {
            let (start, end) = {
                let chunk = &self.chunks[index];
                (chunk.actual_start, chunk.end())
            };

            let neighbour = self.chunks.iter().find_map(|(other, chunk)| {
                let adjacent = chunk.actual_start == end || chunk.end() == start;
                (other != index && chunk.status == ChunkStatus::Available && adjacent)
                    .then_some((other, chunk.actual_start == end))
            });

            let Some((other, follows)) = neighbour else {
                return index;
            };

            let (first, second) = if follows {
                (index, other)
            } else {
                (other, index)
            };

            let Some(removed) = self.chunks.remove(second) else {
                return index;
            };
            self.chunks[first].size += removed.size;
            index = first;
        }
    }
}

impl<T> ChunkHeap<T> {
    /// Metadata of an active chunk.
    pub fn metadata(&self, index: ChunkIndex) -> Result<&T> {
        self.chunks
            .get(index.0)
            .map(|chunk| &chunk.metadata)
            .ok_or(AllocationError::InvalidResourceIndex(index.0))
    }

    pub fn metadata_mut(&mut self, index: ChunkIndex) -> Result<&mut T> {
        self.chunks
            .get_mut(index.0)
            .map(|chunk| &mut chunk.metadata)
            .ok_or(AllocationError::InvalidResourceIndex(index.0))
    }

    /// Aligned offset at which the data of the chunk starts.
    pub fn start_of_chunk(&self, index: ChunkIndex) -> Result<u64> {
        self.chunks
            .get(index.0)
            .map(|chunk| chunk.aligned_start)
            .ok_or(AllocationError::InvalidResourceIndex(index.0))
    }

    pub fn is_occupied(&self, index: ChunkIndex) -> bool {
        self.chunks
            .get(index.0)
            .is_some_and(|chunk| chunk.status == ChunkStatus::Occupied)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes covered by occupied chunks, alignment padding included.
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn available_memory(&self) -> u64 {
        self.total_size - self.allocated
    }

    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// All chunks in enumeration order.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkInfo> + '_ {
        self.chunks.iter().map(|(index, chunk)| ChunkInfo {
            index: ChunkIndex(index),
            status: chunk.status,
            actual_start: chunk.actual_start,
            aligned_start: chunk.aligned_start,
            size: chunk.size,
        })
    }

    /// Occupied chunks together with their metadata.
    pub fn occupied(&self) -> impl Iterator<Item = (ChunkInfo, &T)> + '_ {
        self.chunks
            .iter()
            .filter(|(_, chunk)| chunk.status == ChunkStatus::Occupied)
            .map(|(index, chunk)| {
                (
                    ChunkInfo {
                        index: ChunkIndex(index),
                        status: chunk.status,
                        actual_start: chunk.actual_start,
                        aligned_start: chunk.aligned_start,
                        size: chunk.size,
                    },
                    &chunk.metadata,
                )
            })
    }

    /// Describes every occupied chunk for which `name_of` produces a name.
    pub fn report_allocations(
        &self,
        mut name_of: impl FnMut(&T) -> Option<String>,
    ) -> Vec<AllocationReport> {
        self.occupied()
            .filter_map(|(info, metadata)| {
                Some(AllocationReport {
                    name: name_of(metadata)?,
                    offset: info.aligned_start,
                    size: info.usable_size(),
                })
            })
            .collect()
    }
}

impl<T: std::fmt::Debug> ChunkHeap<T> {
    pub fn report_memory_leaks(&self, log_level: Level, heap_name: &str) {
        for (info, metadata) in self.occupied() {
            log!(
                log_level,
                r#"leak detected: {{
    heap: {}
    chunk: {{
        chunk_index: {},
        size: 0x{:x} ({}),
        offset: 0x{:x},
        metadata: {:?}
    }}
}}"#,
                heap_name,
                info.index,
                info.usable_size(),
                fmt_bytes(info.usable_size()),
                info.aligned_start,
                metadata,
            );
        }
    }
}
