//! CPU-side staging of per-resource update data.
//!
//! Every registered resource owns a contiguous byte range in one arena. Ranges are kept sorted
//! and packed back to back, so a resize shifts all later ranges with one bulk move and the arena
//! never has holes.

#![deny(clippy::unimplemented, clippy::unwrap_used, clippy::ok_expect)]

use std::ops::Range;

use log::{error, trace};

use crate::frame::{FrameRing, HeapCollection, ResourceFactory, ResourceIndex};
use crate::{AllocationError, Result};

mod slab;
pub use slab::MappedSlab;


/// How the data of a resource reaches the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdatePolicy {
    /// Data is uploaded once when the resource is registered, nothing is staged afterwards.
    InitializeOnly,
    /// The destination memory stays mapped and writes go straight to it.
    PersistentMapped,
    /// Writes are staged in the arena and copied to the device once per frame.
    CopyUpdate,
}

#[derive(Clone, Copy, Debug)]
pub struct StagingStoreCreateDesc {
    pub policy: UpdatePolicy,
    /// Number of frames in flight; every write has to reach each frame's copy of the resource.
    pub frames: usize,
    /// Upper bound for the arena, normally the size of the heap the resources live in.
    pub capacity: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateHeader {
    pub start_offset: u64,
    pub data_size: u64,
    pub resource_index: ResourceIndex,
    /// Number of flushes that still have to transfer this header's data.
    pub frames_left: usize,
}

impl UpdateHeader {
    fn range(&self) -> Range<usize> {
        self.start_offset as usize..(self.start_offset + self.data_size) as usize
    }
}

/// One transfer produced by [`UpdateStagingStore::flush_pending()`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTransfer {
    pub resource_index: ResourceIndex,
    /// Range of the data inside [`UpdateStagingStore::data()`].
    pub range: Range<usize>,
}

/// Device side of an upload.
pub trait Uploader<H> {
    /// Copies `bytes` into `destination` starting at `offset`.
    fn transfer(&mut self, destination: &H, offset: u64, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug)]
pub struct UpdateStagingStore {
    policy: UpdatePolicy,
    frames: usize,
    capacity: u64,
    headers: Vec<UpdateHeader>,
    data: Vec<u8>,
}

impl UpdateStagingStore {
    pub fn new(desc: &StagingStoreCreateDesc) -> Result<Self> {
        // Only validates the frame count.
        FrameRing::new(desc.frames)?;

        Ok(Self {
            policy: desc.policy,
            frames: desc.frames,
            capacity: desc.capacity,
            headers: Vec::new(),
            data: Vec::new(),
        })
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    /// Bytes of the arena currently in use.
    pub fn used_size(&self) -> u64 {
        self.headers
            .last()
            .map_or(0, |header| header.start_offset + header.data_size)
    }

    pub fn headers(&self) -> &[UpdateHeader] {
        &self.headers
    }

    pub fn header(&self, index: ResourceIndex) -> Option<&UpdateHeader> {
        self.position(index).map(|position| &self.headers[position])
    }

    /// Staged bytes, addressed by [`PendingTransfer::range`].
    pub fn data(&self, range: Range<usize>) -> &[u8] {
        &self.data[range]
    }

    /// Registers `index` with `size` bytes of update data.
    ///
    /// Registering an index again with a different size resizes its range in place. `initial`
    /// must be exactly `size` bytes long and is scheduled for upload to every frame's copy.
    pub fn register_resource(
        &mut self,
        index: ResourceIndex,
        size: u64,
        initial: Option<&[u8]>,
    ) -> Result<()> {
        if let Some(initial) = initial {
            if initial.len() as u64 != size {
                return Err(AllocationError::SizeMismatch {
                    expected: size,
                    actual: initial.len() as u64,
                });
            }
        }

        let signed_size = i64::try_from(size).map_err(|_| AllocationError::StagingFull {
            requested: size,
            available: self.available(),
        })?;

        let position = match self.position(index) {
            Some(position) => {
                let old_size = self.headers[position].data_size;
                let delta = signed_size - old_size as i64;
                if delta != 0 {
                    self.reserve(delta)?;
                    self.update_existing_headers(position, delta);
                    self.headers[position].data_size = size;
                }
                if delta > 0 && self.policy != UpdatePolicy::PersistentMapped {
                    // The grown tail still holds bytes of the resources that were moved away.
                    let header = &self.headers[position];
                    let grown = (header.start_offset + old_size) as usize
                        ..(header.start_offset + header.data_size) as usize;
                    self.data[grown].fill(0);
                }
                position
            }
            None => {
                self.reserve(signed_size)?;
                self.headers.push(UpdateHeader {
                    start_offset: self.used_size(),
                    data_size: size,
                    resource_index: index,
                    frames_left: 0,
                });
                self.headers.len() - 1
            }
        };

        trace!(
            "registered resource {} with {} bytes of update data at offset {}",
            index,
            size,
            self.headers[position].start_offset
        );

        // Persistent-mapped resources are written in place, only their size is tracked.
        if self.policy == UpdatePolicy::PersistentMapped {
            return Ok(());
        }

        let header = &mut self.headers[position];
        let range = header.range();
        match initial {
            Some(initial) => {
                self.data[range].copy_from_slice(initial);
                header.frames_left = self.frames;
            }
            None if self.policy == UpdatePolicy::InitializeOnly => header.frames_left = 0,
            None => {}
        }

        Ok(())
    }

    /// Forgets `index` and closes the gap its data left behind.
    pub fn unregister(&mut self, index: ResourceIndex) -> Result<()> {
        let position = self
            .position(index)
            .ok_or(AllocationError::InvalidResourceIndex(index.index()))?;

        let delta = -(self.headers[position].data_size as i64);
        self.update_existing_headers(position, delta);
        self.headers.remove(position);
        self.reserve(delta)?;

        Ok(())
    }

    /// Stages new data for `index`, to be copied to each frame's copy by the next flushes.
    pub fn write(&mut self, index: ResourceIndex, bytes: &[u8]) -> Result<()> {
        if self.policy != UpdatePolicy::CopyUpdate {
            return Err(AllocationError::InvalidUpdatePolicy {
                policy: self.policy,
                operation: "write",
            });
        }

        let frames = self.frames;
        let header = self.checked_header(index, bytes.len())?;
        header.frames_left = frames;
        let range = header.range();
        self.data[range].copy_from_slice(bytes);

        Ok(())
    }

    /// Writes `bytes` for `index` directly into the persistently mapped destination.
    ///
    /// `mapped` is the CPU view of the memory backing the resource.
    pub fn write_mapped(
        &mut self,
        index: ResourceIndex,
        bytes: &[u8],
        mapped: &mut [u8],
    ) -> Result<()> {
        if self.policy != UpdatePolicy::PersistentMapped {
            return Err(AllocationError::InvalidUpdatePolicy {
                policy: self.policy,
                operation: "write_mapped",
            });
        }

        self.checked_header(index, bytes.len())?;

        let mut slab = MappedSlab::new(mapped);
        presser::copy_from_slice_to_offset(bytes, &mut slab, 0)
            .map_err(|e| AllocationError::FailedToMap(format!("{:?}", e)))?;

        Ok(())
    }

    /// Collects every range that still has to be copied to the active frame's resources into
    /// `scratch`, and counts those ranges down by one frame.
    ///
    /// `scratch` is cleared first. The returned ranges stay valid until the next mutation of the
    /// store. Initialize-only data that every frame has already received is dropped from the
    /// arena on the following flush. Returns the number of transfers.
    pub fn flush_pending(&mut self, scratch: &mut Vec<PendingTransfer>) -> usize {
        scratch.clear();

        match self.policy {
            UpdatePolicy::PersistentMapped => return 0,
            UpdatePolicy::InitializeOnly => self.drop_uploaded_data(),
            UpdatePolicy::CopyUpdate => {}
        }

        for header in self.headers.iter_mut().filter(|h| h.frames_left > 0) {
            scratch.push(PendingTransfer {
                resource_index: header.resource_index,
                range: header.range(),
            });
            header.frames_left -= 1;
        }

        scratch.len()
    }

    /// Puts `transfers` returned by [`Self::flush_pending()`] back, so the next flush produces them
    /// again. Used when they could not be delivered.
    pub fn requeue(&mut self, transfers: &[PendingTransfer]) {
        for transfer in transfers {
            if let Some(position) = self.position(transfer.resource_index) {
                let header = &mut self.headers[position];
                header.frames_left = (header.frames_left + 1).min(self.frames);
            }
        }
    }

    /// Returns `true` when the next [`Self::flush_pending()`] would produce transfers.
    pub fn has_pending(&self) -> bool {
        self.headers.iter().any(|header| header.frames_left > 0)
    }

    /// Shrinks every fully uploaded header to zero bytes. The headers stay registered so a later
    /// [`Self::register_resource()`] can hand them new data.
    fn drop_uploaded_data(&mut self) {
        for position in 0..self.headers.len() {
            let header = &self.headers[position];
            if header.frames_left > 0 || header.data_size == 0 {
                continue;
            }

            trace!(
                "dropping {} bytes of uploaded initial data of resource {}",
                header.data_size,
                header.resource_index
            );
            let delta = -(header.data_size as i64);
            self.update_existing_headers(position, delta);
            self.headers[position].data_size = 0;
        }
    }

    /// Bytes the arena may still grow by.
    fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.data.len() as u64)
    }

    fn position(&self, index: ResourceIndex) -> Option<usize> {
        self.headers
            .iter()
            .position(|header| header.resource_index == index)
    }

    fn checked_header(&mut self, index: ResourceIndex, len: usize) -> Result<&mut UpdateHeader> {
        let position = self
            .position(index)
            .ok_or(AllocationError::InvalidResourceIndex(index.index()))?;
        let header = &mut self.headers[position];
        if header.data_size != len as u64 {
            return Err(AllocationError::SizeMismatch {
                expected: header.data_size,
                actual: len as u64,
            });
        }

        Ok(header)
    }

    /// Grows or shrinks the arena by `delta` bytes, rejecting growth past the capacity.
    fn reserve(&mut self, delta: i64) -> Result<()> {
        if self.policy == UpdatePolicy::PersistentMapped {
            return Ok(());
        }

        if delta > 0 {
            let requested = delta as u64;
            let available = self.available();
            let full = || AllocationError::StagingFull {
                requested,
                available,
            };
            if requested > available {
                return Err(full());
            }

            // The capacity is only a limit, the arena grows on demand.
            let new_len =
                usize::try_from(self.data.len() as u64 + requested).map_err(|_| full())?;
            self.data
                .try_reserve(new_len - self.data.len())
                .map_err(|_| full())?;
            self.data.resize(new_len, 0);
        }

        Ok(())
    }

    /// Shifts every header after `position` by `delta` bytes and moves their data along in one
    /// go. A positive delta expects the arena to have been grown already; a negative one
    /// truncates the arena afterwards.
    fn update_existing_headers(&mut self, position: usize, delta: i64) {
        let changed = &self.headers[position];
        let tail_start = (changed.start_offset + changed.data_size) as usize;
        let tail_len = self.headers[position + 1..]
            .iter()
            .map(|header| header.data_size as usize)
            .sum::<usize>();

        for header in &mut self.headers[position + 1..] {
            header.start_offset = header.start_offset.wrapping_add_signed(delta);
        }

        if self.policy == UpdatePolicy::PersistentMapped {
            return;
        }

        let destination = (tail_start as i64 + delta) as usize;
        self.data
            .copy_within(tail_start..tail_start + tail_len, destination);

        if delta < 0 {
            let used = (self.data.len() as i64 + delta) as usize;
            self.data.truncate(used);
        }
    }
}

/// Uploads everything pending for the active frame slot of `collection` through `uploader`.
///
/// Transfers whose resource no longer exists in `collection` are skipped. The first failing
/// transfer aborts the upload and is returned; it and every transfer after it are requeued.
pub fn upload_pending<F, U>(
    store: &mut UpdateStagingStore,
    collection: &HeapCollection<F>,
    uploader: &mut U,
    scratch: &mut Vec<PendingTransfer>,
) -> Result<usize>
where
    F: ResourceFactory,
    U: Uploader<F::Handle>,
{
    store.flush_pending(scratch);

    let mut uploaded = 0;
    for (position, transfer) in scratch.iter().enumerate() {
        let Some(placement) = collection.placement(transfer.resource_index) else {
            trace!(
                "skipping transfer for resource {} that is not live in this frame",
                transfer.resource_index
            );
            continue;
        };

        let bytes = store.data(transfer.range.clone());
        if let Err(err) = uploader.transfer(placement.handle, placement.offset, bytes) {
            error!(
                "transfer of {} bytes to resource {} failed: {}",
                bytes.len(),
                transfer.resource_index,
                err
            );
            // The failed transfer and everything after it stay pending for this frame.
            store.requeue(&scratch[position..]);
            return Err(err);
        }
        uploaded += 1;
    }

    Ok(uploaded)
}
