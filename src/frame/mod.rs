//! Frame-pipelined resource lifetimes.
//!
//! The GPU may still be executing work for up to `frames - 1` earlier frames while the CPU
//! records the current one. Every resource therefore exists once per frame in flight, in a
//! separate [`FrameCollection`] per frame slot, and creation or removal is applied to one slot
//! at a time as the frame ring reaches it. A slot only becomes active once the caller has seen
//! its fence retire (see [`FrameLifetimePipeline::can_advance()`]), so a removal never frees
//! memory the GPU can still read.

#![deny(clippy::unimplemented, clippy::unwrap_used, clippy::ok_expect)]

use std::collections::VecDeque;
use std::fmt;

use log::{error, trace};

use crate::allocator::ChunkIndex;
use crate::{AllocationError, Result};

mod heap_collection;
pub use heap_collection::{
    HeapCollection, HeapCollectionCreateDesc, Placement, PlacedResourceDesc, ResourceDesc,
    ResourceFactory,
};


/// Handle to a resource inside one frame-local collection.
///
/// The same logical resource ends up at the same index in every frame slot, because every slot
/// replays the same operations in the same order, but a handle should only be dereferenced
/// against the collection of the frame it is used in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIndex(pub(crate) usize);

impl ResourceIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

impl From<ChunkIndex> for ResourceIndex {
    fn from(chunk: ChunkIndex) -> Self {
        Self(chunk.0)
    }
}

impl From<ResourceIndex> for ChunkIndex {
    fn from(index: ResourceIndex) -> Self {
        Self(index.0)
    }
}

impl fmt::Display for ResourceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion signal for the GPU work of a frame slot.
pub trait FrameFence {
    /// Returns `true` once all GPU work previously submitted for `frame` has finished.
    fn is_frame_retired(&self, frame: usize) -> bool;
}

/// Cursor over a fixed number of frame slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRing {
    frames: usize,
    active: usize,
}

impl FrameRing {
    pub const MAX_FRAMES: usize = 255;

    /// Creates a ring of `frames` slots with slot `0` active.
    pub fn new(frames: usize) -> Result<Self> {
        if !(1..=Self::MAX_FRAMES).contains(&frames) {
            return Err(AllocationError::InvalidFrameCount(frames));
        }

        Ok(Self { frames, active: 0 })
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// The slot that becomes active on the next [`Self::advance()`].
    pub fn next(&self) -> usize {
        if self.active + 1 == self.frames {
            0
        } else {
            self.active + 1
        }
    }

    /// The slot that was active before the current one.
    pub fn last(&self) -> usize {
        if self.active == 0 {
            self.frames - 1
        } else {
            self.active - 1
        }
    }

    /// Moves to the next slot and returns it.
    pub fn advance(&mut self) -> usize {
        self.active = self.next();
        self.active
    }
}

/// A collection of live resources owned by exactly one frame slot.
///
/// Both operations must be deterministic: two collections that start out equal and see the same
/// sequence of calls must hand out the same indices.
pub trait FrameCollection {
    type CreateArgs: Clone;

    /// Creates a resource, returning `Ok(None)` when the collection has no room for it.
    fn create(&mut self, args: &Self::CreateArgs) -> Result<Option<ResourceIndex>>;

    fn remove(&mut self, index: ResourceIndex) -> Result<()>;
}

/// A creation or removal waiting to be applied to the remaining frame slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifetimeOperation<A> {
    Creation { args: A, index: ResourceIndex },
    Removal { index: ResourceIndex },
}

#[derive(Debug)]
struct StoredLifetimeOperation<A> {
    operation: LifetimeOperation<A>,
    frames_left: usize,
}

/// Keeps one [`FrameCollection`] per frame in flight and replays lifetime operations across
/// them as the frame ring advances.
///
/// An operation is applied to the active slot immediately and then to each following slot as it
/// becomes active, so after `frames - 1` calls to [`Self::advance_frame()`] every slot has seen it.
pub struct FrameLifetimePipeline<C: FrameCollection> {
    ring: FrameRing,
    collections: Vec<C>,
    pending: VecDeque<StoredLifetimeOperation<C::CreateArgs>>,
    /// Leading pending operations already applied to the next slot by an interrupted advance.
    replayed: usize,
}

impl<C: FrameCollection> FrameLifetimePipeline<C> {
    /// Creates the pipeline, building the collection of every slot with `init`.
    pub fn new(frames: usize, init: impl FnMut(usize) -> C) -> Result<Self> {
        let ring = FrameRing::new(frames)?;
        let collections = (0..frames).map(init).collect();

        Ok(Self {
            ring,
            collections,
            pending: VecDeque::new(),
            replayed: 0,
        })
    }

    /// Creates a resource in the active slot and schedules it for every other slot.
    ///
    /// Returns `Ok(None)` when the active collection is out of space. Nothing is scheduled in
    /// that case, nor when the collection returns an error.
    pub fn create_resource(&mut self, args: C::CreateArgs) -> Result<Option<ResourceIndex>> {
        let active = self.ring.active();
        let Some(index) = self.collections[active].create(&args)? else {
            return Ok(None);
        };

        self.store(LifetimeOperation::Creation { args, index });

        Ok(Some(index))
    }

    /// Removes a resource from the active slot and schedules its removal from every other slot.
    ///
    /// The other slots keep their copy until their own turn comes up in the ring, which is when
    /// the GPU is known to be done with it.
    pub fn remove_resource(&mut self, index: ResourceIndex) -> Result<()> {
        let active = self.ring.active();
        self.collections[active].remove(index)?;

        self.store(LifetimeOperation::Removal { index });

        Ok(())
    }

    /// Returns `true` when it is safe to call [`Self::advance_frame()`]: the fence of the slot that
    /// is about to become active has retired and the presentation latency wait was signalled.
    pub fn can_advance(&self, fence: &impl FrameFence, latency_signaled: bool) -> bool {
        latency_signaled && fence.is_frame_retired(self.ring.next())
    }

    /// Activates the next frame slot and replays every pending operation into it, oldest first.
    ///
    /// Operations that have now reached every slot are dropped. When a replay fails the ring stays
    /// where it is and the error is returned; the operations that did reach the next slot are
    /// remembered, so calling this again resumes at the one that failed.
    pub fn advance_frame(&mut self) -> Result<()> {
        let next = self.ring.next();
        trace!(
            "replaying {} deferred operations into frame slot {}",
            self.pending.len() - self.replayed,
            next
        );

        let collection = &mut self.collections[next];
        for stored in self.pending.iter().skip(self.replayed) {
            match &stored.operation {
                LifetimeOperation::Creation { args, index } => {
                    let created = collection.create(args)?;
                    if created != Some(*index) {
                        if let Some(stray) = created {
                            if let Err(err) = collection.remove(stray) {
                                error!(
                                    "failed to roll back resource {} in frame slot {}: {}",
                                    stray, next, err
                                );
                            }
                        }
                        return Err(AllocationError::Internal(format!(
                            "Replaying creation of resource {} in frame slot {} produced {:?}. \
                             Frame collections must be deterministic.",
                            index, next, created
                        )));
                    }
                }
                LifetimeOperation::Removal { index } => collection.remove(*index)?,
            }
            self.replayed += 1;
        }

        self.replayed = 0;
        self.ring.advance();
        for stored in self.pending.iter_mut() {
            stored.frames_left -= 1;
        }

        // Every operation decrements in lockstep, so the finished ones form a prefix.
        while self
            .pending
            .front()
            .is_some_and(|stored| stored.frames_left == 0)
        {
            self.pending.pop_front();
        }

        Ok(())
    }

    fn store(&mut self, operation: LifetimeOperation<C::CreateArgs>) {
        let frames_left = self.ring.frames() - 1;
        if frames_left > 0 {
            self.pending.push_back(StoredLifetimeOperation {
                operation,
                frames_left,
            });
        }
    }

    pub fn frames(&self) -> usize {
        self.ring.frames()
    }

    pub fn active_frame(&self) -> usize {
        self.ring.active()
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    pub fn active(&self) -> &C {
        &self.collections[self.ring.active()]
    }

    pub fn active_mut(&mut self) -> &mut C {
        &mut self.collections[self.ring.active()]
    }

    pub fn collection(&self, frame: usize) -> Option<&C> {
        self.collections.get(frame)
    }

    pub fn collection_mut(&mut self, frame: usize) -> Option<&mut C> {
        self.collections.get_mut(frame)
    }

    /// Operations still waiting to reach some slots, oldest first, with the number of slots
    /// each one has left.
    pub fn pending_operations(
        &self,
    ) -> impl Iterator<Item = (&LifetimeOperation<C::CreateArgs>, usize)> + '_ {
        self.pending
            .iter()
            .map(|stored| (&stored.operation, stored.frames_left))
    }
}

impl<C: FrameCollection + fmt::Debug> fmt::Debug for FrameLifetimePipeline<C>
where
    C::CreateArgs: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLifetimePipeline")
            .field("ring", &self.ring)
            .field("collections", &self.collections)
            .field("pending", &self.pending)
            .field("replayed", &self.replayed)
            .finish()
    }
}
