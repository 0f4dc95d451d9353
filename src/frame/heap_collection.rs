#[cfg(feature = "std")]
use std::backtrace::Backtrace;
use std::fmt;
#[cfg(feature = "std")]
use std::sync::Arc;

use log::{debug, log, Level};

use super::{FrameCollection, ResourceIndex};
use crate::allocator::{
    fmt_bytes, AllocationReport, AllocationStrategy, ChunkHeap, ChunkIndex, ChunkInfo,
};
use crate::{AllocationError, AllocatorDebugSettings, Result};

/// Everything a [`ResourceFactory`] needs to place a device object inside the heap.
#[derive(Clone, Debug)]
pub struct PlacedResourceDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub alignment: u64,
    /// Aligned offset of the object inside the device heap.
    pub heap_offset: u64,
}

/// Turns heap chunks into graphics-device objects.
///
/// Implemented by the host engine on top of its graphics API, for example by calling
/// `CreatePlacedResource` or `vkBindBufferMemory` at `heap_offset`.
pub trait ResourceFactory {
    type Handle;

    fn create_resource(&mut self, desc: &PlacedResourceDesc<'_>) -> Result<Self::Handle>;

    fn release_resource(&mut self, handle: Self::Handle);
}

/// Creation arguments of a [`HeapCollection`] resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDesc {
    /// Name of the resource, for tracking and debugging purposes
    pub name: String,
    pub size: u64,
    pub alignment: u64,
}

#[derive(Clone, Debug)]
pub struct HeapCollectionCreateDesc {
    /// Size of the device heap backing a single frame slot
    pub heap_size: u64,
    pub strategy: AllocationStrategy,
    pub debug_settings: AllocatorDebugSettings,
}

/// Where a live resource sits inside its heap.
#[derive(Debug)]
pub struct Placement<'a, H> {
    pub handle: &'a H,
    pub offset: u64,
    pub size: u64,
}

struct PlacedResource<H> {
    name: String,
    size: u64,
    handle: H,
    #[cfg(feature = "std")]
    backtrace: Arc<Backtrace>,
}

/// Frame-local resource collection backed by one [`ChunkHeap`].
///
/// The [`ResourceIndex`] of a resource is the index of its heap chunk.
pub struct HeapCollection<F: ResourceFactory> {
    heap: ChunkHeap<Option<PlacedResource<F::Handle>>>,
    strategy: AllocationStrategy,
    factory: F,
    debug_settings: AllocatorDebugSettings,
}

impl<F: ResourceFactory> HeapCollection<F> {
    pub fn new(desc: &HeapCollectionCreateDesc, factory: F) -> Self {
        if desc.debug_settings.log_memory_information {
            debug!(
                "heap collection: {} ({:?})",
                fmt_bytes(desc.heap_size),
                desc.strategy
            );
        }

        Self {
            heap: ChunkHeap::new(desc.heap_size),
            strategy: desc.strategy,
            factory,
            debug_settings: desc.debug_settings,
        }
    }

    /// Handle, offset and size of a live resource.
    pub fn placement(&self, index: ResourceIndex) -> Option<Placement<'_, F::Handle>> {
        let chunk = ChunkIndex::from(index);
        let resource = self.heap.metadata(chunk).ok()?.as_ref()?;

        Some(Placement {
            handle: &resource.handle,
            offset: self.heap.start_of_chunk(chunk).ok()?,
            size: resource.size,
        })
    }

    pub fn contains(&self, index: ResourceIndex) -> bool {
        self.placement(index).is_some()
    }

    pub fn len(&self) -> usize {
        self.heap.occupied().count()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.heap.total_size()
    }

    pub fn allocated(&self) -> u64 {
        self.heap.allocated()
    }

    /// Layout of the backing heap, in enumeration order.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkInfo> + '_ {
        self.heap.chunks()
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Grows the heap by `size` bytes, merging the new space with a free tail.
    pub fn grow(&mut self, size: u64) {
        self.heap.add_chunk(size, true);
    }

    /// Releases every live resource and resets the heap.
    pub fn release_all(&mut self) {
        let chunks = self
            .heap
            .occupied()
            .map(|(info, _)| info.index)
            .collect::<Vec<_>>();

        for chunk in chunks {
            if let Ok(slot) = self.heap.metadata_mut(chunk) {
                if let Some(resource) = slot.take() {
                    self.factory.release_resource(resource.handle);
                }
            }
        }

        self.heap.clear_heap(None);
    }

    pub fn report_allocations(&self) -> Vec<AllocationReport> {
        self.heap
            .report_allocations(|resource| resource.as_ref().map(|r| r.name.clone()))
    }

    pub fn report_memory_leaks(&self, log_level: Level) {
        for (info, resource) in self.heap.occupied() {
            let Some(resource) = resource else {
                continue;
            };

            let backtrace_info;
            #[cfg(feature = "std")]
            {
                backtrace_info = format!(
                    ",
        backtrace: {}",
                    resource.backtrace
                );
            }
            #[cfg(not(feature = "std"))]
            {
                backtrace_info = "";
            }

            log!(
                log_level,
                r#"leak detected: {{
    resource index: {}
    allocation: {{
        size: 0x{:x} ({}),
        offset: 0x{:x},
        name: {}{backtrace_info}
    }}
}}"#,
                info.index,
                resource.size,
                fmt_bytes(resource.size),
                info.aligned_start,
                resource.name,
            );
        }
    }
}

impl<F: ResourceFactory> FrameCollection for HeapCollection<F> {
    type CreateArgs = ResourceDesc;

    fn create(&mut self, desc: &ResourceDesc) -> Result<Option<ResourceIndex>> {
        if self.debug_settings.log_allocations {
            debug!(
                "Allocating `{}` of {} bytes with an alignment of {}.",
                &desc.name, desc.size, desc.alignment
            );
            #[cfg(feature = "std")]
            if self.debug_settings.log_stack_traces {
                let backtrace = Backtrace::force_capture();
                debug!("Allocation stack trace: {}", backtrace);
            }
        }

        let Some(chunk) = self
            .heap
            .allocate_chunk(desc.size, self.strategy, desc.alignment)?
        else {
            return Ok(None);
        };

        let placed = PlacedResourceDesc {
            name: &desc.name,
            size: desc.size,
            alignment: desc.alignment,
            heap_offset: self.heap.start_of_chunk(chunk)?,
        };
        let handle = match self.factory.create_resource(&placed) {
            Ok(handle) => handle,
            Err(err) => {
                self.heap.deallocate_chunk(chunk)?;
                return Err(err);
            }
        };

        #[cfg(feature = "std")]
        let backtrace = Arc::new(if self.debug_settings.store_stack_traces {
            Backtrace::force_capture()
        } else {
            Backtrace::disabled()
        });

        *self.heap.metadata_mut(chunk)? = Some(PlacedResource {
            name: desc.name.clone(),
            size: desc.size,
            handle,
            #[cfg(feature = "std")]
            backtrace,
        });

        Ok(Some(chunk.into()))
    }

    fn remove(&mut self, index: ResourceIndex) -> Result<()> {
        let chunk = ChunkIndex::from(index);
        if !self.heap.is_occupied(chunk) {
            return Err(AllocationError::InvalidResourceIndex(index.0));
        }

        let resource = self.heap.metadata_mut(chunk)?.take();

        if self.debug_settings.log_frees {
            let name = resource.as_ref().map_or("<null>", |r| r.name.as_str());
            debug!("Freeing `{}`.", name);
            #[cfg(feature = "std")]
            if self.debug_settings.log_stack_traces {
                let backtrace = Backtrace::force_capture();
                debug!("Free stack trace: {}", backtrace);
            }
        }

        if let Some(resource) = resource {
            self.factory.release_resource(resource.handle);
        }

        self.heap.deallocate_chunk(chunk)
    }
}

impl<F: ResourceFactory> fmt::Debug for HeapCollection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapCollection")
            .field("total_size", &self.heap.total_size())
            .field("allocated", &self.heap.allocated())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl<F: ResourceFactory> Drop for HeapCollection<F> {
    fn drop(&mut self) {
        if self.debug_settings.log_leaks_on_shutdown {
            self.report_memory_leaks(Level::Warn);
        }

        self.release_all();
    }
}
