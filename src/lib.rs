//! Frame-pipelined placement of GPU resources inside pre-allocated device heaps.
//!
//! The crate does not talk to a graphics API itself. The host engine allocates one device heap
//! per frame in flight and implements [`ResourceFactory`] to place buffers and textures at the
//! offsets handed out here. This crate decides where every resource lives, keeps the copies in
//! each frame slot consistent, and delays frees until the GPU can no longer read the memory.
//!
//! ## Setting up a pipeline
//!
//! ```
//! use gpu_frame_heap::*;
//!
//! struct Device;
//!
//! impl ResourceFactory for Device {
//!     type Handle = u64;
//!
//!     fn create_resource(&mut self, desc: &PlacedResourceDesc<'_>) -> Result<u64> {
//!         // Create the device object at `desc.heap_offset` here.
//!         Ok(desc.heap_offset)
//!     }
//!
//!     fn release_resource(&mut self, _handle: u64) {}
//! }
//!
//! let desc = HeapCollectionCreateDesc {
//!     heap_size: 64 * 1024 * 1024,
//!     strategy: AllocationStrategy::BestFit,
//!     debug_settings: Default::default(),
//! };
//! let pipeline = FrameLifetimePipeline::new(3, |_| HeapCollection::new(&desc, Device))?;
//! # Ok::<(), AllocationError>(())
//! ```
//!
//! ## Creating and removing resources
//!
//! ```
//! # use gpu_frame_heap::*;
//! # struct Device;
//! # impl ResourceFactory for Device {
//! #     type Handle = u64;
//! #     fn create_resource(&mut self, desc: &PlacedResourceDesc<'_>) -> Result<u64> {
//! #         Ok(desc.heap_offset)
//! #     }
//! #     fn release_resource(&mut self, _handle: u64) {}
//! # }
//! # let desc = HeapCollectionCreateDesc {
//! #     heap_size: 64 * 1024 * 1024,
//! #     strategy: AllocationStrategy::BestFit,
//! #     debug_settings: Default::default(),
//! # };
//! # let mut pipeline = FrameLifetimePipeline::new(3, |_| HeapCollection::new(&desc, Device))?;
//! let vertices = pipeline
//!     .create_resource(ResourceDesc {
//!         name: "Example vertex buffer".into(),
//!         size: 4096,
//!         alignment: 256,
//!     })?
//!     .expect("heap is large enough");
//!
//! // The other frame slots receive their copy as the ring reaches them.
//! pipeline.advance_frame()?;
//!
//! // Frees are delayed the same way, each slot drops its copy once its fence retired.
//! pipeline.remove_resource(vertices)?;
//! # Ok::<(), AllocationError>(())
//! ```
#![deny(clippy::unimplemented, clippy::unwrap_used, clippy::ok_expect)]

mod result;
pub use result::*;

mod stable_vec;
pub use stable_vec::StableVec;

mod allocator;
pub use allocator::{
    align_up, AllocationReport, AllocationStrategy, ChunkHeap, ChunkIndex, ChunkInfo, ChunkStatus,
};

pub mod frame;
pub use frame::{
    FrameCollection, FrameFence, FrameLifetimePipeline, FrameRing, HeapCollection,
    HeapCollectionCreateDesc, LifetimeOperation, Placement, PlacedResourceDesc, ResourceDesc,
    ResourceFactory, ResourceIndex,
};

pub mod staging;
pub use staging::{
    upload_pending, MappedSlab, PendingTransfer, StagingStoreCreateDesc, UpdateHeader,
    UpdatePolicy, UpdateStagingStore, Uploader,
};

#[derive(Copy, Clone, Debug)]
pub struct AllocatorDebugSettings {
    /// Logs out the size and strategy of every heap collection on creation
    pub log_memory_information: bool,
    /// Logs out all live resources when a heap collection is dropped, with log level Warn
    pub log_leaks_on_shutdown: bool,
    /// Stores a copy of the full backtrace for every resource that is created, this makes it
    /// easier to track down leaks but has a RAM overhead so should be disabled in shipping
    /// applications.
    pub store_stack_traces: bool,
    /// Log out every resource creation with log level Debug, rather spammy so off by default
    pub log_allocations: bool,
    /// Log out every resource removal with log level Debug, rather spammy so off by default
    pub log_frees: bool,
    /// Log out stack traces when either `log_allocations` or `log_frees` is enabled.
    pub log_stack_traces: bool,
}

impl Default for AllocatorDebugSettings {
    fn default() -> Self {
        Self {
            log_memory_information: false,
            log_leaks_on_shutdown: true,
            store_stack_traces: false,
            log_allocations: false,
            log_frees: false,
            log_stack_traces: false,
        }
    }
}
