#![allow(clippy::unwrap_used)]

use std::cell::RefCell;
use std::rc::Rc;

use gpu_frame_heap::*;

const FRAMES: usize = 3;
const HEAP_SIZE: u64 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MockBuffer {
    slot: usize,
    id: u32,
}

#[derive(Default)]
struct DeviceState {
    next_id: u32,
    live: Vec<MockBuffer>,
    heaps: Vec<Vec<u8>>,
}

/// One factory per frame slot, all sharing the same fake device.
struct MockDevice {
    slot: usize,
    state: Rc<RefCell<DeviceState>>,
}

impl ResourceFactory for MockDevice {
    type Handle = MockBuffer;

    fn create_resource(&mut self, desc: &PlacedResourceDesc<'_>) -> Result<MockBuffer> {
        assert_eq!(desc.heap_offset % desc.alignment, 0);
        assert!(desc.heap_offset + desc.size <= HEAP_SIZE);

        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let buffer = MockBuffer {
            slot: self.slot,
            id: state.next_id,
        };
        state.live.push(buffer);
        Ok(buffer)
    }

    fn release_resource(&mut self, handle: MockBuffer) {
        self.state.borrow_mut().live.retain(|live| *live != handle);
    }
}

struct MockQueue {
    state: Rc<RefCell<DeviceState>>,
}

impl Uploader<MockBuffer> for MockQueue {
    fn transfer(&mut self, destination: &MockBuffer, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let heap = &mut state.heaps[destination.slot];
        let start = offset as usize;
        heap[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

struct Fences {
    retired: Vec<bool>,
}

impl FrameFence for Fences {
    fn is_frame_retired(&self, frame: usize) -> bool {
        self.retired[frame]
    }
}

struct Engine {
    state: Rc<RefCell<DeviceState>>,
    pipeline: FrameLifetimePipeline<HeapCollection<MockDevice>>,
    store: UpdateStagingStore,
    queue: MockQueue,
    fences: Fences,
    scratch: Vec<PendingTransfer>,
}

impl Engine {
    fn new() -> Self {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
            .is_test(true)
            .try_init();

        let state = Rc::new(RefCell::new(DeviceState {
            heaps: vec![vec![0; HEAP_SIZE as usize]; FRAMES],
            ..Default::default()
        }));

        let desc = HeapCollectionCreateDesc {
            heap_size: HEAP_SIZE,
            strategy: AllocationStrategy::BestFit,
            debug_settings: AllocatorDebugSettings {
                log_memory_information: true,
                log_allocations: true,
                log_frees: true,
                ..Default::default()
            },
        };
        let pipeline = FrameLifetimePipeline::new(FRAMES, |slot| {
            HeapCollection::new(
                &desc,
                MockDevice {
                    slot,
                    state: state.clone(),
                },
            )
        })
        .unwrap();

        let store = UpdateStagingStore::new(&StagingStoreCreateDesc {
            policy: UpdatePolicy::CopyUpdate,
            frames: FRAMES,
            capacity: HEAP_SIZE,
        })
        .unwrap();

        Self {
            queue: MockQueue {
                state: state.clone(),
            },
            state,
            pipeline,
            store,
            fences: Fences {
                retired: vec![true; FRAMES],
            },
            scratch: Vec::new(),
        }
    }

    fn create(&mut self, name: &str, data: &[u8]) -> ResourceIndex {
        let index = self
            .pipeline
            .create_resource(ResourceDesc {
                name: name.into(),
                size: data.len() as u64,
                alignment: 256,
            })
            .unwrap()
            .unwrap();
        self.store
            .register_resource(index, data.len() as u64, Some(data))
            .unwrap();
        index
    }

    fn remove(&mut self, index: ResourceIndex) {
        self.pipeline.remove_resource(index).unwrap();
        self.store.unregister(index).unwrap();
    }

    /// Uploads pending data, submits the active slot and moves on to the next one once the GPU
    /// has retired it.
    fn end_frame(&mut self) -> usize {
        let uploaded = upload_pending(
            &mut self.store,
            self.pipeline.active(),
            &mut self.queue,
            &mut self.scratch,
        )
        .unwrap();

        let submitted = self.pipeline.active_frame();
        self.fences.retired[submitted] = false;

        let next = self.pipeline.ring().next();
        if !self.pipeline.can_advance(&self.fences, true) {
            // The GPU finishes the work of the slot we are about to reuse.
            self.fences.retired[next] = true;
        }
        assert!(!self.pipeline.can_advance(&self.fences, false));
        assert!(self.pipeline.can_advance(&self.fences, true));

        self.pipeline.advance_frame().unwrap();
        uploaded
    }

    fn heap_bytes(&self, slot: usize, index: ResourceIndex) -> Vec<u8> {
        let placement = self.pipeline.collection(slot).unwrap().placement(index).unwrap();
        let start = placement.offset as usize;
        self.state.borrow().heaps[slot][start..start + placement.size as usize].to_vec()
    }

    fn live_in(&self, slot: usize) -> usize {
        self.state
            .borrow()
            .live
            .iter()
            .filter(|buffer| buffer.slot == slot)
            .count()
    }
}

#[test]
fn resources_and_data_reach_every_frame_slot() {
    let mut engine = Engine::new();
    let camera = engine.create("camera", &[1; 64]);
    let lights = engine.create("lights", &[2; 128]);

    for frame in 0..FRAMES {
        assert_eq!(engine.pipeline.active_frame(), frame);
        assert_eq!(engine.end_frame(), 2);
    }
    assert_eq!(engine.pipeline.active_frame(), 0);
    assert_eq!(engine.pipeline.pending_operations().count(), 0);
    assert!(!engine.store.has_pending());

    for slot in 0..FRAMES {
        assert_eq!(engine.heap_bytes(slot, camera), vec![1; 64]);
        assert_eq!(engine.heap_bytes(slot, lights), vec![2; 128]);
        assert_eq!(engine.live_in(slot), 2);
    }

    // Every slot replayed the same operations, so placements agree.
    let offsets = (0..FRAMES)
        .map(|slot| {
            let collection = engine.pipeline.collection(slot).unwrap();
            (
                collection.placement(camera).unwrap().offset,
                collection.placement(lights).unwrap().offset,
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(offsets, vec![(0, 256); FRAMES]);
}

#[test]
fn updates_are_copied_once_per_frame() {
    let mut engine = Engine::new();
    let camera = engine.create("camera", &[0; 16]);
    for _ in 0..FRAMES {
        engine.end_frame();
    }

    engine.store.write(camera, &[7; 16]).unwrap();
    let mut uploads = Vec::new();
    for _ in 0..FRAMES + 1 {
        uploads.push(engine.end_frame());
    }

    assert_eq!(uploads, vec![1, 1, 1, 0]);
    for slot in 0..FRAMES {
        assert_eq!(engine.heap_bytes(slot, camera), vec![7; 16]);
    }
}

#[test]
fn removal_waits_for_each_slot() {
    let mut engine = Engine::new();
    let keep = engine.create("keep", &[3; 32]);
    let temporary = engine.create("temporary", &[4; 32]);
    for _ in 0..FRAMES {
        engine.end_frame();
    }

    let removed_in = engine.pipeline.active_frame();
    engine.remove(temporary);
    assert_eq!(engine.live_in(removed_in), 1);
    assert_eq!(engine.state.borrow().live.len(), 2 * FRAMES - 1);

    for advanced in 1..FRAMES {
        engine.end_frame();
        assert_eq!(engine.state.borrow().live.len(), 2 * FRAMES - 1 - advanced);
    }

    for slot in 0..FRAMES {
        let collection = engine.pipeline.collection(slot).unwrap();
        assert!(!collection.contains(temporary));
        assert!(collection.contains(keep));
        assert_eq!(collection.allocated(), 32);
    }
    assert_eq!(engine.store.headers().len(), 1);

    // The freed space is handed out again, at the same index in every slot.
    let replacement = engine.create("replacement", &[5; 32]);
    assert_eq!(replacement, temporary);
    for _ in 0..FRAMES {
        engine.end_frame();
    }
    for slot in 0..FRAMES {
        assert_eq!(engine.heap_bytes(slot, replacement), vec![5; 32]);
    }
}

#[test]
fn dropping_the_pipeline_releases_every_device_object() {
    let mut engine = Engine::new();
    engine.create("a", &[1; 8]);
    engine.create("b", &[2; 8]);
    engine.end_frame();

    let state = engine.state.clone();
    assert_eq!(state.borrow().live.len(), 4);

    drop(engine);
    assert!(state.borrow().live.is_empty());
}
