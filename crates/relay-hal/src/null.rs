//! Recording backend. Every trait of the crate is implemented against plain
//! host memory; queues and descriptor writes append to logs instead of
//! reaching a driver. Submission ordering, fence values and barrier streams
//! are therefore fully observable, which is what the runtime's tests build on.

use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    Barrier, ClearValue, CommandAllocator, CommandList, Descriptor, DescriptorAllocator,
    DescriptorKind, DescriptorRange, Device, ExecContext, Fence, Format, GpuResource, HalError,
    HeapKind, Queue, ResourceDesc, ResourceManager, ResourceState, ViewDesc,
};

///One entry of a [NullQueue]'s log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOp {
    Wait { fence: u64, value: u64 },
    Submit { list: u64 },
    Signal { fence: u64, value: u64 },
}

///A resource identified by a process-unique id.
#[derive(Debug)]
pub struct NullResource {
    pub id: u64,
    pub desc: ResourceDesc,
    pub initial_state: ResourceState,
}

impl GpuResource for NullResource {
    fn desc(&self) -> ResourceDesc {
        self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

///Downcast helper for logs and assertions.
pub fn resource_id(res: &Arc<dyn GpuResource>) -> Option<u64> {
    res.as_any().downcast_ref::<NullResource>().map(|r| r.id)
}

#[derive(Debug)]
pub struct NullFence {
    id: u64,
    value: Mutex<u64>,
    cond: Condvar,
}

impl NullFence {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn advance(&self, value: u64) {
        let mut guard = self.value.lock().unwrap();
        if *guard < value {
            *guard = value;
            self.cond.notify_all();
        }
    }
}

impl Fence for NullFence {
    fn signaled_value(&self) -> u64 {
        *self.value.lock().unwrap()
    }

    fn wait_host(&self, value: u64) -> Result<(), HalError> {
        let mut guard = self.value.lock().unwrap();
        while *guard < value {
            guard = self.cond.wait(guard).unwrap();
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Initial,
    Recording,
    Closed,
}

///A recorded barrier: (resource id, from, to).
pub type BarrierRecord = (u64, ResourceState, ResourceState);

pub struct NullCommandList {
    pub id: u64,
    state: ListState,
    barriers: Vec<BarrierRecord>,
    ///Barrier stream of the most recent *submitted* recording.
    pub submitted_barriers: Arc<Mutex<Vec<BarrierRecord>>>,
}

impl NullCommandList {
    pub fn recorded_barriers(&self) -> &[BarrierRecord] {
        &self.barriers
    }
}

impl CommandList for NullCommandList {
    fn reset(&mut self) -> Result<(), HalError> {
        self.state = ListState::Recording;
        self.barriers.clear();
        Ok(())
    }

    fn barrier(&mut self, barriers: &[Barrier]) -> Result<(), HalError> {
        if self.state != ListState::Recording {
            return Err(HalError::NotRecording);
        }
        for b in barriers {
            let id = resource_id(&b.resource).unwrap_or(u64::MAX);
            self.barriers.push((id, b.from, b.to));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), HalError> {
        if self.state != ListState::Recording {
            return Err(HalError::NotRecording);
        }
        self.state = ListState::Closed;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct NullCommandAllocator {
    device: Arc<NullDevice>,
}

impl CommandAllocator for NullCommandAllocator {
    fn reset(&mut self) -> Result<(), HalError> {
        Ok(())
    }

    fn new_list(&mut self) -> Result<Box<dyn CommandList>, HalError> {
        Ok(Box::new(NullCommandList {
            id: self.device.next_id(),
            state: ListState::Initial,
            barriers: Vec::new(),
            submitted_barriers: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

#[derive(Debug)]
pub struct NullQueue {
    pub index: usize,
    log: Mutex<Vec<QueueOp>>,
}

impl NullQueue {
    ///Snapshot of every operation this queue saw, in submission order.
    pub fn log(&self) -> Vec<QueueOp> {
        self.log.lock().unwrap().clone()
    }

    ///Ids of the submitted command lists, in order.
    pub fn submissions(&self) -> Vec<u64> {
        self.log()
            .into_iter()
            .filter_map(|op| match op {
                QueueOp::Submit { list } => Some(list),
                _ => None,
            })
            .collect()
    }
}

impl Queue for NullQueue {
    fn wait(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<(), HalError> {
        let null_fence = fence
            .as_any()
            .downcast_ref::<NullFence>()
            .ok_or_else(|| HalError::Backend("foreign fence on null queue".into()))?;
        self.log.lock().unwrap().push(QueueOp::Wait {
            fence: null_fence.id,
            value,
        });
        //the null GPU completes work instantly, so the wait degenerates to a
        // host wait. Dependency counting guarantees the signal was enqueued.
        null_fence.wait_host(value)
    }

    fn submit(&self, list: &mut dyn CommandList) -> Result<(), HalError> {
        let list = list
            .as_any_mut()
            .downcast_mut::<NullCommandList>()
            .ok_or_else(|| HalError::Submit("foreign command list on null queue".into()))?;
        if list.state != ListState::Closed {
            return Err(HalError::Submit("command list not closed".into()));
        }
        *list.submitted_barriers.lock().unwrap() = list.barriers.clone();
        self.log
            .lock()
            .unwrap()
            .push(QueueOp::Submit { list: list.id });
        Ok(())
    }

    fn signal(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<(), HalError> {
        let null_fence = fence
            .as_any()
            .downcast_ref::<NullFence>()
            .ok_or_else(|| HalError::Backend("foreign fence on null queue".into()))?;
        self.log.lock().unwrap().push(QueueOp::Signal {
            fence: null_fence.id,
            value,
        });
        null_fence.advance(value);
        Ok(())
    }
}

#[derive(Debug)]
pub struct NullDevice {
    ids: AtomicU64,
}

impl NullDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(NullDevice {
            ids: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct NullResourceManager {
    device: Arc<NullDevice>,
    created: Mutex<Vec<u64>>,
}

impl NullResourceManager {
    ///Creates a standalone resource, the way an application binds external
    /// per-frame resources (swapchain images and the like).
    pub fn external(&self, desc: ResourceDesc) -> Arc<dyn GpuResource> {
        Arc::new(NullResource {
            id: self.device.next_id(),
            desc,
            initial_state: ResourceState::Undefined,
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl ResourceManager for NullResourceManager {
    fn create(
        &self,
        _heap: HeapKind,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        _clear: Option<&ClearValue>,
    ) -> Result<Arc<dyn GpuResource>, HalError> {
        let res = Arc::new(NullResource {
            id: self.device.next_id(),
            desc: *desc,
            initial_state,
        });
        self.created.lock().unwrap().push(res.id);
        Ok(res)
    }
}

///A logged descriptor write: (destination, resource id, view).
pub type ViewWrite = (Descriptor, u64, ViewDesc);

pub struct NullDescriptorAllocator {
    heads: Mutex<[u32; 4]>,
    free: Mutex<[VecDeque<DescriptorRange>; 4]>,
    writes: Mutex<Vec<ViewWrite>>,
    copies: Mutex<Vec<(DescriptorRange, DescriptorRange)>>,
    capacity: u32,
}

impl NullDescriptorAllocator {
    pub fn writes(&self) -> Vec<ViewWrite> {
        self.writes.lock().unwrap().clone()
    }

    ///Every (src, dst) staging copy, in order.
    pub fn copies(&self) -> Vec<(DescriptorRange, DescriptorRange)> {
        self.copies.lock().unwrap().clone()
    }

    pub fn allocated(&self, kind: DescriptorKind) -> u32 {
        self.heads.lock().unwrap()[kind.table_index()]
    }
}

impl DescriptorAllocator for NullDescriptorAllocator {
    fn alloc_static_range(
        &self,
        kind: DescriptorKind,
        count: u32,
    ) -> Result<DescriptorRange, HalError> {
        {
            let mut free = self.free.lock().unwrap();
            let pool = &mut free[kind.table_index()];
            if let Some(at) = pool.iter().position(|r| r.count >= count) {
                let range = pool.remove(at).unwrap();
                return Ok(DescriptorRange {
                    kind,
                    first: range.first,
                    count,
                });
            }
        }

        let mut heads = self.heads.lock().unwrap();
        let head = &mut heads[kind.table_index()];
        if *head + count > self.capacity {
            return Err(HalError::DescriptorsExhausted {
                kind,
                requested: count,
                free: self.capacity - *head,
            });
        }
        let first = *head;
        *head += count;
        Ok(DescriptorRange { kind, first, count })
    }

    fn free_static_range(&self, range: DescriptorRange) {
        self.free.lock().unwrap()[range.kind.table_index()].push_back(range);
    }

    fn write_view(
        &self,
        dst: Descriptor,
        resource: &Arc<dyn GpuResource>,
        view: &ViewDesc,
    ) -> Result<(), HalError> {
        if dst.kind == DescriptorKind::GpuView {
            return Err(HalError::Backend(
                "shader-visible descriptors are copy targets, not write targets".into(),
            ));
        }
        let id = resource_id(resource)
            .ok_or_else(|| HalError::Backend("foreign resource in null allocator".into()))?;
        self.writes.lock().unwrap().push((dst, id, *view));
        Ok(())
    }

    fn copy_views(&self, src: DescriptorRange, dst: DescriptorRange) -> Result<(), HalError> {
        if src.count != dst.count {
            return Err(HalError::Backend("descriptor copy count mismatch".into()));
        }
        if src.kind != DescriptorKind::CpuView {
            return Err(HalError::Backend(
                "descriptor copies must source the staging storage".into(),
            ));
        }
        self.copies.lock().unwrap().push((src, dst));
        Ok(())
    }

    fn heap(&self) -> &dyn Any {
        self
    }
}

///Bundles a complete null backend. The concrete types stay reachable so tests
/// can inspect the logs after driving the runtime.
pub struct NullBackend {
    pub device: Arc<NullDevice>,
    pub queues: Vec<Arc<NullQueue>>,
    pub resources: Arc<NullResourceManager>,
    pub descriptors: Arc<NullDescriptorAllocator>,
}

impl NullBackend {
    pub const DESCRIPTOR_CAPACITY: u32 = 4096;

    pub fn new(queue_count: usize) -> Self {
        let device = NullDevice::new();
        let queues = (0..queue_count)
            .map(|index| {
                Arc::new(NullQueue {
                    index,
                    log: Mutex::new(Vec::new()),
                })
            })
            .collect();
        NullBackend {
            resources: Arc::new(NullResourceManager {
                device: device.clone(),
                created: Mutex::new(Vec::new()),
            }),
            descriptors: Arc::new(NullDescriptorAllocator {
                heads: Mutex::new([0; 4]),
                free: Mutex::new(Default::default()),
                writes: Mutex::new(Vec::new()),
                copies: Mutex::new(Vec::new()),
                capacity: Self::DESCRIPTOR_CAPACITY,
            }),
            queues,
            device,
        }
    }

    pub fn context(&self) -> ExecContext {
        ExecContext {
            device: Arc::new(NullBackendDevice {
                inner: self.device.clone(),
            }),
            queues: self
                .queues
                .iter()
                .map(|q| q.clone() as Arc<dyn Queue>)
                .collect(),
            resources: self.resources.clone(),
            descriptors: self.descriptors.clone(),
        }
    }

    ///Shorthand for an external resource the tests can bind per frame.
    pub fn external_texture(&self, width: u32, height: u32) -> Arc<dyn GpuResource> {
        self.resources.external(ResourceDesc::Texture2d {
            width,
            height,
            format: Format::Rgba8Unorm,
            mip_levels: 1,
        })
    }
}

///The [Device] the context actually carries; wraps the id source so command
/// allocators and fences can be handed out.
#[derive(Debug)]
pub struct NullBackendDevice {
    inner: Arc<NullDevice>,
}

impl Device for NullBackendDevice {
    fn name(&self) -> &str {
        "relay-null"
    }

    fn new_command_allocator(&self) -> Result<Box<dyn CommandAllocator>, HalError> {
        Ok(Box::new(NullCommandAllocator {
            device: self.inner.clone(),
        }))
    }

    fn new_fence(&self, initial: u64) -> Result<Arc<dyn Fence>, HalError> {
        Ok(Arc::new(NullFence {
            id: self.inner.next_id(),
            value: Mutex::new(initial),
            cond: Condvar::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_host_wait() {
        let backend = NullBackend::new(1);
        let ctx = backend.context();
        let fence = ctx.device.new_fence(0).unwrap();
        backend.queues[0].signal(&fence, 3).unwrap();
        fence.wait_host(3).unwrap();
        assert_eq!(fence.signaled_value(), 3);
    }

    #[test]
    fn submit_requires_closed_list() {
        let backend = NullBackend::new(1);
        let ctx = backend.context();
        let mut alloc = ctx.device.new_command_allocator().unwrap();
        let mut list = alloc.new_list().unwrap();
        list.reset().unwrap();
        assert!(backend.queues[0].submit(list.as_mut()).is_err());
        list.close().unwrap();
        backend.queues[0].submit(list.as_mut()).unwrap();
        assert_eq!(backend.queues[0].submissions().len(), 1);
    }

    #[test]
    fn descriptor_ranges_do_not_overlap() {
        let backend = NullBackend::new(1);
        let a = backend
            .descriptors
            .alloc_static_range(DescriptorKind::GpuView, 8)
            .unwrap();
        let b = backend
            .descriptors
            .alloc_static_range(DescriptorKind::GpuView, 8)
            .unwrap();
        assert!(a.first + a.count <= b.first);
    }
}
