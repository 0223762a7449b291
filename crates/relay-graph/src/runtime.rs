//! The execution half: a compiled schedule plus the worker pool driving it.
//!
//! [Runtime] owns everything a compile produced: the sections, their fences,
//! the materialized resources, the descriptor slots and one long-lived worker
//! thread per thread index. Frames are driven with [Runtime::run] (or the
//! [run_async](Runtime::run_async)/[sync](Runtime::sync) pair); external
//! resources are rebound between frames with
//! [set_external_resource](Runtime::set_external_resource).

use std::sync::{
    Arc, Condvar, Mutex, RwLock,
    mpsc::{self, Sender},
};
use std::thread::JoinHandle;

use slotmap::SecondaryMap;
use thiserror::Error;

use relay_hal::{
    CommandAllocator, CommandList, Descriptor, DescriptorRange, ExecContext, Fence, GpuResource,
    HalError, ViewDesc,
};

use crate::{
    compiler::{CompileError, CompileStats},
    descriptor::DescriptorSlotManager,
    graph::TableHandle,
    resources::ResourceKey,
};

pub(crate) mod section;
pub(crate) mod worker;

pub(crate) use section::{PassExec, PassMeta, SectionInner, SectionRuntime};
use worker::WorkerMsg;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("pass '{pass}' accessed resource '{resource}' it never declared")]
    UndeclaredBinding { pass: String, resource: String },
    #[error("pass '{pass}' looked up a table it never declared")]
    UnknownTable { pass: String },
    #[error("external resource '{0}' has no backing bound for frame slot {1}")]
    UnboundExternal(String, usize),
    #[error("resource '{0}' is not external")]
    NotExternal(String),
    #[error("frame slot {slot} is out of range, {count} frames in flight")]
    FrameSlotOutOfRange { slot: usize, count: usize },
    #[error("unknown resource handle")]
    UnknownResource,
    #[error("worker thread {0} is gone")]
    WorkerLost(usize),
    #[error(transparent)]
    Hal(#[from] HalError),
}

///Runtime backing of one declared resource.
pub(crate) struct ResourceRuntime {
    pub name: String,
    pub external: bool,
    ///Per frame slot overrides, only populated for external resources.
    pub frames: Vec<Option<Arc<dyn GpuResource>>>,
    ///Most recently materialized or bound backing.
    pub current: Option<Arc<dyn GpuResource>>,
}

pub(crate) struct ResourceTable {
    pub entries: SecondaryMap<ResourceKey, ResourceRuntime>,
}

impl ResourceTable {
    pub fn resolve(
        &self,
        key: ResourceKey,
        slot: usize,
    ) -> Result<Arc<dyn GpuResource>, ExecError> {
        let entry = self.entries.get(key).ok_or(ExecError::UnknownResource)?;
        entry
            .frames
            .get(slot)
            .and_then(|f| f.clone())
            .or_else(|| entry.current.clone())
            .ok_or_else(|| ExecError::UnboundExternal(entry.name.clone(), slot))
    }

    pub fn name(&self, key: ResourceKey) -> &str {
        self.entries.get(key).map(|e| e.name.as_str()).unwrap_or("<unknown>")
    }
}

///Countdown the driver waits on until every worker finished the frame.
pub(crate) struct Latch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Latch {
    fn new() -> Self {
        Latch {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn arm(&self, count: usize) {
        *self.count.lock().unwrap() = count;
    }

    pub fn count_down(&self) {
        let mut guard = self.count.lock().unwrap();
        *guard -= 1;
        if *guard == 0 {
            self.cond.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut guard = self.count.lock().unwrap();
        while *guard > 0 {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

///State shared between the driver and every worker.
pub(crate) struct RuntimeShared {
    pub ctx: ExecContext,
    pub sections: Vec<SectionRuntime>,
    ///Section execution order per worker thread.
    pub thread_sections: Vec<Vec<usize>>,
    pub fences: Vec<Arc<dyn Fence>>,
    ///End-of-frame fence per queue, signaled after a frame's last submission.
    /// Paces reuse of command storage even when no section needs a fence.
    pub frame_fences: Vec<Arc<dyn Fence>>,
    pub resources: RwLock<ResourceTable>,
    pub slots: RwLock<DescriptorSlotManager>,
    ///First error of the current frame; later ones are dropped.
    pub error: Mutex<Option<ExecError>>,
    pub latch: Latch,
    pub frame_count: usize,
}

impl RuntimeShared {
    pub fn poisoned(&self) -> bool {
        self.error.lock().unwrap().is_some()
    }

    pub fn poison(&self, err: ExecError) {
        let mut guard = self.error.lock().unwrap();
        if guard.is_none() {
            *guard = Some(err);
        }
    }
}

///Handed to every pass callback while its section records.
pub struct PassContext<'a> {
    pub(crate) frame_index: u64,
    pub(crate) frame_slot: usize,
    pub(crate) list: &'a mut dyn CommandList,
    pub(crate) meta: &'a PassMeta,
    pub(crate) resources: &'a ResourceTable,
    pub(crate) slots: &'a DescriptorSlotManager,
}

impl PassContext<'_> {
    ///The frame index [Runtime::run] was called with.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    ///The frame slot backing this recording.
    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    ///The section's command list, positioned after the pass's entry barriers.
    pub fn commands(&mut self) -> &mut dyn CommandList {
        &mut *self.list
    }

    ///The raw backing of a resource the pass declared.
    pub fn raw_resource(&self, key: ResourceKey) -> Result<Arc<dyn GpuResource>, ExecError> {
        if !self.meta.declared.contains(&key) {
            return Err(ExecError::UndeclaredBinding {
                pass: self.meta.name.clone(),
                resource: self.resources.name(key).to_string(),
            });
        }
        self.resources.resolve(key, self.frame_slot)
    }

    ///The physical descriptor behind a declared view binding.
    pub fn descriptor(&self, key: ResourceKey, view: ViewDesc) -> Result<Descriptor, ExecError> {
        let slot = self.meta.bindings.get(&(key, view)).ok_or_else(|| {
            ExecError::UndeclaredBinding {
                pass: self.meta.name.clone(),
                resource: self.resources.name(key).to_string(),
            }
        })?;
        self.slots
            .slot(*slot)
            .descriptor(self.frame_slot)
            .ok_or_else(|| {
                ExecError::UnboundExternal(self.resources.name(key).to_string(), self.frame_slot)
            })
    }

    ///The contiguous descriptor run behind a declared table binding.
    pub fn table_range(&self, handle: TableHandle) -> Result<DescriptorRange, ExecError> {
        if handle.pass != self.meta.key {
            return Err(ExecError::UnknownTable {
                pass: self.meta.name.clone(),
            });
        }
        let slot = self
            .meta
            .tables
            .get(handle.index)
            .ok_or_else(|| ExecError::UnknownTable {
                pass: self.meta.name.clone(),
            })?;
        self.slots
            .range_slot(*slot)
            .range(self.frame_slot)
            .ok_or_else(|| ExecError::UnboundExternal(self.meta.name.clone(), self.frame_slot))
    }

    ///Shader-visible descriptors valid for this frame only.
    pub fn alloc_transient(&self, count: u32) -> Result<DescriptorRange, ExecError> {
        Ok(self.slots.alloc_transient(self.frame_slot, count)?)
    }
}

struct Worker {
    tx: Sender<WorkerMsg>,
    join: Option<JoinHandle<()>>,
}

///A compiled graph and its worker pool.
///
/// Dropping the runtime stops the workers and drains outstanding GPU work.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    workers: Vec<Worker>,
    stats: CompileStats,
    ///Frames dispatched so far; doubles as the fence counter value.
    frames_dispatched: u64,
    running: bool,
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: ExecContext,
        sections: Vec<SectionRuntime>,
        thread_sections: Vec<Vec<usize>>,
        fences: Vec<Arc<dyn Fence>>,
        frame_fences: Vec<Arc<dyn Fence>>,
        resources: ResourceTable,
        slots: DescriptorSlotManager,
        allocators: Vec<Vec<Box<dyn CommandAllocator>>>,
        frame_count: usize,
        stats: CompileStats,
    ) -> Result<Self, CompileError> {
        let shared = Arc::new(RuntimeShared {
            ctx,
            sections,
            thread_sections,
            fences,
            frame_fences,
            resources: RwLock::new(resources),
            slots: RwLock::new(slots),
            error: Mutex::new(None),
            latch: Latch::new(),
            frame_count,
        });

        let mut workers = Vec::with_capacity(allocators.len());
        for (thread, allocs) in allocators.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel();
            let shared = shared.clone();
            let join = std::thread::Builder::new()
                .name(format!("relay-worker-{thread}"))
                .spawn(move || worker::run(shared, thread, rx, allocs))?;
            workers.push(Worker {
                tx,
                join: Some(join),
            });
        }

        Ok(Runtime {
            shared,
            workers,
            stats,
            frames_dispatched: 0,
            running: false,
        })
    }

    ///Dispatches a frame to the workers without waiting for it. A frame that
    /// is still in flight host-side is synced first.
    pub fn run_async(&mut self, frame_index: u64) -> Result<(), ExecError> {
        if self.running {
            self.sync()?;
        }
        if self.workers.is_empty() {
            return Err(ExecError::WorkerLost(0));
        }

        self.frames_dispatched += 1;
        let counter = self.frames_dispatched;
        let slot = (frame_index % self.shared.frame_count as u64) as usize;

        //the slot's lists and allocators are reused; everything the GPU still
        // runs from frames further back than the in-flight window must be done
        if counter > self.shared.frame_count as u64 {
            let completed = counter - self.shared.frame_count as u64;
            for fence in &self.shared.frame_fences {
                fence.wait_host(completed)?;
            }
        }

        for section in &self.shared.sections {
            section.reset_unfinished();
        }
        self.shared.slots.read().unwrap().reset_transient();
        self.shared.latch.arm(self.workers.len());
        self.running = true;

        for (thread, worker) in self.workers.iter().enumerate() {
            worker
                .tx
                .send(WorkerMsg::Frame {
                    counter,
                    frame_index,
                    slot,
                })
                .map_err(|_| ExecError::WorkerLost(thread))?;
        }
        Ok(())
    }

    ///Blocks until the in-flight frame finished recording and submitting,
    /// then reports its first error, if any.
    pub fn sync(&mut self) -> Result<(), ExecError> {
        if !self.running {
            return Ok(());
        }
        self.shared.latch.wait();
        self.running = false;

        //every submission of the frame is enqueued by now; close the frame on
        // each queue so command storage reuse has something to wait on
        for (fence, queue) in self.shared.frame_fences.iter().zip(&self.shared.ctx.queues) {
            queue.signal(fence, self.frames_dispatched)?;
        }

        if let Some(err) = self.shared.error.lock().unwrap().take() {
            //sections that never reached their submission leave their fences
            // behind; advance them so the next frame's waits cannot get stuck
            for section in &self.shared.sections {
                if let Some(fence) = section.fence {
                    let signal = self.shared.ctx.queues[section.queue]
                        .signal(&self.shared.fences[fence], self.frames_dispatched);
                    #[cfg(feature = "logging")]
                    if let Err(repair) = signal {
                        log::warn!("fence repair after failed frame: {repair}");
                    }
                    #[cfg(not(feature = "logging"))]
                    let _ = signal;
                }
            }
            return Err(err);
        }
        Ok(())
    }

    ///Runs one frame to host-side completion.
    pub fn run(&mut self, frame_index: u64) -> Result<(), ExecError> {
        self.run_async(frame_index)?;
        self.sync()
    }

    ///Binds the backing of an external resource, for one frame slot or (with
    /// `frame` unset) for all of them. Syncs the in-flight frame first.
    pub fn set_external_resource(
        &mut self,
        resource: ResourceKey,
        frame: Option<usize>,
        backing: Arc<dyn GpuResource>,
    ) -> Result<(), ExecError> {
        self.sync()?;
        {
            let mut table = self.shared.resources.write().unwrap();
            let entry = table
                .entries
                .get_mut(resource)
                .ok_or(ExecError::UnknownResource)?;
            if !entry.external {
                return Err(ExecError::NotExternal(entry.name.clone()));
            }
            match frame {
                Some(slot) => {
                    if slot >= self.shared.frame_count {
                        return Err(ExecError::FrameSlotOutOfRange {
                            slot,
                            count: self.shared.frame_count,
                        });
                    }
                    entry.frames[slot] = Some(backing.clone());
                }
                None => {
                    for over in entry.frames.iter_mut() {
                        *over = None;
                    }
                }
            }
            entry.current = Some(backing);
        }
        self.shared
            .slots
            .write()
            .unwrap()
            .mark_resource_dirty(resource);
        Ok(())
    }

    ///Drops every external binding; the next frame fails unless they are
    /// re-bound before. Syncs the in-flight frame first.
    pub fn clear_external_resources(&mut self) -> Result<(), ExecError> {
        self.sync()?;
        let cleared: Vec<ResourceKey> = {
            let mut table = self.shared.resources.write().unwrap();
            let mut cleared = Vec::new();
            for (key, entry) in table.entries.iter_mut() {
                if entry.external {
                    for over in entry.frames.iter_mut() {
                        *over = None;
                    }
                    entry.current = None;
                    cleared.push(key);
                }
            }
            cleared
        };
        let mut slots = self.shared.slots.write().unwrap();
        for key in cleared {
            slots.mark_resource_dirty(key);
        }
        Ok(())
    }

    ///The most recently materialized or bound backing of a resource.
    pub fn get_raw_resource(&self, resource: ResourceKey) -> Option<Arc<dyn GpuResource>> {
        self.shared
            .resources
            .read()
            .unwrap()
            .entries
            .get(resource)
            .and_then(|e| e.current.clone())
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    pub fn frame_count(&self) -> usize {
        self.shared.frame_count
    }

    ///Stops the workers and drains outstanding GPU work. The runtime cannot
    /// run frames afterwards; this is what [Drop] does.
    pub fn reset(&mut self) -> Result<(), ExecError> {
        let result = self.sync();
        for worker in &self.workers {
            let _ = worker.tx.send(WorkerMsg::Stop);
        }
        for worker in self.workers.iter_mut() {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
        self.workers.clear();
        if self.frames_dispatched > 0 {
            for fence in self.shared.fences.iter().chain(&self.shared.frame_fences) {
                fence.wait_host(self.frames_dispatched)?;
            }
        }
        result
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(_err) = self.reset() {
            #[cfg(feature = "logging")]
            log::error!("runtime dropped with a failed frame: {_err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Runtime: Send);
    static_assertions::assert_impl_all!(ExecError: Send, Sync);

    #[test]
    fn latch_counts_down_to_zero() {
        let latch = Latch::new();
        latch.arm(2);
        latch.count_down();
        latch.count_down();
        latch.wait();
    }
}
