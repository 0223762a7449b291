//! Recording, completion counting and submission of compiled sections.

use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU32, Ordering},
};

use ahash::AHashMap;
use smallvec::{SmallVec, smallvec};

use relay_hal::{Barrier, CommandList, ViewDesc};

use crate::{
    compiler::CompiledBarrier,
    descriptor::{RangeSlotIndex, SlotIndex},
    graph::{PassFn, PassKey},
    resources::ResourceKey,
    runtime::{ExecError, PassContext, ResourceTable, RuntimeShared},
};

///Everything the runtime needs to know about one pass, fixed at compile time.
pub(crate) struct PassMeta {
    pub key: PassKey,
    pub name: String,
    pub entry_barriers: Vec<CompiledBarrier>,
    pub exit_barriers: Vec<CompiledBarrier>,
    pub bindings: AHashMap<(ResourceKey, ViewDesc), SlotIndex>,
    pub tables: Vec<RangeSlotIndex>,
    ///Distinct resources the pass declared, for access checks.
    pub declared: Vec<ResourceKey>,
}

pub(crate) struct PassExec {
    pub meta: PassMeta,
    pub callback: PassFn,
}

///The mutable half of a section: command lists (one per frame slot) and the
/// pass callbacks. Locked by the recording worker, and briefly by whoever
/// performs the submission.
pub(crate) struct SectionInner {
    pub lists: Vec<Box<dyn CommandList>>,
    pub passes: Vec<PassExec>,
}

///One schedulable unit: a run of passes on one (thread, queue) pair sharing a
/// command list.
pub(crate) struct SectionRuntime {
    pub thread: usize,
    pub queue: usize,
    ///Pass names joined, for logs and errors.
    pub label: String,
    ///Index into the runtime's fence list, present if anything waits on this
    /// section.
    pub fence: Option<usize>,
    ///Fences waited on at the current frame's counter value.
    pub waits: SmallVec<[usize; 4]>,
    ///Fences waited on at the previous frame's counter value.
    pub prev_frame_waits: SmallVec<[usize; 2]>,
    ///Distinct same-frame predecessor sections.
    pub external_dependencies: u32,
    ///Sections whose counters drop when this one submitted.
    pub outputs: SmallVec<[usize; 4]>,
    ///Countdown to submission: external_dependencies plus one for the
    /// section's own recording. Reset before every frame.
    pub unfinished: AtomicU32,
    pub inner: Mutex<SectionInner>,
}

impl SectionRuntime {
    ///Re-arms the countdown for the next frame. Only legal while no frame is
    /// in flight host-side.
    pub fn reset_unfinished(&self) {
        self.unfinished
            .store(self.external_dependencies + 1, Ordering::Release);
    }
}

///Records the section's command list for `slot`: entry barriers, the pass
/// callback, exit barriers, repeated per pass, then closes the list.
pub(crate) fn record(
    shared: &RuntimeShared,
    index: usize,
    frame_index: u64,
    slot: usize,
) -> Result<(), ExecError> {
    let section = &shared.sections[index];
    let resources = shared.resources.read().unwrap();
    let slots = shared.slots.read().unwrap();
    //a pass callback may have panicked under this lock in an earlier frame;
    // the lists and callbacks stay usable, recording resets the list anyway
    let mut inner = section
        .inner
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let SectionInner { lists, passes } = &mut *inner;

    let list = lists[slot].as_mut();
    list.reset()?;
    for pass in passes.iter_mut() {
        apply_barriers(list, &resources, slot, &pass.meta.entry_barriers)?;
        let mut ctx = PassContext {
            frame_index,
            frame_slot: slot,
            list: &mut *list,
            meta: &pass.meta,
            resources: &resources,
            slots: &slots,
        };
        (pass.callback)(&mut ctx)?;
        apply_barriers(list, &resources, slot, &pass.meta.exit_barriers)?;
    }
    list.close()?;

    #[cfg(feature = "logging")]
    log::trace!(
        "recorded section '{}' for frame {frame_index} (slot {slot})",
        section.label
    );
    Ok(())
}

fn apply_barriers(
    list: &mut dyn CommandList,
    resources: &ResourceTable,
    slot: usize,
    barriers: &[CompiledBarrier],
) -> Result<(), ExecError> {
    if barriers.is_empty() {
        return Ok(());
    }
    let mut resolved: SmallVec<[Barrier; 4]> = SmallVec::with_capacity(barriers.len());
    for barrier in barriers {
        resolved.push(Barrier {
            resource: resources.resolve(barrier.resource, slot)?,
            from: barrier.from,
            to: barrier.to,
        });
    }
    list.barrier(&resolved)?;
    Ok(())
}

///Drops the section's counter by one and, if it reached zero, submits and
/// fans out to its dependents. Iterative on purpose: a deep graph must not
/// translate into a deep call stack.
pub(crate) fn complete(
    shared: &RuntimeShared,
    index: usize,
    counter: u64,
    slot: usize,
) -> Result<(), ExecError> {
    let mut worklist: SmallVec<[usize; 8]> = smallvec![index];
    while let Some(idx) = worklist.pop() {
        let section = &shared.sections[idx];
        if section.unfinished.fetch_sub(1, Ordering::AcqRel) == 1 {
            submit(shared, idx, counter, slot)?;
            worklist.extend_from_slice(&section.outputs);
        }
    }
    Ok(())
}

///Submission happens on whichever worker dropped the counter to zero: waits
/// first, then the list, then the section's own signal.
fn submit(shared: &RuntimeShared, index: usize, counter: u64, slot: usize) -> Result<(), ExecError> {
    let section = &shared.sections[index];
    let queue = &shared.ctx.queues[section.queue];

    if shared.poisoned() {
        //the frame already failed; skip the work but still signal so queues
        // waiting on this section's fence are not stuck
        if let Some(fence) = section.fence {
            queue.signal(&shared.fences[fence], counter)?;
        }
        return Ok(());
    }

    for &fence in &section.waits {
        queue.wait(&shared.fences[fence], counter)?;
    }
    if counter > 1 {
        for &fence in &section.prev_frame_waits {
            queue.wait(&shared.fences[fence], counter - 1)?;
        }
    }
    {
        let mut inner = section
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.submit(inner.lists[slot].as_mut())?;
    }
    if let Some(fence) = section.fence {
        queue.signal(&shared.fences[fence], counter)?;
    }

    #[cfg(feature = "logging")]
    log::trace!(
        "submitted section '{}' to queue {} at {counter}",
        section.label,
        section.queue
    );
    Ok(())
}
