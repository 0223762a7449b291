//! The long-lived worker threads, one per thread index passes can target.
//!
//! Workers rendezvous with the driver through a plain mpsc channel: one
//! [WorkerMsg::Frame] per frame, a distinguished [WorkerMsg::Stop] to wind
//! down. Within a frame a worker refreshes the descriptor slots it owns,
//! records its sections in topological order and participates in the
//! completion fan-out; the last countdown it performs may well submit a
//! section that lives on a different thread's queue.

use std::sync::{Arc, mpsc::Receiver};

use relay_hal::CommandAllocator;

use crate::{
    descriptor::{RangeSlotIndex, SlotIndex},
    resources::ResourceKey,
    runtime::{ExecError, RuntimeShared, section},
};

pub(crate) enum WorkerMsg {
    Frame {
        ///Fence counter value of this frame, strictly monotonic.
        counter: u64,
        ///Application-provided frame index, selects external bindings.
        frame_index: u64,
        ///Frame slot, selects lists and per-frame descriptors.
        slot: usize,
    },
    Stop,
}

pub(crate) fn run(
    shared: Arc<RuntimeShared>,
    thread: usize,
    rx: Receiver<WorkerMsg>,
    mut allocators: Vec<Box<dyn CommandAllocator>>,
) {
    let (view_slots, range_slots) = {
        let slots = shared.slots.read().unwrap();
        (
            slots.slot_indices_for_thread(thread),
            slots.range_indices_for_thread(thread),
        )
    };

    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Stop => break,
            WorkerMsg::Frame {
                counter,
                frame_index,
                slot,
            } => {
                //pass callbacks are user code; an unwind must not take the
                // worker (and with it the latch countdown) down with it
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    frame(
                        &shared,
                        thread,
                        counter,
                        frame_index,
                        slot,
                        &mut allocators,
                        &view_slots,
                        &range_slots,
                    )
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        #[cfg(feature = "logging")]
                        log::error!("worker {thread} failed frame {frame_index}: {err}");
                        shared.poison(err);
                    }
                    Err(_) => {
                        #[cfg(feature = "logging")]
                        log::error!("worker {thread} panicked in frame {frame_index}");
                        shared.poison(ExecError::WorkerLost(thread));
                    }
                }
                //always counted, even on failure; sync() must not hang
                shared.latch.count_down();
            }
        }
    }
    #[cfg(feature = "logging")]
    log::trace!("worker {thread} stopped");
}

#[allow(clippy::too_many_arguments)]
fn frame(
    shared: &RuntimeShared,
    thread: usize,
    counter: u64,
    frame_index: u64,
    slot: usize,
    allocators: &mut [Box<dyn CommandAllocator>],
    view_slots: &[SlotIndex],
    range_slots: &[RangeSlotIndex],
) -> Result<(), ExecError> {
    refresh(shared, slot, view_slots, range_slots)?;
    //the slot's previous frame is known complete, reclaim its storage
    allocators[slot].reset()?;

    for &index in &shared.thread_sections[thread] {
        if !shared.poisoned() {
            if let Err(err) = section::record(shared, index, frame_index, slot) {
                shared.poison(err);
            }
        }
        //own-recording countdown happens regardless so dependents and the
        // poisoned-path fence signals still run
        section::complete(shared, index, counter, slot)?;
    }
    Ok(())
}

///Rebuilds the physical descriptors of every slot this thread owns whose
/// bound backing changed. Internal resources never change identity, so after
/// the first frame this is a no-op for them.
fn refresh(
    shared: &RuntimeShared,
    slot: usize,
    view_slots: &[SlotIndex],
    range_slots: &[RangeSlotIndex],
) -> Result<(), ExecError> {
    if view_slots.is_empty() && range_slots.is_empty() {
        return Ok(());
    }
    let resources = shared.resources.read().unwrap();
    let mut slots = shared.slots.write().unwrap();

    for &index in view_slots {
        let (skip, resource) = {
            let view = slots.slot(index);
            (!view.per_frame && !view.is_dirty(slot), view.resource)
        };
        if skip {
            continue;
        }
        let raw = resources.resolve(resource, slot)?;
        slots.refresh_slot(index, slot, &raw)?;
    }

    for &index in range_slots {
        let members: Option<Vec<ResourceKey>> = {
            let range = slots.range_slot(index);
            if !range.per_frame && !range.is_dirty(slot) {
                None
            } else {
                Some(range.resources.to_vec())
            }
        };
        let Some(members) = members else {
            continue;
        };
        let raws = members
            .iter()
            .map(|key| resources.resolve(*key, slot))
            .collect::<Result<Vec<_>, _>>()?;
        slots.refresh_range_slot(index, slot, &raws)?;
    }
    Ok(())
}
