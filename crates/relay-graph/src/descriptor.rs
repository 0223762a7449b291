//! Descriptor slot management.
//!
//! Every (thread, resource, view) tuple a pass declares is interned into one
//! *view slot* during compilation; table bindings are interned the same way
//! at table granularity. After compilation the manager allocates the physical
//! backing ranges from the descriptor allocator and distributes them: slots
//! whose bound resource identity can change between frames get one physical
//! descriptor per frame slot, recycled through a free queue, everything else
//! shares a single descriptor. Shader-visible slots additionally own one
//! CPU-side staging descriptor; views are built there and copied into their
//! shader-visible location, render-target and depth-stencil views are written
//! in place since their storage is CPU-only anyway.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use ahash::AHashMap;
use smallvec::SmallVec;

use relay_hal::{
    Descriptor, DescriptorAllocator, DescriptorKind, DescriptorRange, GpuResource, HalError,
    ViewDesc,
};

use crate::resources::ResourceKey;

///Index of an interned view slot, monotonically increasing per compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex(pub(crate) u32);

///Index of an interned table (range) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeSlotIndex(pub(crate) u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    thread: usize,
    resource: ResourceKey,
    view: ViewDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RangeSlotKey {
    thread: usize,
    resources: Box<[ResourceKey]>,
    view: ViewDesc,
}

//Arc identity; enough to detect rebinding of an external resource.
fn identity(res: &Arc<dyn GpuResource>) -> usize {
    Arc::as_ptr(res) as *const () as usize
}

fn single(descriptor: Descriptor) -> DescriptorRange {
    DescriptorRange {
        kind: descriptor.kind,
        first: descriptor.index,
        count: 1,
    }
}

//build the view in staging storage, then copy; CPU-only kinds carry no
// staging descriptor and are written in place
fn write_through(
    allocator: &dyn DescriptorAllocator,
    staging: Option<Descriptor>,
    dst: Descriptor,
    raw: &Arc<dyn GpuResource>,
    view: &ViewDesc,
) -> Result<(), HalError> {
    match staging {
        Some(staging) => {
            allocator.write_view(staging, raw, view)?;
            allocator.copy_views(single(staging), single(dst))
        }
        None => allocator.write_view(dst, raw, view),
    }
}

fn write_range_through(
    allocator: &dyn DescriptorAllocator,
    staging: Option<DescriptorRange>,
    dst: DescriptorRange,
    raws: &[Arc<dyn GpuResource>],
    view: &ViewDesc,
) -> Result<(), HalError> {
    match staging {
        Some(staging) => {
            for (offset, raw) in raws.iter().enumerate() {
                allocator.write_view(staging.descriptor(offset as u32), raw, view)?;
            }
            allocator.copy_views(staging, dst)
        }
        None => {
            for (offset, raw) in raws.iter().enumerate() {
                allocator.write_view(dst.descriptor(offset as u32), raw, view)?;
            }
            Ok(())
        }
    }
}

///One logical view binding.
pub struct ViewSlot {
    pub thread: usize,
    pub resource: ResourceKey,
    pub view: ViewDesc,
    pub kind: DescriptorKind,
    ///False for the render-target/depth-stencil kinds, which shaders never
    /// reach directly.
    pub gpu_visible: bool,
    ///True when the bound resource identity may change across frames.
    pub per_frame: bool,

    ///Physical descriptor per frame slot (single entry when not per-frame).
    current: SmallVec<[Option<Descriptor>; 3]>,
    ///Recycling queue the physical descriptors rotate through.
    free: VecDeque<Descriptor>,
    ///CPU staging descriptor views are built in, present for shader-visible
    /// slots only.
    staging: Option<Descriptor>,
    dirty: SmallVec<[bool; 3]>,
    last_written: SmallVec<[Option<usize>; 3]>,
}

impl ViewSlot {
    ///The physical descriptor for `frame`. `None` until first written.
    pub fn descriptor(&self, frame: usize) -> Option<Descriptor> {
        if self.per_frame {
            self.current[frame]
        } else {
            self.current[0]
        }
    }

    pub fn is_dirty(&self, frame: usize) -> bool {
        self.dirty[self.frame_index(frame)]
    }

    fn frame_index(&self, frame: usize) -> usize {
        if self.per_frame { frame } else { 0 }
    }

    fn mark_dirty(&mut self) {
        for d in self.dirty.iter_mut() {
            *d = true;
        }
    }
}

///A table binding: a contiguous run of views per frame slot.
pub struct RangeSlot {
    pub thread: usize,
    pub resources: Box<[ResourceKey]>,
    pub view: ViewDesc,
    pub kind: DescriptorKind,
    pub gpu_visible: bool,
    pub per_frame: bool,

    current: SmallVec<[Option<DescriptorRange>; 3]>,
    free: VecDeque<DescriptorRange>,
    staging: Option<DescriptorRange>,
    dirty: SmallVec<[bool; 3]>,
    last_written: SmallVec<[Option<Box<[usize]>>; 3]>,
}

impl RangeSlot {
    pub fn range(&self, frame: usize) -> Option<DescriptorRange> {
        if self.per_frame {
            self.current[frame]
        } else {
            self.current[0]
        }
    }

    pub fn is_dirty(&self, frame: usize) -> bool {
        self.dirty[self.frame_index(frame)]
    }

    fn frame_index(&self, frame: usize) -> usize {
        if self.per_frame { frame } else { 0 }
    }

    fn mark_dirty(&mut self) {
        for d in self.dirty.iter_mut() {
            *d = true;
        }
    }
}

///Owns every view/range slot of one compiled runtime plus the mutex-guarded
/// transient region of the shader-visible storage.
pub struct DescriptorSlotManager {
    frame_count: usize,
    slots: Vec<ViewSlot>,
    range_slots: Vec<RangeSlot>,
    intern: AHashMap<SlotKey, SlotIndex>,
    range_intern: AHashMap<RangeSlotKey, RangeSlotIndex>,
    ///Backing allocations, one per descriptor kind in use.
    backing: Vec<DescriptorRange>,
    allocator: Option<Arc<dyn DescriptorAllocator>>,

    ///Per-frame transient region of the shader-visible storage. Multiple
    /// workers allocate from it in the same frame, hence the lock.
    transient: Option<DescriptorRange>,
    transient_head: Mutex<u32>,
}

impl DescriptorSlotManager {
    ///Shader-visible descriptors reserved per frame for transient tables.
    pub const TRANSIENT_CAPACITY: u32 = 256;

    pub(crate) fn new(frame_count: usize) -> Self {
        DescriptorSlotManager {
            frame_count,
            slots: Vec::new(),
            range_slots: Vec::new(),
            intern: AHashMap::default(),
            range_intern: AHashMap::default(),
            backing: Vec::new(),
            allocator: None,
            transient: None,
            transient_head: Mutex::new(0),
        }
    }

    ///Interns a (thread, resource, view) tuple. Repeats return the slot
    /// allocated for the first occurrence.
    pub(crate) fn add_descriptor(
        &mut self,
        thread: usize,
        resource: ResourceKey,
        view: ViewDesc,
        per_frame: bool,
    ) -> SlotIndex {
        let key = SlotKey {
            thread,
            resource,
            view,
        };
        if let Some(idx) = self.intern.get(&key) {
            return *idx;
        }
        let idx = SlotIndex(self.slots.len() as u32);
        let buffered = if per_frame { self.frame_count } else { 1 };
        self.slots.push(ViewSlot {
            thread,
            resource,
            view,
            kind: view.descriptor_kind(),
            gpu_visible: view.gpu_visible(),
            per_frame,
            current: SmallVec::from_iter((0..buffered).map(|_| None)),
            free: VecDeque::new(),
            staging: None,
            dirty: SmallVec::from_iter((0..buffered).map(|_| true)),
            last_written: SmallVec::from_iter((0..buffered).map(|_| None)),
        });
        self.intern.insert(key, idx);
        idx
    }

    ///Interns a table binding at table granularity.
    pub(crate) fn add_descriptor_table(
        &mut self,
        thread: usize,
        resources: &[ResourceKey],
        view: ViewDesc,
        per_frame: bool,
    ) -> RangeSlotIndex {
        let key = RangeSlotKey {
            thread,
            resources: resources.into(),
            view,
        };
        if let Some(idx) = self.range_intern.get(&key) {
            return *idx;
        }
        let idx = RangeSlotIndex(self.range_slots.len() as u32);
        let buffered = if per_frame { self.frame_count } else { 1 };
        self.range_slots.push(RangeSlot {
            thread,
            resources: resources.into(),
            view,
            kind: view.descriptor_kind(),
            gpu_visible: view.gpu_visible(),
            per_frame,
            current: SmallVec::from_iter((0..buffered).map(|_| None)),
            free: VecDeque::new(),
            staging: None,
            dirty: SmallVec::from_iter((0..buffered).map(|_| true)),
            last_written: SmallVec::from_iter((0..buffered).map(|_| None)),
        });
        self.range_intern.insert(key, idx);
        idx
    }

    ///Physical descriptors needed per kind, counting multi-buffering. Every
    /// shader-visible slot also needs one staging descriptor, never
    /// multi-buffered since staging is written and copied out in one go.
    fn counts(&self) -> [u32; 4] {
        let staging = DescriptorKind::CpuView.table_index();
        let mut counts = [0u32; 4];
        for slot in &self.slots {
            let n = if slot.per_frame {
                self.frame_count as u32
            } else {
                1
            };
            counts[slot.kind.table_index()] += n;
            if slot.gpu_visible {
                counts[staging] += 1;
            }
        }
        for slot in &self.range_slots {
            let n = if slot.per_frame {
                self.frame_count as u32
            } else {
                1
            };
            counts[slot.kind.table_index()] += n * slot.resources.len() as u32;
            if slot.gpu_visible {
                counts[staging] += slot.resources.len() as u32;
            }
        }
        counts
    }

    ///Allocates backing storage and hands every slot its physical
    /// descriptors. Slots whose resource is already resolvable (internal
    /// resources) are written immediately; the rest stay dirty until their
    /// first refresh.
    pub(crate) fn initialize_slots<F>(
        &mut self,
        allocator: &Arc<dyn DescriptorAllocator>,
        resolve: F,
    ) -> Result<(), HalError>
    where
        F: Fn(ResourceKey) -> Option<Arc<dyn GpuResource>>,
    {
        let counts = self.counts();
        let mut cursors: [Option<(DescriptorRange, u32)>; 4] = [None, None, None, None];
        for kind in DescriptorKind::ALL {
            let count = counts[kind.table_index()];
            if count > 0 {
                let range = allocator.alloc_static_range(kind, count)?;
                self.backing.push(range);
                cursors[kind.table_index()] = Some((range, 0));
            }
        }

        let mut take = |kind: DescriptorKind, count: u32| -> DescriptorRange {
            let (range, head) = cursors[kind.table_index()]
                .as_mut()
                .expect("descriptor counts were sized from the same slots");
            let first = range.first + *head;
            *head += count;
            debug_assert!(*head <= range.count);
            DescriptorRange { kind, first, count }
        };

        for slot in self.slots.iter_mut() {
            let buffered = if slot.per_frame { self.frame_count } else { 1 };
            for _ in 0..buffered {
                slot.free.push_back(take(slot.kind, 1).descriptor(0));
            }
            if slot.gpu_visible {
                slot.staging = Some(take(DescriptorKind::CpuView, 1).descriptor(0));
            }
            if let Some(raw) = resolve(slot.resource) {
                //stable identity, write the single shared descriptor now
                let descriptor = slot.free.pop_front().expect("just distributed");
                write_through(allocator.as_ref(), slot.staging, descriptor, &raw, &slot.view)?;
                for frame in 0..slot.current.len() {
                    slot.current[frame] = Some(descriptor);
                    slot.last_written[frame] = Some(identity(&raw));
                    slot.dirty[frame] = false;
                }
            }
        }

        for slot in self.range_slots.iter_mut() {
            let count = slot.resources.len() as u32;
            let buffered = if slot.per_frame { self.frame_count } else { 1 };
            for _ in 0..buffered {
                slot.free.push_back(take(slot.kind, count));
            }
            if slot.gpu_visible {
                slot.staging = Some(take(DescriptorKind::CpuView, count));
            }
            let raws: Option<Vec<_>> = slot.resources.iter().map(|r| resolve(*r)).collect();
            if let Some(raws) = raws {
                let run = slot.free.pop_front().expect("just distributed");
                write_range_through(allocator.as_ref(), slot.staging, run, &raws, &slot.view)?;
                let ids: Box<[usize]> = raws.iter().map(identity).collect();
                for frame in 0..slot.current.len() {
                    slot.current[frame] = Some(run);
                    slot.last_written[frame] = Some(ids.clone());
                    slot.dirty[frame] = false;
                }
            }
        }

        //transient region at the tail of the shader-visible storage
        self.transient = Some(allocator.alloc_static_range(
            DescriptorKind::GpuView,
            Self::TRANSIENT_CAPACITY * self.frame_count as u32,
        )?);
        self.allocator = Some(allocator.clone());
        Ok(())
    }

    ///Rebuilds the physical view of one slot for `frame` if the bound
    /// resource identity changed since the last write. Returns true if a
    /// write happened.
    pub(crate) fn refresh_slot(
        &mut self,
        index: SlotIndex,
        frame: usize,
        raw: &Arc<dyn GpuResource>,
    ) -> Result<bool, HalError> {
        let allocator = self
            .allocator
            .clone()
            .expect("refresh before initialize_slots");
        let slot = &mut self.slots[index.0 as usize];
        let fi = slot.frame_index(frame);
        let id = identity(raw);
        if slot.last_written[fi] == Some(id) {
            slot.dirty[fi] = false;
            return Ok(false);
        }
        //identity changed: rotate the physical descriptor through the free
        // queue so in-flight frames keep their old view intact
        if let Some(old) = slot.current[fi].take() {
            slot.free.push_back(old);
        }
        let descriptor = slot.free.pop_front().expect("slot under-provisioned");
        write_through(allocator.as_ref(), slot.staging, descriptor, raw, &slot.view)?;
        slot.current[fi] = Some(descriptor);
        slot.last_written[fi] = Some(id);
        slot.dirty[fi] = false;
        Ok(true)
    }

    pub(crate) fn refresh_range_slot(
        &mut self,
        index: RangeSlotIndex,
        frame: usize,
        raws: &[Arc<dyn GpuResource>],
    ) -> Result<bool, HalError> {
        let allocator = self
            .allocator
            .clone()
            .expect("refresh before initialize_slots");
        let slot = &mut self.range_slots[index.0 as usize];
        debug_assert_eq!(raws.len(), slot.resources.len());
        let fi = slot.frame_index(frame);
        let ids: Box<[usize]> = raws.iter().map(identity).collect();
        if slot.last_written[fi].as_deref() == Some(&ids) {
            slot.dirty[fi] = false;
            return Ok(false);
        }
        if let Some(old) = slot.current[fi].take() {
            slot.free.push_back(old);
        }
        let run = slot.free.pop_front().expect("range slot under-provisioned");
        write_range_through(allocator.as_ref(), slot.staging, run, raws, &slot.view)?;
        slot.current[fi] = Some(run);
        slot.last_written[fi] = Some(ids);
        slot.dirty[fi] = false;
        Ok(true)
    }

    ///Flags every slot referencing `resource` for a rebuild.
    pub(crate) fn mark_resource_dirty(&mut self, resource: ResourceKey) {
        for slot in self.slots.iter_mut() {
            if slot.resource == resource {
                slot.mark_dirty();
            }
        }
        for slot in self.range_slots.iter_mut() {
            if slot.resources.contains(&resource) {
                slot.mark_dirty();
            }
        }
    }

    pub fn slot(&self, index: SlotIndex) -> &ViewSlot {
        &self.slots[index.0 as usize]
    }

    pub fn range_slot(&self, index: RangeSlotIndex) -> &RangeSlot {
        &self.range_slots[index.0 as usize]
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn range_slot_count(&self) -> usize {
        self.range_slots.len()
    }

    pub(crate) fn slot_indices_for_thread(&self, thread: usize) -> Vec<SlotIndex> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.thread == thread)
            .map(|(i, _)| SlotIndex(i as u32))
            .collect()
    }

    pub(crate) fn range_indices_for_thread(&self, thread: usize) -> Vec<RangeSlotIndex> {
        self.range_slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.thread == thread)
            .map(|(i, _)| RangeSlotIndex(i as u32))
            .collect()
    }

    ///Resets the transient cursor; the driver calls this when a frame is
    /// dispatched.
    pub(crate) fn reset_transient(&self) {
        *self.transient_head.lock().unwrap() = 0;
    }

    ///Allocates `count` shader-visible descriptors out of `frame`'s transient
    /// region, valid until that frame slot is reused. Callable from any
    /// worker thread.
    pub fn alloc_transient(&self, frame: usize, count: u32) -> Result<DescriptorRange, HalError> {
        let region = self.transient.expect("transient region not initialized");
        let per_frame = Self::TRANSIENT_CAPACITY;
        let mut head = self.transient_head.lock().unwrap();
        if *head + count > per_frame {
            return Err(HalError::DescriptorsExhausted {
                kind: DescriptorKind::GpuView,
                requested: count,
                free: per_frame - *head,
            });
        }
        let first = region.first + per_frame * frame as u32 + *head;
        *head += count;
        Ok(DescriptorRange {
            kind: DescriptorKind::GpuView,
            first,
            count,
        })
    }
}

impl Drop for DescriptorSlotManager {
    fn drop(&mut self) {
        if let Some(allocator) = &self.allocator {
            for range in self.backing.drain(..) {
                allocator.free_static_range(range);
            }
            if let Some(transient) = self.transient.take() {
                allocator.free_static_range(transient);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_hal::null::NullBackend;
    use slotmap::SlotMap;

    fn keys(n: usize) -> Vec<ResourceKey> {
        let mut map: SlotMap<ResourceKey, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn interning_is_idempotent() {
        let mut mgr = DescriptorSlotManager::new(2);
        let res = keys(1)[0];
        let a = mgr.add_descriptor(0, res, ViewDesc::ShaderRead, false);
        let b = mgr.add_descriptor(0, res, ViewDesc::ShaderRead, false);
        assert_eq!(a, b);
        assert_eq!(mgr.slot_count(), 1);

        //different thread or view is a different slot
        let c = mgr.add_descriptor(1, res, ViewDesc::ShaderRead, false);
        let d = mgr.add_descriptor(0, res, ViewDesc::ShaderReadWrite, false);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(mgr.slot_count(), 3);
    }

    #[test]
    fn per_frame_slots_multiply_by_frame_count() {
        let mut mgr = DescriptorSlotManager::new(3);
        let res = keys(2);
        mgr.add_descriptor(0, res[0], ViewDesc::ShaderRead, true);
        mgr.add_descriptor(0, res[1], ViewDesc::ShaderRead, false);
        assert_eq!(mgr.counts()[DescriptorKind::GpuView.table_index()], 3 + 1);
        //one staging descriptor per shader-visible slot, never multiplied
        assert_eq!(mgr.counts()[DescriptorKind::CpuView.table_index()], 2);
    }

    #[test]
    fn shader_visible_descriptors_are_filled_through_staging() {
        let backend = NullBackend::new(1);
        let ctx = backend.context();
        let res = keys(1)[0];
        let raw = backend.external_texture(4, 4);

        let mut mgr = DescriptorSlotManager::new(1);
        let slot = mgr.add_descriptor(0, res, ViewDesc::ShaderRead, false);
        mgr.initialize_slots(&ctx.descriptors, |_| Some(raw.clone()))
            .unwrap();

        //the view is built CPU-side, then copied into its visible location
        let writes = backend.descriptors.writes();
        assert!(writes.iter().all(|(d, _, _)| d.kind == DescriptorKind::CpuView));
        let copies = backend.descriptors.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0.kind, DescriptorKind::CpuView);
        assert_eq!(
            Some(copies[0].1.descriptor(0)),
            mgr.slot(slot).descriptor(0)
        );
    }

    #[test]
    fn refresh_writes_only_on_identity_change() {
        let backend = NullBackend::new(1);
        let ctx = backend.context();
        let res = keys(1)[0];

        let mut mgr = DescriptorSlotManager::new(2);
        let slot = mgr.add_descriptor(0, res, ViewDesc::ShaderRead, true);
        mgr.initialize_slots(&ctx.descriptors, |_| None).unwrap();

        let raw_a = backend.external_texture(4, 4);
        let raw_b = backend.external_texture(4, 4);

        assert!(mgr.refresh_slot(slot, 0, &raw_a).unwrap());
        assert!(!mgr.refresh_slot(slot, 0, &raw_a).unwrap());
        assert!(mgr.refresh_slot(slot, 0, &raw_b).unwrap());
        //frame 1 tracks its own identity
        assert!(mgr.refresh_slot(slot, 1, &raw_b).unwrap());
        assert_eq!(backend.descriptors.writes().len(), 3);
    }

    #[test]
    fn transient_region_is_per_frame_bounded() {
        let backend = NullBackend::new(1);
        let ctx = backend.context();
        let mut mgr = DescriptorSlotManager::new(1);
        mgr.initialize_slots(&ctx.descriptors, |_| None).unwrap();

        let a = mgr.alloc_transient(0, 16).unwrap();
        let b = mgr.alloc_transient(0, 16).unwrap();
        assert_eq!(a.first + a.count, b.first);
        assert!(
            mgr.alloc_transient(0, DescriptorSlotManager::TRANSIENT_CAPACITY)
                .is_err()
        );
        mgr.reset_transient();
        assert!(mgr.alloc_transient(0, 16).is_ok());
    }
}
