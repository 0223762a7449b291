//! # Relay HAL
//!
//! The narrow boundary between Relay's pass compiler/runtime and whatever
//! graphics backend actually executes the work. Everything the compiler needs
//! from a backend is expressed as an object-safe trait here: a [Device], a
//! fixed list of [Queue]s, timeline-style [Fence]s, [CommandList]s with their
//! [CommandAllocator]s, a [ResourceManager] that materializes internal
//! resources, and a [DescriptorAllocator] backing the view slots.
//!
//! The crate also ships a [null] backend that records every queue and
//! descriptor operation instead of talking to a GPU. The whole runtime is
//! exercisable against it, which is how Relay's own test-suite runs.

#[cfg(feature = "null")]
pub mod null;

mod context;
pub use context::ExecContext;

use std::{any::Any, fmt::Debug, sync::Arc};
use thiserror::Error;

///Errors a backend implementation may surface through the trait boundary.
#[derive(Debug, Error)]
pub enum HalError {
    #[error("descriptor storage for {kind:?} exhausted: requested {requested}, {free} free")]
    DescriptorsExhausted {
        kind: DescriptorKind,
        requested: u32,
        free: u32,
    },
    #[error("resource creation failed: {0}")]
    ResourceCreation(String),
    #[error("command list was used while not in the recording state")]
    NotRecording,
    #[error("queue submission failed: {0}")]
    Submit(String),
    #[error("backend error: {0}")]
    Backend(String),
}

///Access state a resource can be transitioned into. The compiler derives the
/// minimal chain of transitions between these per resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    ///No defined contents, only valid as the *source* of a first transition.
    Undefined,
    Common,
    RenderTarget,
    DepthWrite,
    DepthRead,
    ShaderResource,
    UnorderedAccess,
    CopySrc,
    CopyDst,
    Present,
}

impl ResourceState {
    ///True if the state allows the GPU to write through it.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ResourceState::RenderTarget
                | ResourceState::DepthWrite
                | ResourceState::UnorderedAccess
                | ResourceState::CopyDst
        )
    }
}

///Value internal resources are cleared to on first use, if any.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

///Memory heap hint for internally owned resources. The concrete allocation
/// strategy is the resource manager's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    Default,
    Upload,
    Readback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Unknown,
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    R32Uint,
    D32Float,
    D24UnormS8Uint,
}

///Shape/format description of a resource. Kept deliberately small; backends
/// that need more detail can smuggle it through their [ResourceManager].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDesc {
    Buffer {
        size: u64,
    },
    Texture2d {
        width: u32,
        height: u32,
        format: Format,
        mip_levels: u32,
    },
}

///Category of descriptor storage a view lives in. `CpuView` is the staging
/// side, `GpuView` the shader-visible side, the remaining two are the
/// specialized render-target/depth-stencil kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    CpuView,
    GpuView,
    RenderTarget,
    DepthStencil,
}

impl DescriptorKind {
    pub const ALL: [DescriptorKind; 4] = [
        DescriptorKind::CpuView,
        DescriptorKind::GpuView,
        DescriptorKind::RenderTarget,
        DescriptorKind::DepthStencil,
    ];

    pub fn table_index(&self) -> usize {
        match self {
            DescriptorKind::CpuView => 0,
            DescriptorKind::GpuView => 1,
            DescriptorKind::RenderTarget => 2,
            DescriptorKind::DepthStencil => 3,
        }
    }
}

///How a resource is bound by a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDesc {
    ///Sampled/readonly shader input.
    ShaderRead,
    ///Writable shader view.
    ShaderReadWrite,
    RenderTarget,
    DepthStencil { read_only: bool },
}

impl ViewDesc {
    ///The descriptor category views of this kind are allocated from.
    pub fn descriptor_kind(&self) -> DescriptorKind {
        match self {
            ViewDesc::ShaderRead | ViewDesc::ShaderReadWrite => DescriptorKind::GpuView,
            ViewDesc::RenderTarget => DescriptorKind::RenderTarget,
            ViewDesc::DepthStencil { .. } => DescriptorKind::DepthStencil,
        }
    }

    ///True if the view must be reachable from shaders (as opposed to the
    /// CPU-only render-target/depth-stencil kinds).
    pub fn gpu_visible(&self) -> bool {
        matches!(self, ViewDesc::ShaderRead | ViewDesc::ShaderReadWrite)
    }
}

///One physical descriptor: an index into the backing storage of its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub kind: DescriptorKind,
    pub index: u32,
}

///A contiguous run of physical descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRange {
    pub kind: DescriptorKind,
    pub first: u32,
    pub count: u32,
}

impl DescriptorRange {
    pub fn descriptor(&self, offset: u32) -> Descriptor {
        debug_assert!(offset < self.count);
        Descriptor {
            kind: self.kind,
            index: self.first + offset,
        }
    }
}

///A resource as the backend knows it. Identity (pointer equality of the
/// `Arc`) is what the runtime uses to decide whether a bound view went stale.
pub trait GpuResource: Send + Sync + Debug {
    fn desc(&self) -> ResourceDesc;
    fn as_any(&self) -> &dyn Any;
}

///A state transition recorded into a command list.
#[derive(Debug, Clone)]
pub struct Barrier {
    pub resource: Arc<dyn GpuResource>,
    pub from: ResourceState,
    pub to: ResourceState,
}

///Recorded GPU work. One list per section, rebuilt every frame.
pub trait CommandList: Send {
    ///Puts the list (back) into the recording state.
    fn reset(&mut self) -> Result<(), HalError>;
    fn barrier(&mut self, barriers: &[Barrier]) -> Result<(), HalError>;
    ///Ends recording. The list can then be submitted exactly once per reset.
    fn close(&mut self) -> Result<(), HalError>;
    ///Escape hatch for pass callbacks that talk to the native API.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

///Backing storage for command lists, one per (worker thread, frame slot).
pub trait CommandAllocator: Send {
    ///Reclaims all storage of lists recorded against this allocator. Only
    /// legal once those lists finished executing.
    fn reset(&mut self) -> Result<(), HalError>;
    fn new_list(&mut self) -> Result<Box<dyn CommandList>, HalError>;
}

///Timeline-style fence: a monotonically increasing 64 bit counter signaled
/// from a queue and waitable from both GPU and host.
pub trait Fence: Send + Sync + Debug {
    fn signaled_value(&self) -> u64;
    ///Blocks the calling thread until the fence reached `value`.
    fn wait_host(&self, value: u64) -> Result<(), HalError>;
    fn as_any(&self) -> &dyn Any;
}

///A hardware submission queue. Implementations must be internally
/// synchronized: completion fan-out means any worker may submit to any queue.
pub trait Queue: Send + Sync + Debug {
    ///Enqueues a GPU-side wait until `fence` reaches `value`.
    fn wait(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<(), HalError>;
    ///Submits a closed command list.
    fn submit(&self, list: &mut dyn CommandList) -> Result<(), HalError>;
    ///Enqueues a signal of `fence` to `value` after prior submissions.
    fn signal(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<(), HalError>;
}

///Creates the per-compile objects the runtime owns.
pub trait Device: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn new_command_allocator(&self) -> Result<Box<dyn CommandAllocator>, HalError>;
    fn new_fence(&self, initial: u64) -> Result<Arc<dyn Fence>, HalError>;
}

///Materializes internally owned resources. Allocation strategy is entirely
/// the implementation's concern.
pub trait ResourceManager: Send + Sync {
    fn create(
        &self,
        heap: HeapKind,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        clear: Option<&ClearValue>,
    ) -> Result<Arc<dyn GpuResource>, HalError>;
}

///Backs the descriptor slot manager with physical descriptor storage.
pub trait DescriptorAllocator: Send + Sync {
    fn alloc_static_range(
        &self,
        kind: DescriptorKind,
        count: u32,
    ) -> Result<DescriptorRange, HalError>;
    fn free_static_range(&self, range: DescriptorRange);
    ///(Re)writes the physical view at `dst` to reference `resource`. Only
    /// CPU-writable storage ([CpuView], [RenderTarget], [DepthStencil]) is a
    /// valid target; shader-visible descriptors are filled via [copy_views].
    ///
    /// [CpuView]: DescriptorKind::CpuView
    /// [RenderTarget]: DescriptorKind::RenderTarget
    /// [DepthStencil]: DescriptorKind::DepthStencil
    /// [copy_views]: DescriptorAllocator::copy_views
    fn write_view(
        &self,
        dst: Descriptor,
        resource: &Arc<dyn GpuResource>,
        view: &ViewDesc,
    ) -> Result<(), HalError>;
    ///Copies a run of staged [CpuView](DescriptorKind::CpuView) descriptors
    /// into their shader-visible location. `src` and `dst` must have equal
    /// counts.
    fn copy_views(&self, src: DescriptorRange, dst: DescriptorRange) -> Result<(), HalError>;
    ///Opaque handle to the shader-visible heap, for pass callbacks that bind
    /// it natively.
    fn heap(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_kind_mapping() {
        assert_eq!(
            ViewDesc::ShaderRead.descriptor_kind(),
            DescriptorKind::GpuView
        );
        assert_eq!(
            ViewDesc::DepthStencil { read_only: true }.descriptor_kind(),
            DescriptorKind::DepthStencil
        );
        assert!(!ViewDesc::RenderTarget.gpu_visible());
    }

    #[test]
    fn write_states() {
        assert!(ResourceState::UnorderedAccess.is_write());
        assert!(!ResourceState::ShaderResource.is_write());
    }
}
