//! # Relay
//!
//! A pass-dependency compiler and multi-threaded execution runtime for
//! frame-based GPU work.
//!
//! The application declares a [FrameGraph]: resources (internally owned or
//! bound per frame from outside), passes pinned to a worker thread and a
//! hardware queue, view/table bindings and explicit dependency edges,
//! including cross-frame ones. [Compiler::compile] turns that into a
//! [Runtime]:
//!
//! - passes are topologically ordered and cut into *sections*, runs of
//!   passes on one (thread, queue) pair that record into a single command
//!   list and submit as a unit,
//! - per resource the minimal chain of state transitions is planned, so a
//!   barrier only exists where the state actually changes,
//! - every declared view binding is interned into a descriptor slot, shared
//!   across passes of the same thread,
//! - cross-queue and cross-frame ordering is expressed through timeline
//!   fences; everything else rides on dependency counters and queue order.
//!
//! Frames are then driven with [Runtime::run]: every worker thread records
//! its sections in parallel, and whichever worker drops a section's
//! dependency counter to zero submits it.
//!
//! ```no_run
//! use relay_graph::{Compiler, FrameGraph};
//! use relay_graph::hal::null::NullBackend;
//! # fn main() -> Result<(), relay_graph::RelayError> {
//! let backend = NullBackend::new(1);
//!
//! let mut graph = FrameGraph::new();
//! let draw = graph.add_pass("draw", 0, 0, Box::new(|_ctx| Ok(())));
//! let post = graph.add_pass("post", 0, 0, Box::new(|_ctx| Ok(())));
//! graph.add_dependency(draw, post)?;
//!
//! let mut runtime = Compiler::new().compile(graph, &backend.context())?;
//! runtime.run(0)?;
//! # Ok(())
//! # }
//! ```

mod compiler;
mod descriptor;
mod graph;
mod resources;
mod runtime;

pub use compiler::{CompileError, CompileStats, Compiler};
pub use descriptor::{DescriptorSlotManager, RangeSlot, RangeSlotIndex, SlotIndex, ViewSlot};
pub use graph::{
    AggregateKey, DepNode, FrameGraph, GraphError, PassFn, PassKey, ResourceUse, TableHandle,
    TableUse,
};
pub use resources::{ResourceDecl, ResourceKey, ResourceKind};
pub use runtime::{ExecError, PassContext, Runtime};

///Re-export of the backend abstraction, so applications depend on one crate.
pub use relay_hal as hal;

use thiserror::Error;

///Umbrella error for applications that do not care which stage failed.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Hal(#[from] relay_hal::HalError),
}
