//! Turns a declared [FrameGraph] into a running [Runtime].
//!
//! Compilation is a pipeline of four passes over the graph:
//! 1. [order]: aggregate endpoints are rewritten to concrete passes and the
//!    whole graph is brought into one deterministic topological order.
//! 2. [sections]: each thread's pass list is cut into sections, the units of
//!    recording and submission, and section-level dependencies are counted.
//! 3. [transitions]: per resource, the minimal chain of state transitions is
//!    planned along the topological order.
//! 4. [slots]: every declared view binding is interned into a descriptor slot.
//!
//! Afterwards internal resources are materialized, descriptor storage is
//! allocated, fences are created for every section something waits on, and
//! the worker pool is spawned.

use std::sync::{Mutex, atomic::AtomicU32};

use slotmap::SecondaryMap;
use smallvec::SmallVec;
use thiserror::Error;

use relay_hal::{ExecContext, HalError};

use crate::{
    graph::{FrameGraph, GraphError},
    resources::ResourceKind,
    runtime::{
        PassExec, PassMeta, ResourceRuntime, ResourceTable, Runtime, SectionInner, SectionRuntime,
    },
};

pub(crate) mod order;
pub(crate) mod sections;
pub(crate) mod slots;
pub(crate) mod transitions;

pub(crate) use transitions::CompiledBarrier;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(
        "invalid configuration: {threads} threads, {queues} queues, {frames} frames in flight (all must be at least 1)"
    )]
    Configuration {
        threads: usize,
        queues: usize,
        frames: usize,
    },
    #[error("pass '{pass}' targets thread {thread}, but only {count} threads are configured")]
    ThreadOutOfRange {
        pass: String,
        thread: usize,
        count: usize,
    },
    #[error("pass '{pass}' targets queue {queue}, but only {count} queues are configured")]
    QueueOutOfRange {
        pass: String,
        queue: usize,
        count: usize,
    },
    #[error("the context exposes {got} queues but the compiler is configured for {need}")]
    MissingQueues { need: usize, got: usize },
    #[error("the pass graph is cyclic, unordered passes: {unordered:?}")]
    CyclicGraph { unordered: Vec<String> },
    #[error("could not spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
    #[error("compiler invariant broken: {0}")]
    Internal(&'static str),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Hal(#[from] HalError),
}

///What the compiler made of a graph. Mostly interesting for tests and debug
/// overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileStats {
    pub passes: usize,
    pub sections: usize,
    pub fences: usize,
    pub barriers: usize,
    pub view_slots: usize,
    pub range_slots: usize,
}

impl std::fmt::Display for CompileStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} passes in {} sections, {} fences, {} barriers, {} view slots, {} table slots",
            self.passes, self.sections, self.fences, self.barriers, self.view_slots, self.range_slots
        )
    }
}

///Configures and runs graph compilation.
pub struct Compiler {
    thread_count: usize,
    queue_count: usize,
    frame_count: usize,
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler {
            thread_count: 1,
            queue_count: 1,
            frame_count: 2,
        }
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    ///Number of worker threads passes can be assigned to.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    ///Number of hardware queues passes can be assigned to.
    pub fn with_queues(mut self, queues: usize) -> Self {
        self.queue_count = queues;
        self
    }

    ///Number of frames recorded/executed concurrently. Determines how many
    /// command lists and per-frame descriptors everything is backed by.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frame_count = frames;
        self
    }

    ///Compiles `graph` against `ctx` and spawns the worker pool. The graph is
    /// consumed; pass callbacks move into the runtime.
    pub fn compile(self, mut graph: FrameGraph, ctx: &ExecContext) -> Result<Runtime, CompileError> {
        if self.thread_count == 0 || self.queue_count == 0 || self.frame_count == 0 {
            return Err(CompileError::Configuration {
                threads: self.thread_count,
                queues: self.queue_count,
                frames: self.frame_count,
            });
        }
        if ctx.queue_count() < self.queue_count {
            return Err(CompileError::MissingQueues {
                need: self.queue_count,
                got: ctx.queue_count(),
            });
        }
        for (_, pass) in graph.passes.iter() {
            if pass.thread >= self.thread_count {
                return Err(CompileError::ThreadOutOfRange {
                    pass: pass.name.clone(),
                    thread: pass.thread,
                    count: self.thread_count,
                });
            }
            if pass.queue >= self.queue_count {
                return Err(CompileError::QueueOutOfRange {
                    pass: pass.name.clone(),
                    queue: pass.queue,
                    count: self.queue_count,
                });
            }
        }

        let ordered = order::sort(&graph)?;
        let schedule = sections::cut(&graph, &ordered, self.thread_count)?;
        let mut transitions = transitions::plan(&graph, &ordered);
        let slot_plan = slots::intern(&graph, self.frame_count);
        let mut manager = slot_plan.manager;
        let mut bindings = slot_plan.bindings;
        let mut slot_tables = slot_plan.tables;

        #[cfg(feature = "logging")]
        for (idx, section) in schedule.sections.iter().enumerate() {
            log::trace!(
                "section {} on thread {} queue {}: {} passes, {} predecessors",
                idx,
                section.thread,
                section.queue,
                section.passes.len(),
                section.external_dependencies
            );
        }

        //materialize internal resources, externals start unbound
        let mut table = ResourceTable {
            entries: SecondaryMap::new(),
        };
        for (key, decl) in graph.resources.iter() {
            let runtime = match &decl.kind {
                ResourceKind::Internal {
                    initial_state,
                    clear,
                    heap,
                } => {
                    //created in the state the per-frame barrier chain starts
                    // and ends in, so every frame replays the same chain
                    let state = transitions
                        .creation
                        .get(key)
                        .copied()
                        .unwrap_or(*initial_state);
                    ResourceRuntime {
                        name: decl.name.clone(),
                        external: false,
                        frames: Vec::new(),
                        current: Some(ctx.resources.create(
                            *heap,
                            &decl.desc,
                            state,
                            clear.as_ref(),
                        )?),
                    }
                }
                ResourceKind::External { .. } => ResourceRuntime {
                    name: decl.name.clone(),
                    external: true,
                    frames: vec![None; self.frame_count],
                    current: None,
                },
            };
            table.entries.insert(key, runtime);
        }

        manager.initialize_slots(&ctx.descriptors, |key| {
            table
                .entries
                .get(key)
                .filter(|e| !e.external)
                .and_then(|e| e.current.clone())
        })?;

        //a fence per section anything waits on, nothing for the rest
        let mut fence_of: Vec<Option<usize>> = vec![None; schedule.sections.len()];
        let mut fences = Vec::new();
        for (idx, section) in schedule.sections.iter().enumerate() {
            if section.needs_fence {
                fence_of[idx] = Some(fences.len());
                fences.push(ctx.device.new_fence(0)?);
            }
        }

        //end-of-frame fence per queue; paces host-side reuse of command
        // storage even for graphs where no section needs a fence of its own
        let frame_fences = (0..self.queue_count)
            .map(|_| ctx.device.new_fence(0))
            .collect::<Result<Vec<_>, _>>()?;

        //one command allocator per (thread, frame slot)
        let mut allocators: Vec<Vec<_>> = Vec::with_capacity(self.thread_count);
        for _ in 0..self.thread_count {
            let per_thread: Result<Vec<_>, HalError> = (0..self.frame_count)
                .map(|_| ctx.device.new_command_allocator())
                .collect();
            allocators.push(per_thread?);
        }

        let fence_index = |section: usize| -> Result<usize, CompileError> {
            fence_of[section].ok_or(CompileError::Internal("wait on a fence-less section"))
        };

        let mut sections_rt = Vec::with_capacity(schedule.sections.len());
        for (idx, desc) in schedule.sections.into_iter().enumerate() {
            let label = desc
                .passes
                .iter()
                .map(|k| graph.passes[*k].name.as_str())
                .collect::<Vec<_>>()
                .join("+");

            let mut lists = Vec::with_capacity(self.frame_count);
            for slot in 0..self.frame_count {
                lists.push(allocators[desc.thread][slot].new_list()?);
            }

            let mut passes = Vec::with_capacity(desc.passes.len());
            for key in &desc.passes {
                let decl = graph
                    .passes
                    .remove(*key)
                    .ok_or(CompileError::Internal("pass scheduled twice"))?;
                let mut declared = Vec::new();
                for res_use in &decl.uses {
                    if !declared.contains(&res_use.resource) {
                        declared.push(res_use.resource);
                    }
                }
                passes.push(PassExec {
                    meta: PassMeta {
                        key: *key,
                        name: decl.name,
                        entry_barriers: std::mem::take(&mut transitions.entry[*key]),
                        exit_barriers: std::mem::take(&mut transitions.exit[*key]),
                        bindings: std::mem::take(&mut bindings[*key]),
                        tables: std::mem::take(&mut slot_tables[*key]),
                        declared,
                    },
                    callback: decl.callback,
                });
            }

            let waits = desc
                .waits
                .iter()
                .map(|s| fence_index(*s))
                .collect::<Result<SmallVec<_>, _>>()?;
            let prev_frame_waits = desc
                .prev_frame_waits
                .iter()
                .map(|s| fence_index(*s))
                .collect::<Result<SmallVec<_>, _>>()?;

            sections_rt.push(SectionRuntime {
                thread: desc.thread,
                queue: desc.queue,
                label,
                fence: fence_of[idx],
                waits,
                prev_frame_waits,
                external_dependencies: desc.external_dependencies,
                outputs: SmallVec::from_vec(desc.outputs),
                unfinished: AtomicU32::new(desc.external_dependencies + 1),
                inner: Mutex::new(SectionInner { lists, passes }),
            });
        }

        let stats = CompileStats {
            passes: ordered.order.len(),
            sections: sections_rt.len(),
            fences: fences.len(),
            barriers: transitions.barrier_count,
            view_slots: manager.slot_count(),
            range_slots: manager.range_slot_count(),
        };
        #[cfg(feature = "logging")]
        log::debug!("compiled: {stats}");

        Runtime::new(
            ctx.clone(),
            sections_rt,
            schedule.thread_sections,
            fences,
            frame_fences,
            table,
            manager,
            allocators,
            self.frame_count,
            stats,
        )
    }
}
