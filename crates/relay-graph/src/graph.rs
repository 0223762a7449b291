use slotmap::SlotMap;
use thiserror::Error;

use relay_hal::{ClearValue, HeapKind, ResourceDesc, ResourceState, ViewDesc};

use crate::{
    ExecError,
    resources::{ResourceDecl, ResourceKey, ResourceKind},
    runtime::PassContext,
};

slotmap::new_key_type!(
    ///Handle to a pass declared on a [FrameGraph].
    pub struct PassKey;
);
slotmap::new_key_type!(
    ///Handle to an aggregate (a named pass group with entry/exit wiring).
    pub struct AggregateKey;
);

///User callback invoked once per frame per pass, on the pass's worker thread.
pub type PassFn = Box<dyn FnMut(&mut PassContext<'_>) -> Result<(), ExecError> + Send>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(
        "pass '{pass}' declares resource '{resource}' twice with conflicting states {first:?} and {second:?}"
    )]
    DuplicateDeclaration {
        pass: String,
        resource: String,
        first: ResourceState,
        second: ResourceState,
    },
    #[error("unknown resource handle")]
    UnknownResource,
    #[error("unknown pass handle")]
    UnknownPass,
    #[error("unknown aggregate handle")]
    UnknownAggregate,
    #[error("aggregate '{0}' has no entry pass but is used as a dependency tail")]
    AggregateWithoutEntry(String),
    #[error("aggregate '{0}' has no exit pass but is used as a dependency head")]
    AggregateWithoutExit(String),
    #[error("a pass cannot depend on itself within one frame")]
    SelfDependency,
}

///One declared resource usage of a pass.
#[derive(Debug, Clone)]
pub struct ResourceUse {
    pub resource: ResourceKey,
    pub state: ResourceState,
    ///Some if the pass binds the resource through a descriptor slot.
    pub view: Option<ViewDesc>,
}

///A table-style binding: a contiguous run of views over several resources,
/// interned at table granularity.
#[derive(Debug, Clone)]
pub struct TableUse {
    pub resources: Vec<ResourceKey>,
    pub state: ResourceState,
    pub view: ViewDesc,
}

///Handle identifying a declared table binding, valid for descriptor lookup
/// from within the owning pass's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableHandle {
    pub(crate) pass: PassKey,
    pub(crate) index: usize,
}

pub(crate) struct PassDecl {
    pub name: String,
    pub thread: usize,
    pub queue: usize,
    pub callback: PassFn,
    pub uses: Vec<ResourceUse>,
    pub tables: Vec<TableUse>,
}

pub(crate) struct AggregateDecl {
    pub name: String,
    pub entry: Option<PassKey>,
    pub exit: Option<PassKey>,
}

///Either endpoint of a dependency edge. Aggregate endpoints are rewritten to
/// their entry/exit pass when the graph is compiled.
#[derive(Debug, Clone, Copy)]
pub enum DepNode {
    Pass(PassKey),
    Aggregate(AggregateKey),
}

impl From<PassKey> for DepNode {
    fn from(k: PassKey) -> Self {
        DepNode::Pass(k)
    }
}

impl From<AggregateKey> for DepNode {
    fn from(k: AggregateKey) -> Self {
        DepNode::Aggregate(k)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EdgeDecl {
    pub head: DepNode,
    pub tail: DepNode,
    ///Tail of frame N depends on head of frame N-1.
    pub cross_frame: bool,
}

///Declarative pass/resource/dependency graph. Everything lives in arenas and
/// is addressed through keys; the graph is immutable once handed to
/// [Compiler::compile](crate::Compiler::compile).
pub struct FrameGraph {
    pub(crate) resources: SlotMap<ResourceKey, ResourceDecl>,
    pub(crate) passes: SlotMap<PassKey, PassDecl>,
    pub(crate) aggregates: SlotMap<AggregateKey, AggregateDecl>,
    ///Declaration order of passes; the topological sort seeds from this so
    /// compilation stays deterministic.
    pub(crate) pass_order: Vec<PassKey>,
    pub(crate) edges: Vec<EdgeDecl>,
}

impl FrameGraph {
    pub fn new() -> Self {
        FrameGraph {
            resources: SlotMap::with_key(),
            passes: SlotMap::with_key(),
            aggregates: SlotMap::with_key(),
            pass_order: Vec::new(),
            edges: Vec::new(),
        }
    }

    ///Declares a resource owned by the compiled runtime. It is materialized
    /// through the resource manager at compile time and lives as long as the
    /// graph does.
    pub fn add_internal_resource(
        &mut self,
        name: impl Into<String>,
        desc: ResourceDesc,
        initial_state: ResourceState,
        clear: Option<ClearValue>,
        heap: HeapKind,
    ) -> ResourceKey {
        self.resources.insert(ResourceDecl {
            name: name.into(),
            desc,
            kind: ResourceKind::Internal {
                initial_state,
                clear,
                heap,
            },
        })
    }

    ///Declares a resource whose backing the application supplies per frame
    /// through [Runtime::set_external_resource](crate::Runtime::set_external_resource).
    pub fn add_external_resource(
        &mut self,
        name: impl Into<String>,
        desc: ResourceDesc,
        initial_state: ResourceState,
        final_state: ResourceState,
    ) -> ResourceKey {
        self.resources.insert(ResourceDecl {
            name: name.into(),
            desc,
            kind: ResourceKind::External {
                initial_state,
                final_state,
            },
        })
    }

    ///Adds a pass assigned to `thread` and `queue`. Index validity is only
    /// checked against the configured counts at compile time.
    pub fn add_pass(
        &mut self,
        name: impl Into<String>,
        thread: usize,
        queue: usize,
        callback: PassFn,
    ) -> PassKey {
        let key = self.passes.insert(PassDecl {
            name: name.into(),
            thread,
            queue,
            callback,
            uses: Vec::new(),
            tables: Vec::new(),
        });
        self.pass_order.push(key);
        key
    }

    ///Declares that `pass` uses `resource` in `state`, optionally bound
    /// through a descriptor view. Declaring the same resource again with the
    /// same state is idempotent; a conflicting state is an error.
    pub fn pass_use(
        &mut self,
        pass: PassKey,
        resource: ResourceKey,
        state: ResourceState,
        view: Option<ViewDesc>,
    ) -> Result<(), GraphError> {
        if !self.resources.contains_key(resource) {
            return Err(GraphError::UnknownResource);
        }
        let decl = self.passes.get_mut(pass).ok_or(GraphError::UnknownPass)?;

        if let Some(prev) = decl.uses.iter().find(|u| u.resource == resource) {
            if prev.state != state {
                return Err(GraphError::DuplicateDeclaration {
                    pass: decl.name.clone(),
                    resource: self.resources[resource].name.clone(),
                    first: prev.state,
                    second: state,
                });
            }
            //same state again: only remember a new view binding
            if view.is_some() && !decl.uses.iter().any(|u| u.resource == resource && u.view == view)
            {
                decl.uses.push(ResourceUse {
                    resource,
                    state,
                    view,
                });
            }
            return Ok(());
        }

        decl.uses.push(ResourceUse {
            resource,
            state,
            view,
        });
        Ok(())
    }

    ///Declares a contiguous table of views over `resources`, all used in
    /// `state`. Returns the handle the pass callback uses to look the table
    /// up.
    pub fn pass_use_table(
        &mut self,
        pass: PassKey,
        resources: &[ResourceKey],
        state: ResourceState,
        view: ViewDesc,
    ) -> Result<TableHandle, GraphError> {
        for res in resources {
            if !self.resources.contains_key(*res) {
                return Err(GraphError::UnknownResource);
            }
        }
        //each table member also participates in state transitions
        for res in resources {
            self.pass_use(pass, *res, state, None)?;
        }
        let decl = self.passes.get_mut(pass).ok_or(GraphError::UnknownPass)?;
        decl.tables.push(TableUse {
            resources: resources.to_vec(),
            state,
            view,
        });
        Ok(TableHandle {
            pass,
            index: decl.tables.len() - 1,
        })
    }

    ///Adds a named pass group. Dependencies declared against the aggregate
    /// are rewritten to `entry`/`exit` at compile time; the aggregate itself
    /// never schedules.
    pub fn add_aggregate(
        &mut self,
        name: impl Into<String>,
        entry: Option<PassKey>,
        exit: Option<PassKey>,
    ) -> AggregateKey {
        self.aggregates.insert(AggregateDecl {
            name: name.into(),
            entry,
            exit,
        })
    }

    ///Orders `tail` after `head` within a frame.
    pub fn add_dependency(
        &mut self,
        head: impl Into<DepNode>,
        tail: impl Into<DepNode>,
    ) -> Result<(), GraphError> {
        self.add_edge(head.into(), tail.into(), false)
    }

    ///Orders `tail` of frame N after `head` of frame N-1. Does not constrain
    /// the order within a single frame.
    pub fn add_cross_frame_dependency(
        &mut self,
        head: impl Into<DepNode>,
        tail: impl Into<DepNode>,
    ) -> Result<(), GraphError> {
        self.add_edge(head.into(), tail.into(), true)
    }

    fn add_edge(&mut self, head: DepNode, tail: DepNode, cross_frame: bool) -> Result<(), GraphError> {
        self.check_node(head)?;
        self.check_node(tail)?;
        if let (DepNode::Pass(h), DepNode::Pass(t)) = (head, tail) {
            if h == t && !cross_frame {
                return Err(GraphError::SelfDependency);
            }
        }
        self.edges.push(EdgeDecl {
            head,
            tail,
            cross_frame,
        });
        Ok(())
    }

    fn check_node(&self, node: DepNode) -> Result<(), GraphError> {
        match node {
            DepNode::Pass(p) if !self.passes.contains_key(p) => Err(GraphError::UnknownPass),
            DepNode::Aggregate(a) if !self.aggregates.contains_key(a) => {
                Err(GraphError::UnknownAggregate)
            }
            _ => Ok(()),
        }
    }

    ///Resolves an edge head to the pass that actually signals it.
    pub(crate) fn resolve_head(&self, node: DepNode) -> Result<PassKey, GraphError> {
        match node {
            DepNode::Pass(p) => Ok(p),
            DepNode::Aggregate(a) => {
                let agg = &self.aggregates[a];
                agg.exit
                    .ok_or_else(|| GraphError::AggregateWithoutExit(agg.name.clone()))
            }
        }
    }

    ///Resolves an edge tail to the pass that actually waits on it.
    pub(crate) fn resolve_tail(&self, node: DepNode) -> Result<PassKey, GraphError> {
        match node {
            DepNode::Pass(p) => Ok(p),
            DepNode::Aggregate(a) => {
                let agg = &self.aggregates[a];
                agg.entry
                    .ok_or_else(|| GraphError::AggregateWithoutEntry(agg.name.clone()))
            }
        }
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

impl Default for FrameGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_hal::Format;

    fn texture() -> ResourceDesc {
        ResourceDesc::Texture2d {
            width: 16,
            height: 16,
            format: Format::Rgba8Unorm,
            mip_levels: 1,
        }
    }

    fn noop() -> PassFn {
        Box::new(|_| Ok(()))
    }

    #[test]
    fn conflicting_states_are_rejected() {
        let mut graph = FrameGraph::new();
        let res = graph.add_internal_resource(
            "target",
            texture(),
            ResourceState::Undefined,
            None,
            HeapKind::Default,
        );
        let pass = graph.add_pass("draw", 0, 0, noop());
        graph
            .pass_use(pass, res, ResourceState::RenderTarget, None)
            .unwrap();
        //same state again is fine
        graph
            .pass_use(pass, res, ResourceState::RenderTarget, None)
            .unwrap();
        let err = graph
            .pass_use(pass, res, ResourceState::ShaderResource, None)
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateDeclaration { .. }));
    }

    #[test]
    fn aggregate_edges_resolve_to_entry_and_exit() {
        let mut graph = FrameGraph::new();
        let entry = graph.add_pass("entry", 0, 0, noop());
        let exit = graph.add_pass("exit", 0, 0, noop());
        let post = graph.add_pass("post", 0, 0, noop());
        let agg = graph.add_aggregate("gbuffer", Some(entry), Some(exit));
        graph.add_dependency(agg, post).unwrap();

        let edge = graph.edges[0];
        assert_eq!(graph.resolve_head(edge.head).unwrap(), exit);
        assert_eq!(graph.resolve_tail(edge.tail).unwrap(), post);
    }

    #[test]
    fn self_dependency_is_only_legal_across_frames() {
        let mut graph = FrameGraph::new();
        let pass = graph.add_pass("feedback", 0, 0, noop());
        assert!(graph.add_dependency(pass, pass).is_err());
        assert!(graph.add_cross_frame_dependency(pass, pass).is_ok());
    }
}
