//! Minimal resource-state transition planning.
//!
//! For every resource the uses are lined up in topological order and each use
//! gets a (beg, mid, end) triple: `beg` is whatever the previous use left the
//! resource in, `mid` is the declared use state, `end` equals `mid` except for
//! the last use, which restores the chain's seed state. For external
//! resources the seed is the declared initial/final state pair; internal
//! resources are created in the seed state and their chain closes back to it,
//! so replaying the same barriers every frame stays valid. A barrier is only
//! recorded where the triple actually changes, so a chain of same-state reads
//! costs nothing.

use slotmap::SecondaryMap;

use relay_hal::ResourceState;

use crate::{
    graph::{FrameGraph, PassKey},
    resources::ResourceKey,
};

use super::order::OrderedGraph;

///A planned transition, resolved to a concrete backing at record time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompiledBarrier {
    pub resource: ResourceKey,
    pub from: ResourceState,
    pub to: ResourceState,
}

pub(crate) struct TransitionPlan {
    ///Barriers recorded before a pass's callback runs.
    pub entry: SecondaryMap<PassKey, Vec<CompiledBarrier>>,
    ///Barriers recorded after it, closing the per-frame chain.
    pub exit: SecondaryMap<PassKey, Vec<CompiledBarrier>>,
    ///State each internal resource must be created in: the declared initial
    /// state, or the first use's state when the declaration was [Undefined].
    ///
    /// [Undefined]: ResourceState::Undefined
    pub creation: SecondaryMap<ResourceKey, ResourceState>,
    pub barrier_count: usize,
}

pub(crate) fn plan(graph: &FrameGraph, ordered: &OrderedGraph) -> TransitionPlan {
    //uses per resource, ordered by the pass's topological position and
    // deduplicated per pass (extra view bindings repeat the resource)
    let mut uses: SecondaryMap<ResourceKey, Vec<(PassKey, ResourceState)>> =
        graph.resources.keys().map(|k| (k, Vec::new())).collect();
    for pass in &ordered.order {
        let decl = &graph.passes[*pass];
        for res_use in &decl.uses {
            let list = &mut uses[res_use.resource];
            if list.last().is_some_and(|(p, _)| p == pass) {
                continue;
            }
            list.push((*pass, res_use.state));
        }
    }

    let mut entry: SecondaryMap<PassKey, Vec<CompiledBarrier>> =
        graph.passes.keys().map(|k| (k, Vec::new())).collect();
    let mut exit: SecondaryMap<PassKey, Vec<CompiledBarrier>> =
        graph.passes.keys().map(|k| (k, Vec::new())).collect();
    let mut creation: SecondaryMap<ResourceKey, ResourceState> = SecondaryMap::new();
    let mut barrier_count = 0;

    for (resource, decl) in graph.resources.iter() {
        let list = &uses[resource];
        let declared = decl.kind.initial_state();
        //[Undefined] is not a state a chain can return to; internal resources
        // declared that way cycle through their first use's state instead
        let seed = if !decl.kind.is_external()
            && declared == ResourceState::Undefined
            && let Some((_, first)) = list.first()
        {
            *first
        } else {
            declared
        };
        if !decl.kind.is_external() {
            creation.insert(resource, seed);
        }

        let mut carried = seed;
        let Some(last) = list.len().checked_sub(1) else {
            continue;
        };
        for (i, (pass, state)) in list.iter().enumerate() {
            let beg = carried;
            let mid = *state;
            let end = if i == last {
                decl.kind.final_state().unwrap_or(seed)
            } else {
                mid
            };
            if beg != mid {
                entry[*pass].push(CompiledBarrier {
                    resource,
                    from: beg,
                    to: mid,
                });
                barrier_count += 1;
            }
            if mid != end {
                exit[*pass].push(CompiledBarrier {
                    resource,
                    from: mid,
                    to: end,
                });
                barrier_count += 1;
            }
            carried = end;
        }
    }

    TransitionPlan {
        entry,
        exit,
        creation,
        barrier_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compiler::order, graph::PassFn};
    use relay_hal::{Format, HeapKind, ResourceDesc};

    fn noop() -> PassFn {
        Box::new(|_| Ok(()))
    }

    fn texture() -> ResourceDesc {
        ResourceDesc::Texture2d {
            width: 8,
            height: 8,
            format: Format::Rgba8Unorm,
            mip_levels: 1,
        }
    }

    #[test]
    fn chains_are_contiguous() {
        //write -> read -> read on an [Undefined] declaration: created in the
        // first use's state, one transition into ShaderResource, nothing for
        // the repeated read, one closing transition back to the seed
        let mut graph = FrameGraph::new();
        let res = graph.add_internal_resource(
            "target",
            texture(),
            ResourceState::Undefined,
            None,
            HeapKind::Default,
        );
        let a = graph.add_pass("draw", 0, 0, noop());
        let b = graph.add_pass("sample", 0, 0, noop());
        let c = graph.add_pass("sample_again", 0, 0, noop());
        graph.pass_use(a, res, ResourceState::RenderTarget, None).unwrap();
        graph.pass_use(b, res, ResourceState::ShaderResource, None).unwrap();
        graph.pass_use(c, res, ResourceState::ShaderResource, None).unwrap();
        graph.add_dependency(a, b).unwrap();
        graph.add_dependency(b, c).unwrap();

        let ordered = order::sort(&graph).unwrap();
        let plan = plan(&graph, &ordered);
        assert_eq!(plan.creation[res], ResourceState::RenderTarget);
        assert_eq!(plan.barrier_count, 2);
        assert!(plan.entry[a].is_empty());
        assert_eq!(
            plan.entry[b],
            vec![CompiledBarrier {
                resource: res,
                from: ResourceState::RenderTarget,
                to: ResourceState::ShaderResource,
            }]
        );
        assert!(plan.entry[c].is_empty());
        assert_eq!(
            plan.exit[c],
            vec![CompiledBarrier {
                resource: res,
                from: ResourceState::ShaderResource,
                to: ResourceState::RenderTarget,
            }]
        );
    }

    #[test]
    fn internal_chains_close_back_to_the_declared_state() {
        let mut graph = FrameGraph::new();
        let res = graph.add_internal_resource(
            "scratch",
            texture(),
            ResourceState::Common,
            None,
            HeapKind::Default,
        );
        let pass = graph.add_pass("blit", 0, 0, noop());
        graph.pass_use(pass, res, ResourceState::CopyDst, None).unwrap();

        let ordered = order::sort(&graph).unwrap();
        let plan = plan(&graph, &ordered);
        assert_eq!(plan.creation[res], ResourceState::Common);
        assert_eq!(plan.entry[pass][0].from, ResourceState::Common);
        assert_eq!(plan.entry[pass][0].to, ResourceState::CopyDst);
        assert_eq!(plan.exit[pass][0].from, ResourceState::CopyDst);
        assert_eq!(plan.exit[pass][0].to, ResourceState::Common);
        assert_eq!(plan.barrier_count, 2);
    }

    #[test]
    fn external_final_state_is_restored_after_the_last_use() {
        let mut graph = FrameGraph::new();
        let res = graph.add_external_resource(
            "swapchain",
            texture(),
            ResourceState::Present,
            ResourceState::Present,
        );
        let pass = graph.add_pass("draw", 0, 0, noop());
        graph
            .pass_use(pass, res, ResourceState::RenderTarget, None)
            .unwrap();

        let ordered = order::sort(&graph).unwrap();
        let plan = plan(&graph, &ordered);
        assert_eq!(plan.barrier_count, 2);
        assert_eq!(plan.entry[pass][0].to, ResourceState::RenderTarget);
        assert_eq!(plan.exit[pass][0].to, ResourceState::Present);
    }

    #[test]
    fn matching_states_need_no_barrier_at_all() {
        let mut graph = FrameGraph::new();
        let res = graph.add_external_resource(
            "input",
            texture(),
            ResourceState::ShaderResource,
            ResourceState::ShaderResource,
        );
        let pass = graph.add_pass("sample", 0, 0, noop());
        graph
            .pass_use(pass, res, ResourceState::ShaderResource, None)
            .unwrap();

        let ordered = order::sort(&graph).unwrap();
        let plan = plan(&graph, &ordered);
        assert_eq!(plan.barrier_count, 0);
    }

    #[test]
    fn barrier_order_is_stable_across_compiles() {
        let build = || {
            let mut graph = FrameGraph::new();
            let pass = graph.add_pass("everything", 0, 0, noop());
            for i in 0..8 {
                let res = graph.add_internal_resource(
                    format!("res{i}"),
                    texture(),
                    ResourceState::Common,
                    None,
                    HeapKind::Default,
                );
                graph
                    .pass_use(pass, res, ResourceState::ShaderResource, None)
                    .unwrap();
            }
            let ordered = order::sort(&graph).unwrap();
            (plan(&graph, &ordered), pass)
        };

        let (first, pass_a) = build();
        let (second, pass_b) = build();
        assert_eq!(first.entry[pass_a], second.entry[pass_b]);
        assert_eq!(first.exit[pass_a], second.exit[pass_b]);
    }
}
