//! Descriptor slot interning for every declared view binding.

use ahash::AHashMap;
use slotmap::SecondaryMap;

use relay_hal::ViewDesc;

use crate::{
    descriptor::{DescriptorSlotManager, RangeSlotIndex, SlotIndex},
    graph::{FrameGraph, PassKey},
    resources::ResourceKey,
};

pub(crate) struct SlotPlan {
    pub manager: DescriptorSlotManager,
    ///Per pass: (resource, view) to the interned slot.
    pub bindings: SecondaryMap<PassKey, AHashMap<(ResourceKey, ViewDesc), SlotIndex>>,
    ///Per pass: table slots, in declaration order of the table handles.
    pub tables: SecondaryMap<PassKey, Vec<RangeSlotIndex>>,
}

///Walks every declared binding and interns it on the slot manager. A binding
/// whose backing identity can change between frames (external resources) is
/// flagged per-frame so it gets one physical descriptor per frame slot.
pub(crate) fn intern(graph: &FrameGraph, frame_count: usize) -> SlotPlan {
    let mut manager = DescriptorSlotManager::new(frame_count);
    let mut bindings: SecondaryMap<PassKey, AHashMap<(ResourceKey, ViewDesc), SlotIndex>> =
        graph.passes.keys().map(|k| (k, AHashMap::default())).collect();
    let mut tables: SecondaryMap<PassKey, Vec<RangeSlotIndex>> =
        graph.passes.keys().map(|k| (k, Vec::new())).collect();

    for pass in &graph.pass_order {
        let decl = &graph.passes[*pass];
        for res_use in &decl.uses {
            let Some(view) = res_use.view else {
                continue;
            };
            let per_frame = graph.resources[res_use.resource].kind.is_external();
            let slot = manager.add_descriptor(decl.thread, res_use.resource, view, per_frame);
            bindings[*pass].insert((res_use.resource, view), slot);
        }
        for table in &decl.tables {
            let per_frame = table
                .resources
                .iter()
                .any(|r| graph.resources[*r].kind.is_external());
            let slot =
                manager.add_descriptor_table(decl.thread, &table.resources, table.view, per_frame);
            tables[*pass].push(slot);
        }
    }

    SlotPlan {
        manager,
        bindings,
        tables,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PassFn;
    use relay_hal::{Format, HeapKind, ResourceDesc, ResourceState};

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
    fn same_thread_same_view_shares_a_slot() {
        let mut graph = FrameGraph::new();
        let res = graph.add_internal_resource(
            "shadow",
            texture(),
            ResourceState::ShaderResource,
            None,
            HeapKind::Default,
        );
        let a = graph.add_pass("a", 0, 0, noop());
        let b = graph.add_pass("b", 0, 0, noop());
        let c = graph.add_pass("c", 1, 0, noop());
        for pass in [a, b, c] {
            graph
                .pass_use(
                    pass,
                    res,
                    ResourceState::ShaderResource,
                    Some(ViewDesc::ShaderRead),
                )
                .unwrap();
        }

        let plan = intern(&graph, 2);
        let key = (res, ViewDesc::ShaderRead);
        assert_eq!(plan.bindings[a][&key], plan.bindings[b][&key]);
        assert_ne!(plan.bindings[a][&key], plan.bindings[c][&key]);
        assert_eq!(plan.manager.slot_count(), 2);
    }

    #[test]
    fn external_bindings_are_per_frame() {
        let mut graph = FrameGraph::new();
        let res = graph.add_external_resource(
            "backbuffer",
            texture(),
            ResourceState::Common,
            ResourceState::Present,
        );
        let pass = graph.add_pass("draw", 0, 0, noop());
        graph
            .pass_use(
                pass,
                res,
                ResourceState::RenderTarget,
                Some(ViewDesc::RenderTarget),
            )
            .unwrap();

        let plan = intern(&graph, 3);
        let slot = plan.bindings[pass][&(res, ViewDesc::RenderTarget)];
        assert!(plan.manager.slot(slot).per_frame);
    }
}
