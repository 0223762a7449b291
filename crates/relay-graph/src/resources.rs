use relay_hal::{ClearValue, HeapKind, ResourceDesc, ResourceState};

slotmap::new_key_type!(
    ///Handle to a resource declared on a [FrameGraph](crate::FrameGraph).
    /// Stable from declaration until the graph is consumed by `compile`.
    pub struct ResourceKey;
);

///Where a resource's backing comes from.
///
/// `Internal` resources are owned by the runtime for as long as the compiled
/// graph lives and are materialized through the resource manager at compile
/// time. `External` resources are supplied by the application per frame and
/// only carry their declared entry/exit states.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceKind {
    Internal {
        initial_state: ResourceState,
        clear: Option<ClearValue>,
        heap: HeapKind,
    },
    External {
        initial_state: ResourceState,
        final_state: ResourceState,
    },
}

impl ResourceKind {
    pub fn initial_state(&self) -> ResourceState {
        match self {
            ResourceKind::Internal { initial_state, .. } => *initial_state,
            ResourceKind::External { initial_state, .. } => *initial_state,
        }
    }

    ///The state the resource must be left in after its last use within a
    /// frame. Internal resources have no obligation beyond their last use.
    pub fn final_state(&self) -> Option<ResourceState> {
        match self {
            ResourceKind::Internal { .. } => None,
            ResourceKind::External { final_state, .. } => Some(*final_state),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, ResourceKind::External { .. })
    }
}

///A declared resource, owned by the graph arena until compilation.
#[derive(Debug, Clone)]
pub struct ResourceDecl {
    pub name: String,
    pub desc: ResourceDesc,
    pub kind: ResourceKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_hal::Format;

    fn desc() -> ResourceDesc {
        ResourceDesc::Texture2d {
            width: 4,
            height: 4,
            format: Format::Rgba8Unorm,
            mip_levels: 1,
        }
    }

    #[test]
    fn external_final_state() {
        let kind = ResourceKind::External {
            initial_state: ResourceState::Common,
            final_state: ResourceState::Present,
        };
        assert!(kind.is_external());
        assert_eq!(kind.final_state(), Some(ResourceState::Present));
        assert_eq!(kind.initial_state(), ResourceState::Common);
        let _ = ResourceDecl {
            name: "swapchain".into(),
            desc: desc(),
            kind,
        };
    }

    #[test]
    fn internal_has_no_final_obligation() {
        let kind = ResourceKind::Internal {
            initial_state: ResourceState::Undefined,
            clear: None,
            heap: HeapKind::Default,
        };
        assert_eq!(kind.final_state(), None);
    }
}
