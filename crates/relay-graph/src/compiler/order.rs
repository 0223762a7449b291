//! Dependency-edge expansion and topological ordering.

use std::collections::VecDeque;

use ahash::AHashSet;
use slotmap::SecondaryMap;

use crate::graph::{FrameGraph, PassKey};

use super::CompileError;

///The graph after aggregate endpoints were rewritten to passes and the passes
/// were brought into one global topological order.
pub(crate) struct OrderedGraph {
    ///Every pass, topologically sorted. Ties resolve by declaration order.
    pub order: Vec<PassKey>,
    ///Position of each pass within [Self::order].
    pub position: SecondaryMap<PassKey, usize>,
    ///Distinct intra-frame pass edges (head, tail).
    pub edges: Vec<(PassKey, PassKey)>,
    ///Distinct cross-frame pass edges: tail of frame N waits on head of N-1.
    pub cross_frame: Vec<(PassKey, PassKey)>,
}

///Kahn's algorithm over the pass-level edges. The ready queue is seeded and
/// drained in declaration order so repeated compiles of the same graph
/// schedule identically.
pub(crate) fn sort(graph: &FrameGraph) -> Result<OrderedGraph, CompileError> {
    let mut seen = AHashSet::new();
    let mut edges = Vec::new();
    let mut cross_frame = Vec::new();
    for edge in &graph.edges {
        let head = graph.resolve_head(edge.head)?;
        let tail = graph.resolve_tail(edge.tail)?;
        //parallel edges collapse; a dependency either exists or it doesn't
        if !seen.insert((head, tail, edge.cross_frame)) {
            continue;
        }
        if edge.cross_frame {
            cross_frame.push((head, tail));
        } else {
            edges.push((head, tail));
        }
    }

    let mut in_degree: SecondaryMap<PassKey, usize> =
        graph.passes.keys().map(|k| (k, 0)).collect();
    let mut successors: SecondaryMap<PassKey, Vec<PassKey>> =
        graph.passes.keys().map(|k| (k, Vec::new())).collect();
    for (head, tail) in &edges {
        successors[*head].push(*tail);
        in_degree[*tail] += 1;
    }

    let mut ready: VecDeque<PassKey> = graph
        .pass_order
        .iter()
        .copied()
        .filter(|k| in_degree[*k] == 0)
        .collect();
    let mut order = Vec::with_capacity(graph.passes.len());
    while let Some(pass) = ready.pop_front() {
        order.push(pass);
        for succ in &successors[pass] {
            in_degree[*succ] -= 1;
            if in_degree[*succ] == 0 {
                ready.push_back(*succ);
            }
        }
    }

    if order.len() != graph.passes.len() {
        let unordered = graph
            .pass_order
            .iter()
            .filter(|k| in_degree[**k] > 0)
            .map(|k| graph.passes[*k].name.clone())
            .collect();
        return Err(CompileError::CyclicGraph { unordered });
    }

    let position = order.iter().enumerate().map(|(i, k)| (*k, i)).collect();
    Ok(OrderedGraph {
        order,
        position,
        edges,
        cross_frame,
    })
}
