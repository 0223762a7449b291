//! Section cutting and section-level dependency resolution.
//!
//! A *section* is a maximal run of consecutive passes on one (thread, queue)
//! pair. A pass ends its section exactly when one of its successors lives on
//! a different (thread, queue) pair or it is the last pass of its thread;
//! incoming cross edges need no cut of their own, the dependency counter
//! holds the whole section back instead. Each section records into a single
//! command list per frame slot and is the unit of submission, fence signaling
//! and dependency counting.

use ahash::AHashSet;
use slotmap::SecondaryMap;

use crate::graph::{FrameGraph, PassKey};

use super::{CompileError, order::OrderedGraph};

pub(crate) struct SectionDesc {
    pub thread: usize,
    pub queue: usize,
    ///Passes in execution order.
    pub passes: Vec<PassKey>,
    ///Distinct predecessor sections, same-queue ones included.
    pub external_dependencies: u32,
    ///Dependent section indices notified when this section submitted.
    pub outputs: Vec<usize>,
    ///Same-frame predecessor sections on *other* queues, waited on via their
    /// fence at the current frame's value.
    pub waits: Vec<usize>,
    ///Predecessor sections waited on at the previous frame's value.
    pub prev_frame_waits: Vec<usize>,
    ///True once anything needs to wait on this section GPU-side.
    pub needs_fence: bool,
}

pub(crate) struct SectionSchedule {
    pub sections: Vec<SectionDesc>,
    pub section_of: SecondaryMap<PassKey, usize>,
    ///Execution order per worker thread.
    pub thread_sections: Vec<Vec<usize>>,
}

pub(crate) fn cut(
    graph: &FrameGraph,
    ordered: &OrderedGraph,
    thread_count: usize,
) -> Result<SectionSchedule, CompileError> {
    //passes with an edge to a different (thread, queue); such an edge forces
    // a boundary after its head so the head's section can submit on its own
    let mut outgoing_cross: AHashSet<PassKey> = AHashSet::default();
    for (head, tail) in &ordered.edges {
        let h = &graph.passes[*head];
        let t = &graph.passes[*tail];
        if (h.thread, h.queue) != (t.thread, t.queue) {
            outgoing_cross.insert(*head);
        }
    }

    let mut sections: Vec<SectionDesc> = Vec::new();
    let mut section_of: SecondaryMap<PassKey, usize> = SecondaryMap::new();
    let mut thread_sections = vec![Vec::new(); thread_count];

    for thread in 0..thread_count {
        let mut current: Option<usize> = None;
        for pass in ordered.order.iter().filter(|k| graph.passes[**k].thread == thread) {
            let decl = &graph.passes[*pass];
            let boundary = match current {
                None => true,
                Some(idx) => {
                    let section = &sections[idx];
                    section.queue != decl.queue
                        || section
                            .passes
                            .last()
                            .is_some_and(|prev| outgoing_cross.contains(prev))
                }
            };
            if boundary {
                let idx = sections.len();
                sections.push(SectionDesc {
                    thread,
                    queue: decl.queue,
                    passes: Vec::new(),
                    external_dependencies: 0,
                    outputs: Vec::new(),
                    waits: Vec::new(),
                    prev_frame_waits: Vec::new(),
                    needs_fence: false,
                });
                thread_sections[thread].push(idx);
                current = Some(idx);
            }
            let idx = current.ok_or(CompileError::Internal("section cursor lost"))?;
            sections[idx].passes.push(*pass);
            section_of.insert(*pass, idx);
        }
    }

    //distinct section-to-section relationships drive the dependency counters;
    // only cross-queue ones additionally need a fence
    let mut relations: AHashSet<(usize, usize)> = AHashSet::default();
    for (head, tail) in &ordered.edges {
        let sh = section_of[*head];
        let st = section_of[*tail];
        if sh == st || !relations.insert((sh, st)) {
            continue;
        }
        sections[st].external_dependencies += 1;
        sections[sh].outputs.push(st);
        if sections[sh].queue != sections[st].queue {
            sections[st].waits.push(sh);
            sections[sh].needs_fence = true;
        }
    }

    //cross-frame edges never count into the same-frame counters; they only
    // order submissions against the previous frame's fence values
    let mut prev_relations: AHashSet<(usize, usize)> = AHashSet::default();
    for (head, tail) in &ordered.cross_frame {
        let sh = section_of[*head];
        let st = section_of[*tail];
        if !prev_relations.insert((sh, st)) {
            continue;
        }
        sections[st].prev_frame_waits.push(sh);
        sections[sh].needs_fence = true;
    }

    Ok(SectionSchedule {
        sections,
        section_of,
        thread_sections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compiler::order, graph::PassFn};

    fn noop() -> PassFn {
        Box::new(|_| Ok(()))
    }

    #[test]
    fn unrelated_passes_on_one_thread_share_a_section() {
        let mut graph = FrameGraph::new();
        let a = graph.add_pass("a", 0, 0, noop());
        let b = graph.add_pass("b", 0, 0, noop());
        graph.add_dependency(a, b).unwrap();

        let ordered = order::sort(&graph).unwrap();
        let schedule = cut(&graph, &ordered, 1).unwrap();
        assert_eq!(schedule.sections.len(), 1);
        assert_eq!(schedule.sections[0].passes, vec![a, b]);
        assert_eq!(schedule.sections[0].external_dependencies, 0);
    }

    #[test]
    fn cross_thread_edge_cuts_at_the_boundary() {
        //a -> b with b on another thread, then c back on the first thread
        // depending on b: the first thread must split around the excursion
        let mut graph = FrameGraph::new();
        let a = graph.add_pass("a", 0, 0, noop());
        let b = graph.add_pass("b", 1, 0, noop());
        let c = graph.add_pass("c", 0, 0, noop());
        graph.add_dependency(a, b).unwrap();
        graph.add_dependency(b, c).unwrap();

        let ordered = order::sort(&graph).unwrap();
        let schedule = cut(&graph, &ordered, 2).unwrap();
        assert_eq!(schedule.sections.len(), 3);
        assert_ne!(schedule.section_of[a], schedule.section_of[c]);

        let sb = &schedule.sections[schedule.section_of[b]];
        let sc = &schedule.sections[schedule.section_of[c]];
        assert_eq!(sb.external_dependencies, 1);
        assert_eq!(sc.external_dependencies, 1);
        //same queue everywhere, so ordering rides on submission order alone
        assert!(sb.waits.is_empty() && sc.waits.is_empty());
        assert!(!schedule.sections.iter().any(|s| s.needs_fence));
    }

    #[test]
    fn queue_change_cuts_even_on_one_thread() {
        let mut graph = FrameGraph::new();
        let a = graph.add_pass("a", 0, 0, noop());
        let b = graph.add_pass("b", 0, 1, noop());
        graph.add_dependency(a, b).unwrap();

        let ordered = order::sort(&graph).unwrap();
        let schedule = cut(&graph, &ordered, 1).unwrap();
        assert_eq!(schedule.sections.len(), 2);

        let sa = &schedule.sections[schedule.section_of[a]];
        let sb = &schedule.sections[schedule.section_of[b]];
        assert!(sa.needs_fence);
        assert_eq!(sb.waits, vec![schedule.section_of[a]]);
    }

    #[test]
    fn fan_in_counts_every_distinct_predecessor_section() {
        let mut graph = FrameGraph::new();
        let heads: Vec<_> = (0..3)
            .map(|i| graph.add_pass(format!("h{i}"), i + 1, 0, noop()))
            .collect();
        let sink = graph.add_pass("sink", 0, 0, noop());
        for head in &heads {
            graph.add_dependency(*head, sink).unwrap();
        }

        let ordered = order::sort(&graph).unwrap();
        let schedule = cut(&graph, &ordered, 4).unwrap();
        let s = &schedule.sections[schedule.section_of[sink]];
        assert_eq!(s.external_dependencies, 3);
    }

    #[test]
    fn cross_edge_tails_do_not_cut_their_thread() {
        //only the head side of a cross edge ends a section; the tail merges
        // into whatever its own thread was recording anyway
        let mut graph = FrameGraph::new();
        let a = graph.add_pass("a", 0, 0, noop());
        let b = graph.add_pass("b", 1, 0, noop());
        let x = graph.add_pass("x", 0, 0, noop());
        graph.add_dependency(b, x).unwrap();

        let ordered = order::sort(&graph).unwrap();
        let schedule = cut(&graph, &ordered, 2).unwrap();
        assert_eq!(schedule.sections.len(), 2);
        assert_eq!(schedule.section_of[a], schedule.section_of[x]);

        let s = &schedule.sections[schedule.section_of[x]];
        assert_eq!(s.passes, vec![a, x]);
        assert_eq!(s.external_dependencies, 1);
    }

    #[test]
    fn cross_frame_edges_do_not_feed_the_counter() {
        let mut graph = FrameGraph::new();
        let pass = graph.add_pass("feedback", 0, 0, noop());
        graph.add_cross_frame_dependency(pass, pass).unwrap();

        let ordered = order::sort(&graph).unwrap();
        let schedule = cut(&graph, &ordered, 1).unwrap();
        let s = &schedule.sections[0];
        assert_eq!(s.external_dependencies, 0);
        assert_eq!(s.prev_frame_waits, vec![0]);
        assert!(s.needs_fence);
    }
}
