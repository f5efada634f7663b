// normalize.rs — Canonicalize a validated flow graph for stage planning
//
// Five rewrite passes, applied once each in this order:
//   1. inline_flow_parts:  flatten nested flows into the parent arena
//   2. insert_checkpoints: materialize diverging shuffle outputs and stage heads
//   3. insert_identities:  give map-less transitions an explicit map body
//   4. split_identities:   one identity per (incoming, outgoing) connection pair
//   5. reduce_identities:  drop every identity that is not a map body
//
// Preconditions: `graph` passed `validate`.
// Postconditions: `verify_normalized(graph).all_pass()`; running `normalize`
//                 again leaves the structure unchanged.
// Failure modes: none (rewrites are total on validated graphs).
// Side effects: mutates `graph` in place.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::graph::{Boundary, DataType, ElementKind, FlowGraph, Port};
use crate::id::{ElementId, PortId};
use crate::pass::StageCert;

// ── Driver ──────────────────────────────────────────────────────────────────

/// Number of rewrites each pass performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub flow_parts_inlined: usize,
    pub checkpoints_inserted: usize,
    pub identities_inserted: usize,
    pub identities_split: usize,
    pub identities_removed: usize,
}

/// Run all normalization passes in order.
pub fn normalize(graph: &mut FlowGraph) -> NormalizeStats {
    let stats = NormalizeStats {
        flow_parts_inlined: inline_flow_parts(graph),
        checkpoints_inserted: insert_checkpoints(graph),
        identities_inserted: insert_identities(graph),
        identities_split: split_identities(graph),
        identities_removed: reduce_identities(graph),
    };
    tracing::debug!(?stats, elements = graph.len(), "normalized flow graph");
    stats
}

// ── 1. Flow part inlining ───────────────────────────────────────────────────

/// Replace every flow part with its inner elements until none remain.
/// Returns the number of flow parts inlined.
pub fn inline_flow_parts(graph: &mut FlowGraph) -> usize {
    let mut count = 0;
    loop {
        let parts: Vec<ElementId> = graph
            .elements()
            .filter(|e| matches!(e.kind, ElementKind::FlowPart(_)))
            .map(|e| e.id)
            .collect();
        if parts.is_empty() {
            return count;
        }
        for part in parts {
            inline_one(graph, part);
            count += 1;
        }
    }
}

fn inline_one(graph: &mut FlowGraph, part: ElementId) {
    let Some(elem) = graph.get(part) else {
        return;
    };
    let upstreams: Vec<Vec<PortId>> = elem.inputs.iter().map(|&p| graph.opposites(p)).collect();
    let downstreams: Vec<Vec<PortId>> =
        elem.outputs.iter().map(|&p| graph.opposites(p)).collect();

    let Some(elem) = graph.remove_element(part) else {
        return;
    };
    let ElementKind::FlowPart(inner) = elem.kind else {
        return;
    };
    let prefix = elem.name;

    let mut port_map: HashMap<PortId, PortId> = HashMap::new();
    let mut entries = Vec::new();
    let mut exits = Vec::new();

    for ie in inner.elements() {
        let name = format!("{prefix}.{}", ie.name);
        let new_id = match &ie.kind {
            ElementKind::Input => {
                let id = graph.add_pseudo(name, first_type(&inner, &ie.outputs), Boundary::None);
                entries.push(id);
                id
            }
            ElementKind::Output => {
                let id = graph.add_pseudo(name, first_type(&inner, &ie.inputs), Boundary::None);
                exits.push(id);
                id
            }
            ElementKind::Operator(desc) => graph.add_operator(
                name,
                desc.clone(),
                ie.inputs.iter().map(|p| inner.port_decl(*p)).collect(),
                ie.outputs.iter().map(|p| inner.port_decl(*p)).collect(),
                ie.boundary,
            ),
            ElementKind::Pseudo => {
                graph.add_pseudo(name, first_type(&inner, &ie.inputs), ie.boundary)
            }
            ElementKind::FlowPart(nested) => graph.add_flow_part(name, (**nested).clone()),
        };
        let ne = graph.element(new_id);
        match ie.kind {
            // Exposed inputs keep their inner output side; the new input side
            // receives the parent's connections below.
            ElementKind::Input => {
                port_map.extend(ie.outputs.iter().copied().zip(ne.outputs.iter().copied()))
            }
            ElementKind::Output => {
                port_map.extend(ie.inputs.iter().copied().zip(ne.inputs.iter().copied()))
            }
            _ => {
                port_map.extend(ie.inputs.iter().copied().zip(ne.inputs.iter().copied()));
                port_map.extend(ie.outputs.iter().copied().zip(ne.outputs.iter().copied()));
            }
        }
    }

    for c in inner.connections() {
        if let (Some(&u), Some(&d)) = (port_map.get(&c.upstream), port_map.get(&c.downstream)) {
            graph.connect(u, d);
        }
    }
    for (ups, &entry) in upstreams.iter().zip(&entries) {
        let pin = graph.element(entry).inputs[0];
        for &u in ups {
            graph.connect(u, pin);
        }
    }
    for (downs, &exit) in downstreams.iter().zip(&exits) {
        let pout = graph.element(exit).outputs[0];
        for &d in downs {
            graph.connect(pout, d);
        }
    }
    tracing::trace!(part = %prefix, elements = inner.len(), "inlined flow part");
}

fn first_type(graph: &FlowGraph, ports: &[PortId]) -> DataType {
    ports
        .first()
        .and_then(|p| graph.get_port(*p))
        .map(|p: &Port| p.data_type.clone())
        .unwrap_or_else(|| DataType::new(""))
}

// ── 2. Checkpoints ──────────────────────────────────────────────────────────

/// Insert checkpoints after diverging shuffle elements and in front of stage
/// heads. Returns the number of checkpoints inserted.
pub fn insert_checkpoints(graph: &mut FlowGraph) -> usize {
    let mut inserted = 0;

    let shuffles: Vec<ElementId> = graph
        .elements()
        .filter(|e| e.is_shuffle_boundary())
        .map(|e| e.id)
        .collect();
    for e in shuffles {
        if !diverges(graph, e) {
            continue;
        }
        for port in graph.element(e).outputs.clone() {
            let downs = graph.opposites(port);
            if downs.is_empty() || downs.iter().all(|d| graph.is_checkpoint(graph.owner(*d))) {
                continue;
            }
            graph.insert_pseudo_after(port, Boundary::Stage);
            inserted += 1;
        }
    }

    let heads: Vec<ElementId> = graph
        .elements()
        .filter(|e| e.is_stage_head())
        .map(|e| e.id)
        .collect();
    for head in heads {
        for conn in graph.incoming(head) {
            if !graph.is_stage_boundary(graph.owner(conn.upstream)) {
                graph.insert_pseudo_on(conn, Boundary::Stage);
                inserted += 1;
            }
        }
    }

    tracing::trace!(inserted, "inserted checkpoints");
    inserted
}

/// A shuffle element diverges when its reduce side cannot stay inside one
/// reducer: the region downstream of it reaches another shuffle, or merges
/// data that did not come through it.
fn diverges(graph: &FlowGraph, shuffle: ElementId) -> bool {
    let mut region: HashSet<ElementId> = HashSet::new();
    let mut queue: VecDeque<ElementId> = graph.successors(shuffle).into();
    while let Some(id) = queue.pop_front() {
        if id == shuffle {
            continue;
        }
        if graph.is_boundary(id) {
            if graph.is_shuffle_boundary(id) {
                return true;
            }
            continue;
        }
        if region.insert(id) {
            queue.extend(graph.successors(id));
        }
    }
    region.iter().any(|&r| {
        graph
            .predecessors(r)
            .iter()
            .any(|p| *p != shuffle && !region.contains(p))
    })
}

// ── 3. Identities ───────────────────────────────────────────────────────────

/// Insert an identity on every connection from a stage boundary straight into
/// a shuffle element or a stage head. Returns the number inserted.
pub fn insert_identities(graph: &mut FlowGraph) -> usize {
    let mut inserted = 0;
    for conn in graph.connections().to_vec() {
        let up = graph.owner(conn.upstream);
        let down = graph.owner(conn.downstream);
        if graph.is_stage_boundary(up)
            && (graph.is_shuffle_boundary(down) || graph.is_stage_head(down))
        {
            graph.insert_pseudo_on(conn, Boundary::None);
            inserted += 1;
        }
    }
    tracing::trace!(inserted, "inserted identities");
    inserted
}

// ── 4. Split ────────────────────────────────────────────────────────────────

/// Replace each identity that has several incoming and several outgoing
/// connections with one identity per pair. Returns the number of identities
/// that were split.
pub fn split_identities(graph: &mut FlowGraph) -> usize {
    let mut split = 0;
    for id in identities(graph) {
        let incoming = graph.incoming(id);
        let outgoing = graph.outgoing(id);
        if incoming.len() <= 1 || outgoing.len() <= 1 {
            continue;
        }
        let elem = graph.element(id);
        let name = elem.name.clone();
        let data_type = first_type(graph, &elem.inputs);
        let mut n = 0;
        for i in &incoming {
            for o in &outgoing {
                n += 1;
                let copy = graph.add_pseudo(format!("{name}~{n}"), data_type.clone(), Boundary::None);
                let (pin, pout) = {
                    let c = graph.element(copy);
                    (c.inputs[0], c.outputs[0])
                };
                graph.connect(i.upstream, pin);
                graph.connect(pout, o.downstream);
            }
        }
        graph.remove_element(id);
        split += 1;
    }
    tracing::trace!(split, "split identities");
    split
}

// ── 5. Reduce ───────────────────────────────────────────────────────────────

/// Bypass every identity except those forming a map body: fed only by stage
/// boundaries and feeding only boundaries. Returns the number removed.
pub fn reduce_identities(graph: &mut FlowGraph) -> usize {
    let mut removed = 0;
    for id in identities(graph) {
        if !graph.contains(id) || is_map_body(graph, id) {
            continue;
        }
        graph.bypass(id);
        removed += 1;
    }
    tracing::trace!(removed, "reduced identities");
    removed
}

fn is_map_body(graph: &FlowGraph, id: ElementId) -> bool {
    let preds = graph.predecessors(id);
    let succs = graph.successors(id);
    !preds.is_empty()
        && !succs.is_empty()
        && preds.iter().all(|p| graph.is_stage_boundary(*p))
        && succs.iter().all(|s| graph.is_boundary(*s))
}

fn identities(graph: &FlowGraph) -> Vec<ElementId> {
    graph
        .elements()
        .filter(|e| e.is_identity())
        .map(|e| e.id)
        .collect()
}

// ── Certificate ─────────────────────────────────────────────────────────────

/// Postconditions of normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeCert {
    /// N1: no flow part remains.
    pub n1_flat: bool,
    /// N2: no identity has several incoming and several outgoing connections.
    pub n2_identities_split: bool,
    /// N3: every identity is a map body.
    pub n3_identities_minimal: bool,
    /// N4: every shuffle element is fed through a map body.
    pub n4_shuffle_fed_by_map: bool,
    /// N5: every stage head reads materialized data only.
    pub n5_stage_heads_materialized: bool,
}

impl StageCert for NormalizeCert {
    fn all_pass(&self) -> bool {
        self.n1_flat
            && self.n2_identities_split
            && self.n3_identities_minimal
            && self.n4_shuffle_fed_by_map
            && self.n5_stage_heads_materialized
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("N1_flat", self.n1_flat),
            ("N2_identities_split", self.n2_identities_split),
            ("N3_identities_minimal", self.n3_identities_minimal),
            ("N4_shuffle_fed_by_map", self.n4_shuffle_fed_by_map),
            ("N5_stage_heads_materialized", self.n5_stage_heads_materialized),
        ]
    }
}

/// Check normalization postconditions on `graph`.
pub fn verify_normalized(graph: &FlowGraph) -> NormalizeCert {
    let ids = identities(graph);
    NormalizeCert {
        n1_flat: !graph.has_flow_parts(),
        n2_identities_split: ids
            .iter()
            .all(|&id| graph.incoming(id).len() <= 1 || graph.outgoing(id).len() <= 1),
        n3_identities_minimal: ids.iter().all(|&id| is_map_body(graph, id)),
        n4_shuffle_fed_by_map: graph
            .elements()
            .filter(|e| e.is_shuffle_boundary())
            .all(|e| {
                graph
                    .predecessors(e.id)
                    .iter()
                    .all(|p| !graph.is_stage_boundary(*p))
            }),
        n5_stage_heads_materialized: graph
            .elements()
            .filter(|e| e.is_stage_head())
            .all(|e| {
                graph
                    .predecessors(e.id)
                    .iter()
                    .all(|p| graph.is_stage_boundary(*p))
            }),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FlowGraphBuilder;

    fn names(graph: &FlowGraph, ids: &[ElementId]) -> Vec<String> {
        ids.iter().map(|id| graph.element(*id).name.clone()).collect()
    }

    fn succ(graph: &FlowGraph, name: &str) -> ElementId {
        let id = graph.find(name).unwrap();
        let s = graph.successors(id);
        assert_eq!(s.len(), 1, "{name} has successors {:?}", names(graph, &s));
        s[0]
    }

    fn element_names(graph: &FlowGraph) -> Vec<String> {
        graph.elements().map(|e| e.name.clone()).collect()
    }

    fn boundaries(graph: &FlowGraph) -> Vec<String> {
        graph
            .elements()
            .filter(|e| e.is_boundary())
            .map(|e| e.name.clone())
            .collect()
    }

    fn shuffle_fanout(op2: Boundary) -> FlowGraph {
        let mut b = FlowGraphBuilder::new();
        b.input("in1")
            .operator("op1", "cogroup", "in", "a b", Boundary::Shuffle)
            .operator("op2", "cogroup", "in", "out", op2)
            .output("out1")
            .output("out2")
            .connect("in1", "op1")
            .connect("op1.a", "op2")
            .connect("op2", "out1")
            .connect("op1.b", "out2");
        b.build().unwrap()
    }

    #[test]
    fn checkpoints_inserted_on_each_diverging_branch() {
        let mut g = shuffle_fanout(Boundary::Shuffle);
        assert_eq!(insert_checkpoints(&mut g), 2);
        assert_eq!(boundaries(&g).len(), 7);

        let op1 = g.find("op1").unwrap();
        let a = g.output_port(op1, "a").unwrap();
        let b = g.output_port(op1, "b").unwrap();
        let after_a = g.succeeding_boundaries(a);
        let after_b = g.succeeding_boundaries(b);
        assert_eq!(after_a.len(), 1);
        assert_eq!(after_b.len(), 1);
        assert!(g.is_checkpoint(after_a[0]) && g.is_checkpoint(after_b[0]));
        assert_ne!(after_a[0], after_b[0]);
    }

    #[test]
    fn no_checkpoint_when_reduce_side_stays_local() {
        let mut g = shuffle_fanout(Boundary::None);
        assert_eq!(insert_checkpoints(&mut g), 0);
        assert_eq!(boundaries(&g), vec!["in1", "op1", "out1", "out2"]);
    }

    #[test]
    fn checkpoint_when_reduce_side_merges_foreign_data() {
        let mut b = FlowGraphBuilder::new();
        b.input("in1")
            .input("in2")
            .operator("red", "fold", "in", "out", Boundary::Shuffle)
            .operator("join", "confluent", "a b", "out", Boundary::None)
            .output("out")
            .connect("in1", "red")
            .connect("red", "join.a")
            .connect("in2", "join.b")
            .connect("join", "out");
        let mut g = b.build().unwrap();
        assert_eq!(insert_checkpoints(&mut g), 1);
        assert!(g.is_checkpoint(succ(&g, "red")));
    }

    #[test]
    fn stage_head_gets_checkpoint_after_plain_operator() {
        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .operator("op1", "update", "in", "out", Boundary::None)
            .operator("op2", "update", "in", "out", Boundary::Stage)
            .output("out")
            .connect("in", "op1")
            .connect("op1", "op2")
            .connect("op2", "out");
        let mut g = b.build().unwrap();
        assert_eq!(insert_checkpoints(&mut g), 1);
        let cp = succ(&g, "op1");
        assert!(g.is_checkpoint(cp));
        assert_eq!(g.successors(cp), vec![g.find("op2").unwrap()]);
    }

    #[test]
    fn insert_identities_nothing() {
        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .operator("op", "update", "in", "out", Boundary::None)
            .output("out")
            .connect("in", "op.in")
            .connect("op.out", "out");
        let mut g = b.build().unwrap();
        assert_eq!(insert_identities(&mut g), 0);
        assert_eq!(element_names(&g), vec!["in", "op", "out"]);
    }

    fn chain(op1: Boundary, op2: Boundary) -> FlowGraph {
        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .operator("op1", "cogroup", "in", "out", op1)
            .operator("op2", "cogroup", "in", "out", op2)
            .output("out")
            .connect("in", "op1")
            .connect("op1", "op2")
            .connect("op2", "out");
        b.build().unwrap()
    }

    #[test]
    fn insert_identity_between_input_and_shuffle() {
        let mut g = chain(Boundary::Shuffle, Boundary::None);
        assert_eq!(insert_identities(&mut g), 1);
        let id = succ(&g, "in");
        assert!(g.is_identity(id));
        assert_eq!(g.successors(id), vec![g.find("op1").unwrap()]);
        assert_eq!(succ(&g, "op1"), g.find("op2").unwrap());
        assert_eq!(succ(&g, "op2"), g.find("out").unwrap());
    }

    #[test]
    fn insert_identity_between_input_and_stage_head() {
        let mut g = chain(Boundary::Stage, Boundary::None);
        assert_eq!(insert_identities(&mut g), 1);
        let id = succ(&g, "in");
        assert!(g.is_identity(id));
        assert_eq!(g.successors(id), vec![g.find("op1").unwrap()]);
        assert_eq!(succ(&g, "op1"), g.find("op2").unwrap());
    }

    #[test]
    fn no_identity_when_map_side_exists() {
        let mut g = chain(Boundary::None, Boundary::Shuffle);
        assert_eq!(insert_identities(&mut g), 0);
        assert_eq!(element_names(&g), vec!["in", "op1", "op2", "out"]);
    }

    #[test]
    fn split_identities_nothing() {
        let mut g = chain(Boundary::None, Boundary::None);
        assert_eq!(split_identities(&mut g), 0);
        assert_eq!(element_names(&g), vec!["in", "op1", "op2", "out"]);
    }

    #[test]
    fn split_identity_per_connection_pair() {
        let mut b = FlowGraphBuilder::new();
        b.input("in1")
            .input("in2")
            .pseudo("id", Boundary::None)
            .output("out1")
            .output("out2")
            .connect("in1", "id")
            .connect("id", "out1")
            .connect("in2", "id")
            .connect("id", "out2");
        let mut g = b.build().unwrap();
        assert_eq!(split_identities(&mut g), 1);

        let in1 = g.find("in1").unwrap();
        let in2 = g.find("in2").unwrap();
        let s1 = g.successors(in1);
        let s2 = g.successors(in2);
        assert_eq!(s1.len(), 2);
        assert_eq!(s2.len(), 2);
        for e in s1.iter().chain(&s2) {
            assert_eq!(g.successors(*e).len(), 1);
            assert_eq!(g.predecessors(*e).len(), 1);
        }
        assert!(s1.iter().all(|e| !s2.contains(e)));
    }

    #[test]
    fn split_identities_already_split() {
        let mut b = FlowGraphBuilder::new();
        b.input("in1")
            .pseudo("id1", Boundary::None)
            .pseudo("id2", Boundary::None)
            .output("out1")
            .output("out2")
            .connect("in1", "id1")
            .connect("id1", "out1")
            .connect("in1", "id2")
            .connect("id2", "out2");
        let mut g = b.build().unwrap();
        assert_eq!(split_identities(&mut g), 0);
        assert_eq!(element_names(&g), vec!["in1", "id1", "id2", "out1", "out2"]);
    }

    #[test]
    fn reduce_keeps_plain_chain() {
        let mut g = chain(Boundary::None, Boundary::None);
        assert_eq!(reduce_identities(&mut g), 0);
        assert_eq!(element_names(&g), vec!["in", "op1", "op2", "out"]);
    }

    fn with_identity(first: &str, boundary: Boundary) -> FlowGraph {
        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .operator("op1", "update", "in", "out", boundary)
            .pseudo("id", Boundary::None)
            .output("out");
        if first == "op" {
            b.connect("in", "op1").connect("op1", "id").connect("id", "out");
        } else {
            b.connect("in", "id").connect("id", "op1").connect("op1", "out");
        }
        b.build().unwrap()
    }

    #[test]
    fn reduce_operator_then_identity() {
        let mut g = with_identity("op", Boundary::None);
        assert_eq!(reduce_identities(&mut g), 1);
        assert_eq!(element_names(&g), vec!["in", "op1", "out"]);
        assert_eq!(succ(&g, "in"), g.find("op1").unwrap());
        assert_eq!(succ(&g, "op1"), g.find("out").unwrap());
    }

    #[test]
    fn reduce_identity_then_operator() {
        let mut g = with_identity("id", Boundary::None);
        assert_eq!(reduce_identities(&mut g), 1);
        assert_eq!(element_names(&g), vec!["in", "op1", "out"]);
        assert_eq!(succ(&g, "in"), g.find("op1").unwrap());
    }

    #[test]
    fn reduce_keeps_map_body() {
        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .pseudo("id", Boundary::None)
            .output("out")
            .connect("in", "id")
            .connect("id", "out");
        let mut g = b.build().unwrap();
        assert_eq!(reduce_identities(&mut g), 0);
        assert_eq!(succ(&g, "in"), g.find("id").unwrap());
        assert_eq!(succ(&g, "id"), g.find("out").unwrap());
    }

    #[test]
    fn reduce_drops_identity_after_reduce_body() {
        let mut g = with_identity("op", Boundary::Shuffle);
        assert_eq!(reduce_identities(&mut g), 1);
        assert_eq!(element_names(&g), vec!["in", "op1", "out"]);
        assert_eq!(succ(&g, "op1"), g.find("out").unwrap());
    }

    #[test]
    fn normalize_collapses_fanout_identity() {
        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .operator("op1", "update", "in", "out", Boundary::None)
            .pseudo("id", Boundary::None)
            .output("out1")
            .output("out2")
            .connect("in", "op1")
            .connect("op1", "id")
            .connect("id", "out1")
            .connect("id", "out2");
        let mut g = b.build().unwrap();
        normalize(&mut g);
        assert_eq!(element_names(&g), vec!["in", "op1", "out1", "out2"]);
        let op1 = g.find("op1").unwrap();
        assert_eq!(names(&g, &g.successors(op1)), vec!["out1", "out2"]);
        assert_eq!(g.predecessors(g.find("out1").unwrap()), vec![op1]);
        assert_eq!(g.predecessors(g.find("out2").unwrap()), vec![op1]);
        assert!(verify_normalized(&g).all_pass());
    }

    #[test]
    fn normalize_inlines_flow_parts() {
        let mut comp = FlowGraphBuilder::new();
        comp.input("in")
            .operator("op1", "update", "in", "out", Boundary::None)
            .pseudo("id", Boundary::None)
            .output("out1")
            .output("out2")
            .connect("in", "op1")
            .connect("op1", "id")
            .connect("id", "out1")
            .connect("id", "out2");
        let comp = comp.build().unwrap();

        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .flow_part("c", comp)
            .output("out")
            .connect("in", "c")
            .connect("c.out1", "out")
            .connect("c.out2", "out");
        let mut g = b.build().unwrap();
        let stats = normalize(&mut g);
        assert_eq!(stats.flow_parts_inlined, 1);

        let op1 = g.find("c.op1").unwrap();
        assert_eq!(g.element(op1).operator().unwrap().name, "op1");
        assert_eq!(succ(&g, "in"), op1);
        assert_eq!(succ(&g, "c.op1"), g.find("out").unwrap());
        assert_eq!(g.predecessors(g.find("out").unwrap()), vec![op1]);
        assert_eq!(element_names(&g), vec!["in", "out", "c.op1"]);
    }

    #[test]
    fn nested_flow_parts_are_inlined_recursively() {
        let mut leaf = FlowGraphBuilder::new();
        leaf.input("x")
            .operator("work", "update", "in", "out", Boundary::None)
            .output("y")
            .connect("x", "work")
            .connect("work", "y");
        let mut mid = FlowGraphBuilder::new();
        mid.input("in")
            .flow_part("leaf", leaf.build().unwrap())
            .output("out")
            .connect("in", "leaf")
            .connect("leaf", "out");
        let mut b = FlowGraphBuilder::new();
        b.input("src")
            .flow_part("mid", mid.build().unwrap())
            .output("dst")
            .connect("src", "mid")
            .connect("mid", "dst");
        let mut g = b.build().unwrap();
        assert_eq!(inline_flow_parts(&mut g), 2);
        assert!(!g.has_flow_parts());
        assert!(g.find("mid.leaf.work").is_some());
        normalize(&mut g);
        assert_eq!(element_names(&g), vec!["src", "dst", "mid.leaf.work"]);
    }

    fn structure(g: &FlowGraph) -> (Vec<(String, &'static str)>, Vec<(String, String)>) {
        let mut elems: Vec<_> = g.elements().map(|e| (e.name.clone(), e.kind_label())).collect();
        elems.sort();
        let mut conns: Vec<_> = g
            .connections()
            .iter()
            .map(|c| (g.port_label(c.upstream), g.port_label(c.downstream)))
            .collect();
        conns.sort();
        (elems, conns)
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut g = shuffle_fanout(Boundary::Shuffle);
        normalize(&mut g);
        assert!(verify_normalized(&g).all_pass());
        let once = structure(&g);
        normalize(&mut g);
        assert_eq!(structure(&g), once);

        let mut g = chain(Boundary::Stage, Boundary::Shuffle);
        normalize(&mut g);
        assert!(verify_normalized(&g).all_pass());
        let once = structure(&g);
        normalize(&mut g);
        assert_eq!(structure(&g), once);
    }

    #[test]
    fn full_normalization_keeps_distinct_checkpoints() {
        let mut g = shuffle_fanout(Boundary::Shuffle);
        normalize(&mut g);
        let op1 = g.find("op1").unwrap();
        let a = g.output_port(op1, "a").unwrap();
        let b = g.output_port(op1, "b").unwrap();
        let da: Vec<_> = g.opposites(a).iter().map(|p| g.owner(*p)).collect();
        let db: Vec<_> = g.opposites(b).iter().map(|p| g.owner(*p)).collect();
        assert_eq!(da.len(), 1);
        assert_eq!(db.len(), 1);
        assert!(g.is_checkpoint(da[0]) && g.is_checkpoint(db[0]));
        assert_ne!(da[0], db[0]);
    }
}
