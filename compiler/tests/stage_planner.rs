// Planner behaviors on small flows: validation, normalization, and the
// shape of the resulting stage graph.
//
// Uses the library API (build → validate → normalize → plan → analyze) and
// inspects stages, blocks and fragments by element name.

use flowc::builder::FlowGraphBuilder;
use flowc::diag::{codes, DiagSink};
use flowc::graph::{Boundary, Connectivity, FlowGraph};
use flowc::normalize::{normalize, verify_normalized, NormalizeStats};
use flowc::pass::StageCert;
use flowc::plan::{build_stage_graph, verify_plan, BlockKind, StageGraph};
use flowc::registry::ProcessorRegistry;
use flowc::stage::{analyze_stage, StageModel};
use flowc::validate::validate;

// ── Helpers ─────────────────────────────────────────────────────────────────

fn plan(mut graph: FlowGraph) -> StageGraph {
    let sink = DiagSink::new();
    assert!(validate(&graph, &sink), "{:?}", sink.snapshot());
    normalize(&mut graph);
    assert!(verify_normalized(&graph).all_pass());
    let sg = build_stage_graph(graph, &sink);
    assert!(sink.is_empty(), "{:?}", sink.snapshot());
    assert!(verify_plan(&sg).all_pass(), "{:?}", verify_plan(&sg).failures());
    sg
}

fn model(sg: &StageGraph, index: usize) -> StageModel {
    let sink = DiagSink::new();
    let model = analyze_stage(
        sg,
        &sg.stages[index],
        None,
        &ProcessorRegistry::with_builtins(),
        &sink,
    );
    assert!(sink.is_empty(), "{:?}", sink.snapshot());
    model.expect("stage model")
}

/// Per block of stage `index`: the fragments' factors, named by operator
/// (pseudo elements show as `-`).
fn fragments_by_block(sg: &StageGraph, index: usize) -> Vec<(BlockKind, Vec<Vec<String>>)> {
    let m = model(sg, index);
    sg.stages[index]
        .blocks()
        .map(|b| {
            let frags = m
                .fragments
                .iter()
                .filter(|f| f.block == b)
                .map(|f| {
                    f.elements()
                        .map(|e| match sg.graph.element(e).operator() {
                            Some(desc) => desc.name.clone(),
                            None => "-".to_string(),
                        })
                        .collect()
                })
                .collect();
            (sg.block(b).kind, frags)
        })
        .collect()
}

fn frag(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ── Validation ──────────────────────────────────────────────────────────────

#[test]
fn validation_tracks_port_connectivity() {
    let build = |connectivity| {
        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .operator_connectivity("op", "update", "in", "out extra", Boundary::None, connectivity)
            .output("out")
            .connect("in", "op")
            .connect("op.out", "out");
        b.build().unwrap()
    };
    let sink = DiagSink::new();
    assert!(!validate(&build(Connectivity::Mandatory), &sink));
    assert_eq!(sink.take()[0].code, Some(codes::E0101));
    assert!(validate(&build(Connectivity::Optional), &sink));
    assert!(sink.is_empty());
}

#[test]
fn cycle_is_rejected() {
    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .operator("op", "confluent", "in back", "out", Boundary::None)
        .operator("back", "update", "in", "out", Boundary::None)
        .output("out")
        .connect("in", "op.in")
        .connect("op", "out")
        .connect("op", "back")
        .connect("back", "op.back");
    let sink = DiagSink::new();
    assert!(!validate(&b.build().unwrap(), &sink));
    assert!(sink.snapshot().iter().any(|d| d.code == Some(codes::E0102)));
}

// ── Plans ───────────────────────────────────────────────────────────────────

#[test]
fn through_flow_has_no_stages() {
    let mut b = FlowGraphBuilder::new();
    b.input("in").output("out").connect("in", "out");
    let sg = plan(b.build().unwrap());
    assert!(sg.stages.is_empty());
    assert_eq!(sg.blocks.len(), 2);
    assert!(sg.is_connected(sg.input, sg.output));
}

#[test]
fn single_mapper() {
    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .operator("op", "update", "in", "out", Boundary::None)
        .output("out")
        .connect("in", "op")
        .connect("op", "out");
    let sg = plan(b.build().unwrap());
    assert_eq!(sg.stages.len(), 1);
    assert_eq!(
        fragments_by_block(&sg, 0),
        vec![(BlockKind::Map, vec![frag(&["op"])])]
    );
}

#[test]
fn single_reducer_gets_identity_map() {
    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .operator("op", "fold", "in", "out", Boundary::Shuffle)
        .output("out")
        .connect("in", "op")
        .connect("op", "out");
    let sg = plan(b.build().unwrap());
    assert_eq!(sg.stages.len(), 1);
    assert_eq!(
        fragments_by_block(&sg, 0),
        vec![
            (BlockKind::Map, vec![frag(&["-"])]),
            (BlockKind::Reduce, vec![frag(&["op"])]),
        ]
    );
}

#[test]
fn map_then_reduce() {
    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .operator("op1", "update", "in", "out", Boundary::None)
        .operator("op2", "fold", "in", "out", Boundary::Shuffle)
        .output("out")
        .connect("in", "op1")
        .connect("op1", "op2")
        .connect("op2", "out");
    let sg = plan(b.build().unwrap());
    assert_eq!(sg.stages.len(), 1);
    assert_eq!(
        fragments_by_block(&sg, 0),
        vec![
            (BlockKind::Map, vec![frag(&["op1"])]),
            (BlockKind::Reduce, vec![frag(&["op2"])]),
        ]
    );
}

#[test]
fn flow_part_plans_like_inline_declaration() {
    let mut inner = FlowGraphBuilder::new();
    inner
        .input("in")
        .operator("op1", "update", "in", "out", Boundary::None)
        .operator("op2", "fold", "in", "out", Boundary::Shuffle)
        .output("out")
        .connect("in", "op1")
        .connect("op1", "op2")
        .connect("op2", "out");
    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .flow_part("part", inner.build().unwrap())
        .output("out")
        .connect("in", "part")
        .connect("part", "out");
    let nested = plan(b.build().unwrap());

    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .operator("op1", "update", "in", "out", Boundary::None)
        .operator("op2", "fold", "in", "out", Boundary::Shuffle)
        .output("out")
        .connect("in", "op1")
        .connect("op1", "op2")
        .connect("op2", "out");
    let flat = plan(b.build().unwrap());

    assert_eq!(nested.stages.len(), flat.stages.len());
    assert_eq!(fragments_by_block(&nested, 0), fragments_by_block(&flat, 0));
}

#[test]
fn reducer_chain_is_ordered_through_checkpoints() {
    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .operator("first", "fold", "in", "out", Boundary::Shuffle)
        .operator("mid", "update", "in", "out", Boundary::None)
        .operator("second", "fold", "in", "out", Boundary::Shuffle)
        .output("out")
        .connect("in", "first")
        .connect("first", "mid")
        .connect("mid", "second")
        .connect("second", "out");
    let sg = plan(b.build().unwrap());
    assert_eq!(sg.stages.len(), 2);
    let reduce_of = |i: usize| -> Vec<Vec<String>> {
        fragments_by_block(&sg, i)
            .into_iter()
            .filter(|(kind, _)| *kind == BlockKind::Reduce)
            .flat_map(|(_, frags)| frags)
            .collect()
    };
    assert_eq!(reduce_of(0), vec![frag(&["first"])]);
    assert_eq!(reduce_of(1), vec![frag(&["second"])]);

    // The only way from stage 1 to stage 2 is through a checkpoint.
    let cps: Vec<_> = sg.graph.elements().filter(|e| e.is_checkpoint()).collect();
    assert_eq!(cps.len(), 1);
}

#[test]
fn stage_head_starts_a_new_stage() {
    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .operator("prep", "update", "in", "out", Boundary::None)
        .operator("head", "update", "in", "out", Boundary::Stage)
        .output("out")
        .connect("in", "prep")
        .connect("prep", "head")
        .connect("head", "out");
    let sg = plan(b.build().unwrap());
    assert_eq!(sg.stages.len(), 2);
    assert_eq!(
        fragments_by_block(&sg, 0),
        vec![(BlockKind::Map, vec![frag(&["prep"])])]
    );
    assert_eq!(
        fragments_by_block(&sg, 1),
        vec![(BlockKind::Map, vec![frag(&["head"])])]
    );
}

/// Sinks of stage `index` as (outputs, downstream) port labels.
fn sinks(sg: &StageGraph, index: usize) -> Vec<(Vec<String>, Vec<String>)> {
    let labels = |ports: &[flowc::id::PortId]| -> Vec<String> {
        ports.iter().map(|p| sg.graph.port_label(*p)).collect()
    };
    model(sg, index)
        .sinks
        .iter()
        .map(|s| (labels(&s.outputs), labels(&s.downstream)))
        .collect()
}

fn pair(outputs: &[&str], downstream: &[&str]) -> (Vec<String>, Vec<String>) {
    (frag(outputs), frag(downstream))
}

#[test]
fn map_side_tap_keeps_chain_in_one_block() {
    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .operator("a", "update", "in", "out", Boundary::None)
        .operator("b", "update", "in", "out", Boundary::None)
        .output("o1")
        .output("o2")
        .connect("in", "a")
        .connect("a", "o1")
        .connect("a", "b")
        .connect("b", "o2");
    let sg = plan(b.build().unwrap());
    assert_eq!(sg.stages.len(), 1);
    assert_eq!(sg.blocks.len(), 3);
    assert_eq!(
        fragments_by_block(&sg, 0),
        vec![(BlockKind::Map, vec![frag(&["a"]), frag(&["b"])])]
    );

    let m = model(&sg, 0);
    assert_eq!(m.map_units.len(), 1);
    assert_eq!(m.map_units[0].fragments.len(), 2, "the chained operator stays in the unit");
    assert_eq!(
        sinks(&sg, 0),
        vec![pair(&["a.out"], &["o1.in"]), pair(&["b.out"], &["o2.in"])]
    );
}

#[test]
fn reduce_side_tap_keeps_chain_in_one_block() {
    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .operator("r", "fold", "in", "out", Boundary::Shuffle)
        .operator("post", "update", "in", "out", Boundary::None)
        .output("o1")
        .output("o2")
        .connect("in", "r")
        .connect("r", "o1")
        .connect("r", "post")
        .connect("post", "o2");
    let sg = plan(b.build().unwrap());
    assert_eq!(sg.stages.len(), 1);
    assert_eq!(
        fragments_by_block(&sg, 0),
        vec![
            (BlockKind::Map, vec![frag(&["-"])]),
            (BlockKind::Reduce, vec![frag(&["r"]), frag(&["post"])]),
        ]
    );

    let m = model(&sg, 0);
    assert_eq!(m.reduce_units.len(), 1);
    assert_eq!(m.reduce_units[0].fragments.len(), 2);
    assert_eq!(
        sinks(&sg, 0),
        vec![pair(&["r.out"], &["o1.in"]), pair(&["post.out"], &["o2.in"])]
    );
}

#[test]
fn normalization_is_a_fixed_point() {
    let mut b = FlowGraphBuilder::new();
    b.input("in")
        .operator("op1", "branch", "in", "a b", Boundary::Shuffle)
        .operator("op2", "fold", "in", "out", Boundary::Shuffle)
        .output("out1")
        .output("out2")
        .connect("in", "op1")
        .connect("op1.a", "op2")
        .connect("op2", "out1")
        .connect("op1.b", "out2");
    let mut g = b.build().unwrap();
    normalize(&mut g);
    let count = g.len();
    let conns = g.connections().len();
    let stats = normalize(&mut g);
    assert_eq!(stats, NormalizeStats::default());
    assert_eq!(g.len(), count);
    assert_eq!(g.connections().len(), conns);
}
