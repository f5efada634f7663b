// dot.rs — Graphviz DOT output for flow graphs and stage graphs
//
// Renders a FlowGraph (as declared or normalized) element by element, and a
// StageGraph as one cluster per stage holding its map and reduce blocks.
//
// Preconditions: ids in a StageGraph refer to its own flow graph.
// Postconditions: returns a valid DOT string; output order follows ids, so it
//                 is deterministic.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::{self, Write};

use crate::graph::{Boundary, Element, ElementKind, FlowGraph};
use crate::id::BlockId;
use crate::plan::{BlockKind, StageGraph};

/// Emit the flow graph as a Graphviz DOT string. Flow parts become nested
/// clusters.
pub fn emit_flow_dot(graph: &FlowGraph) -> String {
    let mut buf = String::new();
    // Writing into a String cannot fail.
    let _ = write_flow(&mut buf, graph);
    buf
}

/// Emit the stage graph as a Graphviz DOT string: one node per block, one
/// cluster per stage.
pub fn emit_stage_dot(stage_graph: &StageGraph) -> String {
    let mut buf = String::new();
    let _ = write_stages(&mut buf, stage_graph);
    buf
}

// ── Flow graph ──────────────────────────────────────────────────────────────

fn write_flow(buf: &mut String, graph: &FlowGraph) -> fmt::Result {
    writeln!(buf, "digraph flow {{")?;
    write_header(buf)?;
    write_flow_contents(buf, graph, "", "    ")?;
    writeln!(buf, "}}")
}

fn write_header(buf: &mut String) -> fmt::Result {
    writeln!(buf, "    rankdir=LR;")?;
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];")?;
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];")
}

/// Nodes are prefixed with their enclosing flow parts so ids stay unique
/// across nesting levels.
fn write_flow_contents(buf: &mut String, graph: &FlowGraph, prefix: &str, indent: &str) -> fmt::Result {
    for elem in graph.elements() {
        let id = format!("{prefix}e{}", elem.id.0);
        if let ElementKind::FlowPart(inner) = &elem.kind {
            writeln!(buf)?;
            writeln!(buf, "{indent}subgraph cluster_{id} {{")?;
            writeln!(buf, "{indent}    label=\"flow part: {}\";", escape(&elem.name))?;
            writeln!(buf, "{indent}    style=dashed;")?;
            writeln!(buf, "{indent}    color=gray50;")?;
            writeln!(buf, "{indent}    {id} [shape=point, label=\"\"];")?;
            write_flow_contents(buf, inner, &format!("{id}_"), &format!("{indent}    "))?;
            writeln!(buf, "{indent}}}")?;
        } else {
            writeln!(buf, "{indent}{id} [{}];", element_attrs(elem))?;
        }
    }

    writeln!(buf)?;
    for conn in graph.connections() {
        let src = format!("{prefix}e{}", graph.owner(conn.upstream).0);
        let tgt = format!("{prefix}e{}", graph.owner(conn.downstream).0);
        let tail = graph.port(conn.upstream).name.as_str();
        let head = graph.port(conn.downstream).name.as_str();
        writeln!(
            buf,
            "{indent}{src} -> {tgt} [taillabel=\"{}\", headlabel=\"{}\"];",
            escape(tail),
            escape(head)
        )?;
    }
    Ok(())
}

fn element_attrs(elem: &Element) -> String {
    let (shape, color) = match (&elem.kind, elem.boundary) {
        (ElementKind::Input, _) | (ElementKind::Output, _) => ("cylinder", "lightsalmon"),
        (ElementKind::Pseudo, Boundary::Stage) => ("doublecircle", "lightyellow"),
        (ElementKind::Pseudo, _) => ("circle", "white"),
        (ElementKind::Operator(_), Boundary::Shuffle) => ("box3d", "lightgreen"),
        (ElementKind::Operator(_), _) => ("box", "lightblue"),
        (ElementKind::FlowPart(_), _) => ("folder", "gray90"),
    };
    let label = match &elem.kind {
        ElementKind::Operator(desc) => format!("{}\\n({})", escape(&elem.name), escape(&desc.kind)),
        _ => escape(&elem.name),
    };
    format!("shape={shape}, style=filled, fillcolor={color}, label=\"{label}\"")
}

// ── Stage graph ─────────────────────────────────────────────────────────────

fn write_stages(buf: &mut String, sg: &StageGraph) -> fmt::Result {
    writeln!(buf, "digraph stages {{")?;
    write_header(buf)?;

    writeln!(buf)?;
    writeln!(buf, "    {} [{}];", block_node(sg.input), block_attrs(sg, sg.input))?;
    writeln!(buf, "    {} [{}];", block_node(sg.output), block_attrs(sg, sg.output))?;

    for stage in &sg.stages {
        writeln!(buf)?;
        writeln!(buf, "    subgraph cluster_stage{} {{", stage.number)?;
        writeln!(buf, "        label=\"stage {}\";", stage.number)?;
        writeln!(buf, "        style=rounded;")?;
        writeln!(buf, "        color=gray50;")?;
        for block in stage.blocks() {
            writeln!(buf, "        {} [{}];", block_node(block), block_attrs(sg, block))?;
        }
        writeln!(buf, "    }}")?;
    }

    writeln!(buf)?;
    let mut edges: Vec<(BlockId, BlockId)> = Vec::new();
    for conn in &sg.connections {
        let (Some(up), Some(down)) = (sg.block_of_port(conn.upstream), sg.block_of_port(conn.downstream)) else {
            continue;
        };
        if !edges.contains(&(up, down)) {
            edges.push((up, down));
        }
    }
    for (up, down) in edges {
        let shuffle = sg.block(up).kind == BlockKind::Map
            && sg.block(down).kind == BlockKind::Reduce
            && sg.stage_of(up) == sg.stage_of(down);
        if shuffle {
            writeln!(
                buf,
                "    {} -> {} [style=bold, label=\"shuffle\"];",
                block_node(up),
                block_node(down)
            )?;
        } else {
            writeln!(buf, "    {} -> {};", block_node(up), block_node(down))?;
        }
    }
    writeln!(buf, "}}")
}

fn block_node(id: BlockId) -> String {
    format!("b{}", id.0)
}

fn block_attrs(sg: &StageGraph, id: BlockId) -> String {
    let block = sg.block(id);
    let (shape, color, title) = match block.kind {
        BlockKind::Input => ("cylinder", "lightsalmon", "inputs"),
        BlockKind::Output => ("cylinder", "lightsalmon", "outputs"),
        BlockKind::Map => ("box", "lightblue", "map"),
        BlockKind::Reduce => ("box", "lightgreen", "reduce"),
    };
    let names: Vec<String> = block
        .elements
        .iter()
        .map(|&e| escape(&sg.graph.element(e).name))
        .collect();
    format!(
        "shape={shape}, style=filled, fillcolor={color}, label=\"{title} {}\\n{}\"",
        block_node(id),
        names.join("\\n")
    )
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FlowGraphBuilder;
    use crate::diag::DiagSink;
    use crate::normalize::normalize;
    use crate::plan::build_stage_graph;

    fn map_reduce() -> FlowGraph {
        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .operator("cleanse", "update", "in", "out", Boundary::None)
            .operator("total", "summarize", "in", "out", Boundary::Shuffle)
            .output("out")
            .connect("in", "cleanse")
            .connect("cleanse", "total")
            .connect("total", "out");
        b.build().unwrap()
    }

    #[test]
    fn flow_dot_structure() {
        let dot = emit_flow_dot(&map_reduce());
        assert!(dot.starts_with("digraph flow {"));
        assert!(dot.trim_end().ends_with('}'));
        assert!(dot.contains("shape=cylinder"));
        assert!(dot.contains("shape=box3d"), "shuffle operator shape");
        assert!(dot.contains("label=\"total\\n(summarize)\""));
        assert_eq!(dot.matches(" -> ").count(), 3);
    }

    #[test]
    fn flow_part_is_cluster() {
        let mut inner = FlowGraphBuilder::new();
        inner
            .input("in")
            .operator("op", "update", "in", "out", Boundary::None)
            .output("out")
            .connect("in", "op")
            .connect("op", "out");
        let mut b = FlowGraphBuilder::new();
        b.input("in")
            .flow_part("part", inner.build().unwrap())
            .output("out")
            .connect("in", "part")
            .connect("part", "out");
        let dot = emit_flow_dot(&b.build().unwrap());
        assert!(dot.contains("subgraph cluster_e1 {"));
        assert!(dot.contains("label=\"flow part: part\""));
        assert!(dot.contains("e1_e0"), "inner node ids are prefixed");
    }

    #[test]
    fn stage_dot_clusters() {
        let mut g = map_reduce();
        normalize(&mut g);
        let sg = build_stage_graph(g, &DiagSink::new());
        let dot = emit_stage_dot(&sg);
        assert!(dot.starts_with("digraph stages {"));
        assert!(dot.contains("subgraph cluster_stage1 {"));
        assert!(dot.contains("label=\"shuffle\""));
        assert!(dot.contains("fillcolor=lightgreen"));
    }

    #[test]
    fn deterministic_output() {
        assert_eq!(emit_flow_dot(&map_reduce()), emit_flow_dot(&map_reduce()));
    }

    #[test]
    fn escapes_quotes() {
        assert_eq!(escape("a\"b"), "a\\\"b");
    }
}
