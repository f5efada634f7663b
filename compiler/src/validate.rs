// validate.rs — Structural validation of flow graphs
//
// Checks port connectivity (recursively into flow parts), flow-part port
// consistency, and acyclicity of the flattened connection graph.
//
// Preconditions: none.
// Postconditions: returns true iff no error diagnostic was raised by this call.
// Failure modes: E0101 unconnected mandatory port, E0102 cycle,
//                E0103 flow part inconsistent with its inner graph.
// Side effects: appends diagnostics to `sink`. Never stops at the first error.

use std::collections::HashMap;

use crate::diag::{codes, DiagSink, Diagnostic};
use crate::graph::{Connectivity, ElementKind, FlowGraph};
use crate::id::ElementId;
use crate::normalize::inline_flow_parts;

/// Validate `graph`, reporting every problem found.
pub fn validate(graph: &FlowGraph, sink: &DiagSink) -> bool {
    let mut raised = 0usize;
    check_ports(graph, "", sink, &mut raised);

    // Cycles are searched on a flattened copy so paths through flow parts
    // are followed element by element.
    let mut flat = graph.clone();
    inline_flow_parts(&mut flat);
    for cycle in detect_cycles(&flat) {
        let path: Vec<&str> = cycle
            .iter()
            .map(|id| flat.element(*id).name.as_str())
            .collect();
        let first = cycle[0];
        sink.emit(
            Diagnostic::error(
                codes::E0102,
                format!("flow graph contains a cycle: {} -> {}", path.join(" -> "), path[0]),
            )
            .with_element(first, flat.element(first).name.clone()),
        );
        raised += 1;
    }

    tracing::debug!(elements = graph.len(), errors = raised, "validated flow graph");
    raised == 0
}

fn check_ports(graph: &FlowGraph, prefix: &str, sink: &DiagSink, raised: &mut usize) {
    for elem in graph.elements() {
        let qualified = format!("{prefix}{}", elem.name);
        for &port in elem.inputs.iter().chain(&elem.outputs) {
            let p = graph.port(port);
            if p.connectivity == Connectivity::Mandatory && !graph.is_connected(port) {
                sink.emit(
                    Diagnostic::error(
                        codes::E0101,
                        format!("mandatory port `{}.{}` is not connected", qualified, p.name),
                    )
                    .with_element(elem.id, qualified.clone())
                    .with_hint("connect the port or declare it optional"),
                );
                *raised += 1;
            }
        }
        if let ElementKind::FlowPart(inner) = &elem.kind {
            let (ins, outs) = inner.exposed_ports();
            let declared_ins: Vec<&str> = elem
                .inputs
                .iter()
                .map(|p| graph.port(*p).name.as_str())
                .collect();
            let declared_outs: Vec<&str> = elem
                .outputs
                .iter()
                .map(|p| graph.port(*p).name.as_str())
                .collect();
            let inner_ins: Vec<&str> = ins.iter().map(|d| d.name.as_str()).collect();
            let inner_outs: Vec<&str> = outs.iter().map(|d| d.name.as_str()).collect();
            if declared_ins != inner_ins || declared_outs != inner_outs {
                sink.emit(
                    Diagnostic::error(
                        codes::E0103,
                        format!(
                            "flow part `{}` exposes ports ({}) -> ({}) but its flow declares ({}) -> ({})",
                            qualified,
                            declared_ins.join(", "),
                            declared_outs.join(", "),
                            inner_ins.join(", "),
                            inner_outs.join(", "),
                        ),
                    )
                    .with_element(elem.id, qualified.clone()),
                );
                *raised += 1;
            } else if let Some(dup) = first_duplicate(&inner_ins).or(first_duplicate(&inner_outs)) {
                sink.emit(
                    Diagnostic::error(
                        codes::E0103,
                        format!("flow part `{qualified}` declares port `{dup}` more than once"),
                    )
                    .with_element(elem.id, qualified.clone())
                    .with_hint("give every input and output of the flow a distinct name"),
                );
                *raised += 1;
            }
            check_ports(inner, &format!("{qualified}."), sink, raised);
        }
    }
}

fn first_duplicate<'a>(names: &[&'a str]) -> Option<&'a str> {
    let mut seen = std::collections::HashSet::new();
    names.iter().copied().find(|n| !seen.insert(*n))
}

// ── Cycle detection ─────────────────────────────────────────────────────────

/// Every cycle found by a depth-first walk, as element paths.
pub fn detect_cycles(graph: &FlowGraph) -> Vec<Vec<ElementId>> {
    if graph.is_empty() {
        return Vec::new();
    }

    let adj: HashMap<ElementId, Vec<ElementId>> = graph
        .elements()
        .map(|e| (e.id, graph.successors(e.id)))
        .collect();

    let mut cycles = Vec::new();
    let mut visited = HashMap::new(); // 0 = unvisited, 1 = in progress, 2 = done
    let mut path = Vec::new();

    for id in graph.element_ids() {
        if *visited.get(&id).unwrap_or(&0) == 0 {
            dfs_cycle(id, &adj, &mut visited, &mut path, &mut cycles);
        }
    }

    cycles
}

fn dfs_cycle(
    node: ElementId,
    adj: &HashMap<ElementId, Vec<ElementId>>,
    visited: &mut HashMap<ElementId, u8>,
    path: &mut Vec<ElementId>,
    cycles: &mut Vec<Vec<ElementId>>,
) {
    visited.insert(node, 1);
    path.push(node);

    if let Some(neighbors) = adj.get(&node) {
        for &next in neighbors {
            match visited.get(&next).unwrap_or(&0) {
                0 => dfs_cycle(next, adj, visited, path, cycles),
                1 => {
                    if let Some(pos) = path.iter().position(|&n| n == next) {
                        cycles.push(path[pos..].to_vec());
                    }
                }
                _ => {}
            }
        }
    }

    path.pop();
    visited.insert(node, 2);
}

// ── Tests ───────────────────────────────────────────────────────────────────
