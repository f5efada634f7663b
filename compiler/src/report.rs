// report.rs — Human-readable plan report
//
// Formats a compiled plan: blocks per stage, the resolved shuffle, fragments
// with their processors, units, and sinks. Used by `flowc --emit plan`.

use std::fmt;

use crate::graph::FlowGraph;
use crate::id::PortId;
use crate::pipeline::CompilationState;
use crate::plan::{FlowBlock, StageGraph};
use crate::shuffle::{Arrangement, ShuffleModel};
use crate::stage::StageModel;

/// Borrowed view of a compiled plan that implements `Display`.
pub struct PlanReport<'a> {
    stage_graph: &'a StageGraph,
    shuffles: &'a [Option<ShuffleModel>],
    stage_models: &'a [Option<StageModel>],
}

impl<'a> PlanReport<'a> {
    /// `None` until the stage graph has been built.
    pub fn new(state: &'a CompilationState) -> Option<Self> {
        let stage_graph = state.stage_graph.as_ref()?;
        Some(PlanReport {
            stage_graph,
            shuffles: &state.shuffles,
            stage_models: &state.stage_models,
        })
    }
}

impl fmt::Display for PlanReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sg = self.stage_graph;
        let g = &sg.graph;
        writeln!(
            f,
            "plan: {} stage(s), {} block(s), {} element(s)",
            sg.stages.len(),
            sg.blocks.len(),
            g.len()
        )?;
        write_block(f, g, "inputs", sg.block(sg.input), "")?;
        write_block(f, g, "outputs", sg.block(sg.output), "")?;

        for (i, stage) in sg.stages.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "stage {}", stage.number)?;
            for &b in &stage.map_blocks {
                write_block(f, g, "map", sg.block(b), "  ")?;
            }
            for &b in &stage.reduce_blocks {
                write_block(f, g, "reduce", sg.block(b), "  ")?;
            }
            if let Some(Some(shuffle)) = self.shuffles.get(i) {
                write_shuffle(f, g, shuffle)?;
            }
            match self.stage_models.get(i) {
                Some(Some(model)) => write_model(f, g, model)?,
                _ => writeln!(f, "  (not analyzed)")?,
            }
        }
        Ok(())
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, g: &FlowGraph, title: &str, block: &FlowBlock, indent: &str) -> fmt::Result {
    let names: Vec<&str> = block.elements.iter().map(|&e| g.element(e).name.as_str()).collect();
    writeln!(f, "{indent}{title} {}: {}", block.id, names.join(", "))
}

fn write_shuffle(f: &mut fmt::Formatter<'_>, g: &FlowGraph, shuffle: &ShuffleModel) -> fmt::Result {
    let partial = if shuffle.partial { " (partial)" } else { "" };
    writeln!(f, "  shuffle{partial}")?;
    for seg in &shuffle.segments {
        let terms: Vec<String> = seg
            .terms
            .iter()
            .map(|t| match t.arrangement {
                Arrangement::Grouping => t.property.name.clone(),
                Arrangement::Ascending => format!("+{}", t.property.name),
                Arrangement::Descending => format!("-{}", t.property.name),
            })
            .collect();
        writeln!(
            f,
            "    segment {}: {} <{}> [{}]",
            seg.port_index,
            g.port_label(seg.port),
            seg.target.name,
            terms.join(", ")
        )?;
    }
    Ok(())
}

fn write_model(f: &mut fmt::Formatter<'_>, g: &FlowGraph, model: &StageModel) -> fmt::Result {
    for frag in &model.fragments {
        let factors: Vec<String> = frag
            .factors
            .iter()
            .map(|factor| {
                let name = &g.element(factor.element).name;
                if factor.processor.is_empty() {
                    name.clone()
                } else {
                    format!("{name}({})", factor.processor.name)
                }
            })
            .collect();
        write!(f, "  fragment {} in {}: {}", frag.id, frag.block, factors.join(" > "))?;
        if !frag.resources.is_empty() {
            write!(f, " uses {}", frag.resources.join(", "))?;
        }
        writeln!(f)?;
    }
    for (n, unit) in model.map_units.iter().enumerate() {
        writeln!(
            f,
            "  map unit {}: {} -> {}",
            n + 1,
            ports(g, &unit.inputs),
            fragments(&unit.fragments)
        )?;
    }
    for unit in &model.reduce_units {
        writeln!(
            f,
            "  reduce unit {}: {} -> {}",
            g.element(unit.element).name,
            ports(g, &unit.inputs),
            fragments(&unit.fragments)
        )?;
    }
    for sink in &model.sinks {
        writeln!(
            f,
            "  sink {}: {} => {}",
            sink.name,
            ports(g, &sink.outputs),
            ports(g, &sink.downstream)
        )?;
    }
    Ok(())
}

fn ports(g: &FlowGraph, ports: &[PortId]) -> String {
    let labels: Vec<String> = ports.iter().map(|&p| g.port_label(p)).collect();
    labels.join(", ")
}

fn fragments(ids: &[crate::id::FragmentId]) -> String {
    let labels: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    labels.join(", ")
}
