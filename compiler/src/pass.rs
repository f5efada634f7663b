// pass.rs — Pass descriptor module: metadata, dependency resolution, certificates
//
// Declares the compiler's 9 passes, their dependency edges, and the
// postconditions they establish. Used by the pipeline runner to compute the
// minimal pass subset for each --emit target, and by certificates to report
// postconditions.

use std::collections::HashSet;

// ── Pass identifiers ───────────────────────────────────────────────────────

/// Identifies each compiler pass (manifest loading happens before the runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Validate,
    InlineFlowParts,
    InsertCheckpoints,
    InsertIdentities,
    SplitIdentities,
    ReduceIdentities,
    BuildStageGraph,
    AnalyzeShuffle,
    AnalyzeStages,
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Postconditions, printed in the verbose pass log.
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Validate => PassDescriptor {
            name: "validate",
            inputs: &[],
            invariants: "mandatory ports connected, graph acyclic",
        },
        PassId::InlineFlowParts => PassDescriptor {
            name: "inline_flow_parts",
            inputs: &[PassId::Validate],
            invariants: "no flow parts remain",
        },
        PassId::InsertCheckpoints => PassDescriptor {
            name: "insert_checkpoints",
            inputs: &[PassId::InlineFlowParts],
            invariants: "diverging shuffles and stage heads are materialized",
        },
        PassId::InsertIdentities => PassDescriptor {
            name: "insert_identities",
            inputs: &[PassId::InsertCheckpoints],
            invariants: "every map-less transition has an identity",
        },
        PassId::SplitIdentities => PassDescriptor {
            name: "split_identities",
            inputs: &[PassId::InsertIdentities],
            invariants: "N2 identities split per connection pair",
        },
        PassId::ReduceIdentities => PassDescriptor {
            name: "reduce_identities",
            inputs: &[PassId::SplitIdentities],
            invariants: "N1-N5 obligations verified",
        },
        PassId::BuildStageGraph => PassDescriptor {
            name: "build_stage_graph",
            inputs: &[PassId::ReduceIdentities],
            invariants: "P1-P3 obligations verified, stage DAG acyclic",
        },
        PassId::AnalyzeShuffle => PassDescriptor {
            name: "analyze_shuffle",
            inputs: &[PassId::BuildStageGraph],
            invariants: "one model per stage with a reduce side",
        },
        PassId::AnalyzeStages => PassDescriptor {
            name: "analyze_stages",
            inputs: &[PassId::AnalyzeShuffle],
            invariants: "fragments chained, units ordered, sinks grouped",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All 9 pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 9] = [
    PassId::Validate,
    PassId::InlineFlowParts,
    PassId::InsertCheckpoints,
    PassId::InsertIdentities,
    PassId::SplitIdentities,
    PassId::ReduceIdentities,
    PassId::BuildStageGraph,
    PassId::AnalyzeShuffle,
    PassId::AnalyzeStages,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Certificates ───────────────────────────────────────────────────────────

/// Machine-checkable postconditions of a pass.
pub trait StageCert {
    /// True when every obligation holds.
    fn all_pass(&self) -> bool;
    /// Named obligations with their outcome, in a fixed order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// Names of the obligations that do not hold.
    fn failures(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
