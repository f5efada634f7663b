// stage.rs — Per-stage fragment analysis
//
// Splits every block of a stage into fragments (maximal linear chains of
// operators run without re-entering the engine), orders them into map and
// reduce units, and groups the stage's external outputs into sinks.
//
// Preconditions: `stage` belongs to `stage_graph`.
// Postconditions: unit fragments are ordered producers first; sink names are
//                 result1..resultN in block output order.
// Failure modes: E0202 when an operator has no processor. The element gets
//                the empty processor so the rest of the stage is still
//                checked, and the stage yields no model.
// Side effects: appends diagnostics to `sink`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::diag::{codes, DiagSink, Diagnostic};
use crate::id::{BlockId, ElementId, FragmentId, PortId};
use crate::plan::{StageBlock, StageGraph};
use crate::registry::{Processor, ProcessorKind, ProcessorRegistry};
use crate::shuffle::ShuffleModel;

// ── Public types ────────────────────────────────────────────────────────────

/// One element of a fragment with the processor that executes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Factor {
    pub element: ElementId,
    pub processor: Processor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: FragmentId,
    pub block: BlockId,
    pub factors: Vec<Factor>,
    /// Resources declared by the factors' operators, first occurrence order.
    pub resources: Vec<String>,
    /// Output ports of the last factor.
    pub outputs: Vec<PortId>,
}

impl Fragment {
    pub fn head(&self) -> ElementId {
        self.factors[0].element
    }

    pub fn elements(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.factors.iter().map(|f| f.element)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapUnit {
    /// Map block inputs this unit reads.
    pub inputs: Vec<PortId>,
    pub fragments: Vec<FragmentId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceUnit {
    /// The rendezvous element whose inputs this unit reads.
    pub element: ElementId,
    pub inputs: Vec<PortId>,
    pub fragments: Vec<FragmentId>,
}

/// Block outputs written once for a shared set of consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sink {
    pub name: String,
    pub outputs: Vec<PortId>,
    /// Block inputs of later stages (or the output block) fed by this sink.
    pub downstream: Vec<PortId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageModel {
    pub stage: usize,
    /// Fragment arena, indexed by `FragmentId`.
    pub fragments: Vec<Fragment>,
    pub map_units: Vec<MapUnit>,
    pub shuffle: Option<ShuffleModel>,
    pub reduce_units: Vec<ReduceUnit>,
    pub sinks: Vec<Sink>,
}

impl StageModel {
    pub fn fragment(&self, id: FragmentId) -> &Fragment {
        &self.fragments[id.0 as usize]
    }
}

// ── Analysis ────────────────────────────────────────────────────────────────

/// Build the stage model of `stage`. Returns `None` when this call raised
/// an error.
pub fn analyze_stage(
    stage_graph: &StageGraph,
    stage: &StageBlock,
    shuffle: Option<&ShuffleModel>,
    processors: &ProcessorRegistry,
    sink: &DiagSink,
) -> Option<StageModel> {
    let mut cx = StageAnalyzer {
        sg: stage_graph,
        processors,
        sink,
        saw_error: false,
        fragments: Vec::new(),
        head_of: HashMap::new(),
        edges: BTreeMap::new(),
    };
    for block in stage.blocks() {
        cx.build_fragments(block);
    }

    let map_units = cx.map_units(stage);
    let reduce_units = cx.reduce_units(stage);
    let sinks = cx.sinks(stage, &map_units, &reduce_units);

    tracing::debug!(
        stage = stage.number,
        fragments = cx.fragments.len(),
        map_units = map_units.len(),
        reduce_units = reduce_units.len(),
        sinks = sinks.len(),
        "analyzed stage"
    );
    if cx.saw_error {
        return None;
    }
    Some(StageModel {
        stage: stage.number,
        fragments: cx.fragments,
        map_units,
        shuffle: shuffle.cloned(),
        reduce_units,
        sinks,
    })
}

fn ends_fragment(p: &Processor) -> bool {
    !p.is_empty() && matches!(p.kind, ProcessorKind::LineEnd | ProcessorKind::Rendezvous)
}

struct StageAnalyzer<'a> {
    sg: &'a StageGraph,
    processors: &'a ProcessorRegistry,
    sink: &'a DiagSink,
    saw_error: bool,
    fragments: Vec<Fragment>,
    head_of: HashMap<ElementId, FragmentId>,
    edges: BTreeMap<FragmentId, BTreeSet<FragmentId>>,
}

impl StageAnalyzer<'_> {
    fn processor(&mut self, element: ElementId) -> Processor {
        let elem = self.sg.graph.element(element);
        if let Some(p) = self.processors.resolve(elem) {
            return p.clone();
        }
        let kind = elem.operator().map(|d| d.kind.as_str()).unwrap_or("");
        self.sink.emit(
            Diagnostic::error(
                codes::E0202,
                format!("no processor for `{}` (kind `{kind}`)", elem.name),
            )
            .with_element(element, elem.name.clone())
            .with_hint(format!("register a processor named `{kind}`")),
        );
        self.saw_error = true;
        self.processors.empty().clone()
    }

    fn build_fragments(&mut self, block_id: BlockId) {
        let sg = self.sg;
        let graph = &sg.graph;
        let block = sg.block(block_id);
        let members: HashSet<ElementId> = block.elements.iter().copied().collect();
        let in_block = |ids: Vec<ElementId>| -> Vec<ElementId> {
            ids.into_iter().filter(|e| members.contains(e)).collect()
        };
        let input_owners: HashSet<ElementId> = block.inputs.iter().map(|p| graph.owner(*p)).collect();
        let output_owners: HashSet<ElementId> = block.outputs.iter().map(|p| graph.owner(*p)).collect();

        let procs: HashMap<ElementId, Processor> = block
            .elements
            .iter()
            .map(|&e| (e, self.processor(e)))
            .collect();

        let mut starts = BTreeSet::new();
        for &e in &block.elements {
            if in_block(graph.predecessors(e)).len() != 1 || input_owners.contains(&e) {
                starts.insert(e);
            }
            let splits = graph.outgoing(e).len() >= 2
                || graph.element(e).outputs.len() >= 2
                || output_owners.contains(&e)
                || ends_fragment(&procs[&e]);
            if splits {
                starts.extend(in_block(graph.successors(e)));
            }
        }

        let first = self.fragments.len();
        for &start in &starts {
            let id = FragmentId(self.fragments.len() as u32);
            let mut factors = Vec::new();
            let mut resources: Vec<String> = Vec::new();
            let mut cur = start;
            loop {
                let processor = procs[&cur].clone();
                if let Some(desc) = graph.element(cur).operator() {
                    for r in &desc.resources {
                        if !resources.contains(r) {
                            resources.push(r.clone());
                        }
                    }
                }
                let stop = ends_fragment(&processor);
                factors.push(Factor {
                    element: cur,
                    processor,
                });
                if stop {
                    break;
                }
                match in_block(graph.successors(cur)).as_slice() {
                    [next] if !starts.contains(next) => cur = *next,
                    _ => break,
                }
            }
            self.head_of.insert(start, id);
            self.fragments.push(Fragment {
                id,
                block: block_id,
                factors,
                resources,
                outputs: graph.element(cur).outputs.clone(),
            });
        }

        for f in &self.fragments[first..] {
            for &out in &f.outputs {
                for d in graph.opposites(out) {
                    let owner = graph.owner(d);
                    if let (true, Some(&next)) = (members.contains(&owner), self.head_of.get(&owner)) {
                        self.edges.entry(f.id).or_default().insert(next);
                    }
                }
            }
        }
        tracing::trace!(block = %block_id, fragments = self.fragments.len() - first, "split block");
    }

    /// Fragments reachable from `heads`, producers first, ties by id.
    fn ordered_from(&self, heads: &[FragmentId]) -> Vec<FragmentId> {
        let mut reach: BTreeSet<FragmentId> = heads.iter().copied().collect();
        let mut queue: VecDeque<FragmentId> = heads.iter().copied().collect();
        while let Some(f) = queue.pop_front() {
            for &n in self.edges.get(&f).into_iter().flatten() {
                if reach.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        let mut indegree: BTreeMap<FragmentId, usize> = reach.iter().map(|f| (*f, 0)).collect();
        for f in &reach {
            for n in self.edges.get(f).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(n) {
                    *d += 1;
                }
            }
        }
        let mut ready: BTreeSet<FragmentId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(f, _)| *f)
            .collect();
        let mut order = Vec::with_capacity(reach.len());
        while let Some(f) = ready.pop_first() {
            order.push(f);
            for n in self.edges.get(&f).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(n) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*n);
                    }
                }
            }
        }
        order
    }

    fn head_for(&self, input: PortId) -> Option<FragmentId> {
        self.head_of.get(&self.sg.graph.owner(input)).copied()
    }

    /// One unit per map block input, then units reading the same upstream
    /// outputs are merged.
    fn map_units(&self, stage: &StageBlock) -> Vec<MapUnit> {
        let mut groups: Vec<(BTreeSet<PortId>, Vec<PortId>)> = Vec::new();
        for b in &stage.map_blocks {
            for &input in &self.sg.block(*b).inputs {
                let sources: BTreeSet<PortId> = self.sg.upstream_of(input).into_iter().collect();
                match groups.iter_mut().find(|(s, _)| *s == sources) {
                    Some((_, inputs)) => inputs.push(input),
                    None => groups.push((sources, vec![input])),
                }
            }
        }
        groups
            .into_iter()
            .map(|(_, inputs)| {
                let heads: Vec<FragmentId> = inputs.iter().filter_map(|p| self.head_for(*p)).collect();
                MapUnit {
                    fragments: self.ordered_from(&heads),
                    inputs,
                }
            })
            .collect()
    }

    /// One unit per rendezvous element.
    fn reduce_units(&self, stage: &StageBlock) -> Vec<ReduceUnit> {
        let mut groups: Vec<(ElementId, Vec<PortId>)> = Vec::new();
        for b in &stage.reduce_blocks {
            for &input in &self.sg.block(*b).inputs {
                let owner = self.sg.graph.owner(input);
                match groups.iter_mut().find(|(e, _)| *e == owner) {
                    Some((_, inputs)) => inputs.push(input),
                    None => groups.push((owner, vec![input])),
                }
            }
        }
        groups
            .into_iter()
            .map(|(element, inputs)| {
                let heads: Vec<FragmentId> = self.head_of.get(&element).copied().into_iter().collect();
                ReduceUnit {
                    element,
                    inputs,
                    fragments: self.ordered_from(&heads),
                }
            })
            .collect()
    }

    /// Block outputs leaving the stage, grouped by their consumer set.
    fn sinks(&self, stage: &StageBlock, map_units: &[MapUnit], reduce_units: &[ReduceUnit]) -> Vec<Sink> {
        let unit_outputs: HashSet<PortId> = map_units
            .iter()
            .flat_map(|u| u.fragments.iter())
            .chain(reduce_units.iter().flat_map(|u| u.fragments.iter()))
            .flat_map(|f| self.fragments[f.0 as usize].outputs.iter().copied())
            .collect();
        let local_reduce_inputs: HashSet<PortId> = stage
            .reduce_blocks
            .iter()
            .flat_map(|b| self.sg.block(*b).inputs.iter().copied())
            .collect();

        let mut groups: Vec<(Vec<PortId>, Vec<PortId>)> = Vec::new();
        for b in stage.blocks() {
            for &out in &self.sg.block(b).outputs {
                if !unit_outputs.contains(&out) {
                    continue;
                }
                let downstream: Vec<PortId> = self
                    .sg
                    .downstream_of(out)
                    .into_iter()
                    .filter(|p| !local_reduce_inputs.contains(p))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                if downstream.is_empty() {
                    continue;
                }
                match groups.iter_mut().find(|(d, _)| *d == downstream) {
                    Some((_, outputs)) => outputs.push(out),
                    None => groups.push((downstream, vec![out])),
                }
            }
        }
        groups
            .into_iter()
            .enumerate()
            .map(|(i, (downstream, outputs))| Sink {
                name: format!("result{}", i + 1),
                outputs,
                downstream,
            })
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
