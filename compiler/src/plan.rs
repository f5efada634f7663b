// plan.rs — Stage graph construction
//
// Partitions a normalized flow graph into flow blocks (map side and reduce
// side chunks between boundaries), connects the blocks through checkpoints,
// and groups them into numbered stages ordered by data dependency.
//
// Preconditions: `graph` is normalized (`verify_normalized(graph).all_pass()`).
// Postconditions: `verify_plan(&result).all_pass()`; stage numbers are 1..=n
//                 in dependency order.
// Failure modes: E0401 when the graph violates a planner invariant (a block
//                fed from the wrong side, a stage depending on itself, a
//                stage cycle). The stage graph is still returned.
// Side effects: appends diagnostics to `sink`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::diag::{codes, DiagSink, Diagnostic};
use crate::graph::{ElementKind, FlowGraph};
use crate::id::{BlockId, ElementId, PortId};
use crate::pass::StageCert;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// Synthetic block holding every global input.
    Input,
    /// Synthetic block holding every global output.
    Output,
    Map,
    Reduce,
}

/// A chunk of one stage's map or reduce side.
#[derive(Debug, Clone)]
pub struct FlowBlock {
    pub id: BlockId,
    pub kind: BlockKind,
    /// Member elements in id order.
    pub elements: Vec<ElementId>,
    /// Member input ports fed from outside the block.
    pub inputs: Vec<PortId>,
    /// Member output ports feeding outside the block.
    pub outputs: Vec<PortId>,
}

impl FlowBlock {
    pub fn contains(&self, elem: ElementId) -> bool {
        self.elements.binary_search(&elem).is_ok()
    }
}

/// Data flow from a block output to a block input, possibly through
/// checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockConnection {
    pub upstream: PortId,
    pub downstream: PortId,
}

/// One stage: its map blocks run first, then its reduce blocks read the
/// shuffled map output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBlock {
    /// 1-based position in dependency order.
    pub number: usize,
    pub map_blocks: Vec<BlockId>,
    pub reduce_blocks: Vec<BlockId>,
}

impl StageBlock {
    pub fn has_reduce(&self) -> bool {
        !self.reduce_blocks.is_empty()
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.map_blocks.iter().chain(&self.reduce_blocks).copied()
    }
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    /// The normalized graph every id refers to.
    pub graph: FlowGraph,
    /// Block arena, indexed by `BlockId`.
    pub blocks: Vec<FlowBlock>,
    pub input: BlockId,
    pub output: BlockId,
    /// Stages in execution order.
    pub stages: Vec<StageBlock>,
    pub connections: Vec<BlockConnection>,
    /// Owning block of every block input and block output port.
    pub port_blocks: HashMap<PortId, BlockId>,
}

impl StageGraph {
    pub fn block(&self, id: BlockId) -> &FlowBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_of_port(&self, port: PortId) -> Option<BlockId> {
        self.port_blocks.get(&port).copied()
    }

    /// True when some output of `upstream` feeds some input of `downstream`.
    pub fn is_connected(&self, upstream: BlockId, downstream: BlockId) -> bool {
        self.connections.iter().any(|c| {
            self.block_of_port(c.upstream) == Some(upstream)
                && self.block_of_port(c.downstream) == Some(downstream)
        })
    }

    /// Block inputs fed by the block output `port`, in connection order.
    pub fn downstream_of(&self, port: PortId) -> Vec<PortId> {
        self.connections
            .iter()
            .filter(|c| c.upstream == port)
            .map(|c| c.downstream)
            .collect()
    }

    /// Block outputs feeding the block input `port`, in connection order.
    pub fn upstream_of(&self, port: PortId) -> Vec<PortId> {
        self.connections
            .iter()
            .filter(|c| c.downstream == port)
            .map(|c| c.upstream)
            .collect()
    }

    /// Index into `stages` of the stage owning `block`.
    pub fn stage_of(&self, block: BlockId) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.blocks().any(|b| b == block))
    }
}

// ── Construction ────────────────────────────────────────────────────────────

/// Partition `graph` into blocks and stages.
pub fn build_stage_graph(graph: FlowGraph, sink: &DiagSink) -> StageGraph {
    let reduce_side = reduce_side(&graph);

    let mut blocks = Vec::new();
    let inputs: Vec<ElementId> = graph
        .elements()
        .filter(|e| matches!(e.kind, ElementKind::Input))
        .map(|e| e.id)
        .collect();
    blocks.push(FlowBlock {
        id: BlockId(0),
        kind: BlockKind::Input,
        inputs: Vec::new(),
        outputs: inputs
            .iter()
            .flat_map(|i| graph.element(*i).outputs.iter().copied())
            .collect(),
        elements: inputs,
    });
    for (kind, members) in components(&graph, &reduce_side) {
        let id = BlockId(blocks.len() as u32);
        blocks.push(make_block(&graph, id, kind, members));
    }
    let output = BlockId(blocks.len() as u32);
    let outputs: Vec<ElementId> = graph
        .elements()
        .filter(|e| matches!(e.kind, ElementKind::Output))
        .map(|e| e.id)
        .collect();
    blocks.push(FlowBlock {
        id: output,
        kind: BlockKind::Output,
        inputs: outputs
            .iter()
            .flat_map(|o| graph.element(*o).inputs.iter().copied())
            .collect(),
        outputs: Vec::new(),
        elements: outputs,
    });

    let mut port_blocks = HashMap::new();
    for b in &blocks {
        for &p in b.inputs.iter().chain(&b.outputs) {
            port_blocks.insert(p, b.id);
        }
    }

    let planner = Planner {
        graph: &graph,
        blocks: &blocks,
        port_blocks: &port_blocks,
        sink,
    };
    let links = planner.connect_blocks();
    let stages = planner.group_stages(&links);

    tracing::debug!(
        blocks = blocks.len(),
        stages = stages.len(),
        "built stage graph"
    );
    StageGraph {
        connections: links.iter().map(|l| l.conn).collect(),
        graph,
        blocks,
        input: BlockId(0),
        output,
        stages,
        port_blocks,
    }
}

/// Shuffle elements and the non-boundary elements reachable from them
/// without crossing another boundary.
fn reduce_side(graph: &FlowGraph) -> HashSet<ElementId> {
    let mut side = HashSet::new();
    let mut queue: VecDeque<ElementId> = graph
        .elements()
        .filter(|e| e.is_shuffle_boundary())
        .map(|e| e.id)
        .collect();
    side.extend(queue.iter().copied());
    while let Some(id) = queue.pop_front() {
        for s in graph.successors(id) {
            if !graph.is_boundary(s) && side.insert(s) {
                queue.push_back(s);
            }
        }
    }
    side
}

/// Undirected components of each side, ordered by their first element.
fn components(graph: &FlowGraph, reduce_side: &HashSet<ElementId>) -> Vec<(BlockKind, Vec<ElementId>)> {
    let side = |id: ElementId| {
        if reduce_side.contains(&id) {
            Some(BlockKind::Reduce)
        } else if graph.is_boundary(id) {
            None
        } else {
            Some(BlockKind::Map)
        }
    };

    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for start in graph.element_ids() {
        let Some(kind) = side(start) else { continue };
        if !seen.insert(start) {
            continue;
        }
        let mut members = vec![start];
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for n in graph.successors(id).into_iter().chain(graph.predecessors(id)) {
                if side(n) == Some(kind) && seen.insert(n) {
                    members.push(n);
                    queue.push_back(n);
                }
            }
        }
        members.sort();
        result.push((kind, members));
    }
    result
}

fn make_block(graph: &FlowGraph, id: BlockId, kind: BlockKind, elements: Vec<ElementId>) -> FlowBlock {
    let members: HashSet<ElementId> = elements.iter().copied().collect();
    let crosses = |port: PortId| {
        graph
            .opposites(port)
            .iter()
            .any(|p| !members.contains(&graph.owner(*p)))
    };
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for &e in &elements {
        let elem = graph.element(e);
        inputs.extend(elem.inputs.iter().copied().filter(|p| crosses(*p)));
        outputs.extend(elem.outputs.iter().copied().filter(|p| crosses(*p)));
    }
    FlowBlock {
        id,
        kind,
        elements,
        inputs,
        outputs,
    }
}

// ── Stage grouping ──────────────────────────────────────────────────────────

/// A block connection with its endpoints resolved.
struct Link {
    conn: BlockConnection,
    from: BlockId,
    to: BlockId,
    /// False when the data passes through a checkpoint.
    direct: bool,
}

struct Planner<'a> {
    graph: &'a FlowGraph,
    blocks: &'a [FlowBlock],
    port_blocks: &'a HashMap<PortId, BlockId>,
    sink: &'a DiagSink,
}

impl Planner<'_> {
    fn kind(&self, b: BlockId) -> BlockKind {
        self.blocks[b.0 as usize].kind
    }

    fn defect(&self, elem: ElementId, message: String) {
        self.sink.emit(
            Diagnostic::error(codes::E0401, message)
                .with_element(elem, self.graph.element(elem).name.clone())
                .with_hint("this is a planner defect; please report it with the flow manifest"),
        );
    }

    /// Resolve every block output to the block inputs it reaches, looking
    /// through checkpoints, and check which side may feed which.
    fn connect_blocks(&self) -> Vec<Link> {
        let mut links = Vec::new();
        for block in self.blocks {
            for &out in &block.outputs {
                let mut targets = Vec::new();
                let mut seen = HashSet::new();
                self.resolve_targets(out, true, &mut targets, &mut seen);
                for (port, direct) in targets {
                    let owner = self.graph.owner(port);
                    // Taps leave the block; the in-block consumers stay internal.
                    if block.contains(owner) {
                        continue;
                    }
                    let Some(&to) = self.port_blocks.get(&port) else {
                        self.defect(
                            owner,
                            format!(
                                "`{}` is fed by block {} but belongs to no block",
                                self.graph.port_label(port),
                                block.id
                            ),
                        );
                        continue;
                    };
                    let link = Link {
                        conn: BlockConnection {
                            upstream: out,
                            downstream: port,
                        },
                        from: block.id,
                        to,
                        direct,
                    };
                    self.check_link(&link);
                    links.push(link);
                }
            }
        }
        links
    }

    fn resolve_targets(
        &self,
        port: PortId,
        direct: bool,
        targets: &mut Vec<(PortId, bool)>,
        seen: &mut HashSet<PortId>,
    ) {
        for d in self.graph.opposites(port) {
            let owner = self.graph.owner(d);
            if self.graph.is_checkpoint(owner) {
                for &o in &self.graph.element(owner).outputs {
                    if seen.insert(o) {
                        self.resolve_targets(o, false, targets, seen);
                    }
                }
            } else if targets.iter().all(|(p, _)| *p != d) {
                targets.push((d, direct));
            }
        }
    }

    fn check_link(&self, link: &Link) {
        let (from, to) = (self.kind(link.from), self.kind(link.to));
        let owner = self.graph.owner(link.conn.downstream);
        let label = self.graph.port_label(link.conn.downstream);
        match (from, to) {
            (BlockKind::Map, BlockKind::Reduce) if !link.direct => self.defect(
                owner,
                format!("reduce input `{label}` is fed through a checkpoint"),
            ),
            (BlockKind::Map, BlockKind::Reduce) if !self.graph.is_shuffle_boundary(owner) => self
                .defect(
                    owner,
                    format!("map output enters reduce block {} at `{label}`, which is not a shuffle", link.to),
                ),
            (_, BlockKind::Reduce) if from != BlockKind::Map => self.defect(
                owner,
                format!("reduce input `{label}` is not fed by a map block"),
            ),
            (BlockKind::Reduce, BlockKind::Map) if link.direct => self.defect(
                owner,
                format!("reduce block {} feeds map input `{label}` without a checkpoint", link.from),
            ),
            _ => {}
        }
    }

    fn group_stages(&self, links: &[Link]) -> Vec<StageBlock> {
        let staged = |b: BlockId| matches!(self.kind(b), BlockKind::Map | BlockKind::Reduce);
        let mut uf = UnionFind::new(self.blocks.len());

        for l in links {
            if self.kind(l.from) == BlockKind::Map && self.kind(l.to) == BlockKind::Reduce {
                uf.union(l.from.0 as usize, l.to.0 as usize);
            }
        }

        // Map blocks reading exactly the same data run in the same stage.
        let mut by_upstream: BTreeMap<BTreeSet<PortId>, Vec<BlockId>> = BTreeMap::new();
        for b in self.blocks.iter().filter(|b| b.kind == BlockKind::Map) {
            let upstream: BTreeSet<PortId> = links
                .iter()
                .filter(|l| l.to == b.id)
                .map(|l| l.conn.upstream)
                .collect();
            if !upstream.is_empty() {
                by_upstream.entry(upstream).or_default().push(b.id);
            }
        }
        for group in by_upstream.values() {
            for pair in group.windows(2) {
                uf.union(pair[0].0 as usize, pair[1].0 as usize);
            }
        }

        // Groups keyed by their smallest block id.
        let mut groups: BTreeMap<usize, Vec<BlockId>> = BTreeMap::new();
        let mut root_min: HashMap<usize, usize> = HashMap::new();
        for b in self.blocks.iter().filter(|b| staged(b.id)) {
            let root = uf.find(b.id.0 as usize);
            let min = *root_min.entry(root).or_insert(b.id.0 as usize);
            groups.entry(min).or_default().push(b.id);
        }
        let group_of = |b: BlockId, uf: &mut UnionFind| root_min[&uf.find(b.0 as usize)];

        let mut deps: BTreeMap<usize, BTreeSet<usize>> = groups.keys().map(|g| (*g, BTreeSet::new())).collect();
        for l in links.iter().filter(|l| staged(l.from) && staged(l.to)) {
            let (gu, gd) = (group_of(l.from, &mut uf), group_of(l.to, &mut uf));
            if gu != gd {
                if let Some(set) = deps.get_mut(&gd) {
                    set.insert(gu);
                }
            } else if !(self.kind(l.from) == BlockKind::Map && self.kind(l.to) == BlockKind::Reduce) {
                let owner = self.graph.owner(l.conn.downstream);
                self.defect(
                    owner,
                    format!("stage containing block {} depends on itself", l.from),
                );
            }
        }

        let order = self.topo_order(&deps);
        order
            .into_iter()
            .enumerate()
            .map(|(i, g)| {
                let members = &groups[&g];
                StageBlock {
                    number: i + 1,
                    map_blocks: members
                        .iter()
                        .copied()
                        .filter(|b| self.kind(*b) == BlockKind::Map)
                        .collect(),
                    reduce_blocks: members
                        .iter()
                        .copied()
                        .filter(|b| self.kind(*b) == BlockKind::Reduce)
                        .collect(),
                }
            })
            .collect()
    }

    /// Kahn's algorithm; among ready stages the one with the smallest block
    /// id goes first.
    fn topo_order(&self, deps: &BTreeMap<usize, BTreeSet<usize>>) -> Vec<usize> {
        let mut remaining: BTreeMap<usize, usize> = deps.iter().map(|(g, d)| (*g, d.len())).collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(g, _)| *g)
            .collect();
        let mut order = Vec::new();
        while let Some(g) = ready.pop_first() {
            remaining.remove(&g);
            order.push(g);
            for (d, ups) in deps {
                if ups.contains(&g) {
                    if let Some(n) = remaining.get_mut(d) {
                        *n -= 1;
                        if *n == 0 {
                            ready.insert(*d);
                        }
                    }
                }
            }
        }
        if let Some((&g, _)) = remaining.iter().next() {
            let block = &self.blocks[g];
            if let Some(&elem) = block.elements.first() {
                self.defect(elem, format!("stages form a cycle through block {}", block.id));
            }
            order.extend(remaining.keys().copied());
        }
        order
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller index wins so roots stay stable across runs.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

// ── Certificate ─────────────────────────────────────────────────────────────

/// Postconditions of stage graph construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanCert {
    /// P1: every non-boundary element is in exactly one block.
    pub p1_elements_partitioned: bool,
    /// P2: every map and reduce block belongs to exactly one stage.
    pub p2_blocks_staged: bool,
    /// P3: no stage reads from a later stage.
    pub p3_dependency_order: bool,
}

impl StageCert for PlanCert {
    fn all_pass(&self) -> bool {
        self.p1_elements_partitioned && self.p2_blocks_staged && self.p3_dependency_order
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("P1_elements_partitioned", self.p1_elements_partitioned),
            ("P2_blocks_staged", self.p2_blocks_staged),
            ("P3_dependency_order", self.p3_dependency_order),
        ]
    }
}

pub fn verify_plan(sg: &StageGraph) -> PlanCert {
    let mut membership: HashMap<ElementId, usize> = HashMap::new();
    for b in &sg.blocks {
        for e in &b.elements {
            *membership.entry(*e).or_default() += 1;
        }
    }
    let p1 = sg
        .graph
        .elements()
        .filter(|e| !e.is_boundary())
        .all(|e| membership.get(&e.id) == Some(&1));

    let p2 = sg
        .blocks
        .iter()
        .filter(|b| matches!(b.kind, BlockKind::Map | BlockKind::Reduce))
        .all(|b| sg.stages.iter().filter(|s| s.blocks().any(|x| x == b.id)).count() == 1);

    let p3 = sg.connections.iter().all(|c| {
        let (Some(u), Some(d)) = (sg.block_of_port(c.upstream), sg.block_of_port(c.downstream)) else {
            return false;
        };
        match (sg.stage_of(u), sg.stage_of(d)) {
            (Some(su), Some(sd)) => su < sd || (su == sd && sg.block(d).kind == BlockKind::Reduce),
            _ => true,
        }
    });

    PlanCert {
        p1_elements_partitioned: p1,
        p2_blocks_staged: p2,
        p3_dependency_order: p3,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
