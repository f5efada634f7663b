// graph.rs — Flow graph arena: elements, ports, and connections
//
// The flow graph is an arena of elements keyed by stable `ElementId`s, a port
// arena keyed by `PortId`, and an explicit, ordered connection list. Rewrite
// passes add and remove elements through this API without invalidating IDs
// held elsewhere.
//
// Preconditions: none.
// Postconditions: every port belongs to exactly one live element; every
//                 connection joins a live output port to a live input port.
// Failure modes: accessor methods taking an ID (`element`, `port`) panic on
//                IDs that are not in the graph, like slice indexing.
// Side effects: none.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{ElementId, IdAllocator, PortId};

// ── Attribute types ─────────────────────────────────────────────────────────

/// Where a physical stage transition must occur relative to an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    #[default]
    None,
    /// On a pseudo element: a checkpoint (materialization point).
    /// On an operator: the operator must start a new stage.
    Stage,
    /// The element is a rendezvous: its inputs are shuffled.
    Shuffle,
}

/// Whether a port must be connected for the graph to be valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    #[default]
    Mandatory,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

/// Identifier of a data class in the data-class repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataType(pub String);

impl DataType {
    pub fn new(name: impl Into<String>) -> Self {
        DataType(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One ordering clause of a shuffle key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyOrder {
    pub property: String,
    pub direction: SortDirection,
}

/// Grouping property names plus ordered sort clauses, declared on a
/// rendezvous input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ShuffleKey {
    #[serde(default)]
    pub group: Vec<String>,
    #[serde(default)]
    pub order: Vec<KeyOrder>,
}

impl ShuffleKey {
    pub fn group<I, S>(props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ShuffleKey {
            group: props.into_iter().map(Into::into).collect(),
            order: Vec::new(),
        }
    }

    pub fn then(mut self, property: impl Into<String>, direction: SortDirection) -> Self {
        self.order.push(KeyOrder {
            property: property.into(),
            direction,
        });
        self
    }
}

// ── Ports ───────────────────────────────────────────────────────────────────

/// Declaration of a port, used when adding elements.
#[derive(Debug, Clone, PartialEq)]
pub struct PortDecl {
    pub name: String,
    pub data_type: DataType,
    pub connectivity: Connectivity,
    pub key: Option<ShuffleKey>,
}

impl PortDecl {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        PortDecl {
            name: name.into(),
            data_type,
            connectivity: Connectivity::Mandatory,
            key: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.connectivity = Connectivity::Optional;
        self
    }

    pub fn with_key(mut self, key: ShuffleKey) -> Self {
        self.key = Some(key);
        self
    }
}

/// A port owned by exactly one element.
#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub id: PortId,
    pub owner: ElementId,
    pub direction: PortDirection,
    pub name: String,
    pub data_type: DataType,
    pub connectivity: Connectivity,
    pub key: Option<ShuffleKey>,
}

// ── Elements ────────────────────────────────────────────────────────────────

/// Description of user logic attached to an operator element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorDesc {
    pub name: String,
    /// Processor lookup key.
    pub kind: String,
    /// Side-data resources the operator reads.
    #[serde(default)]
    pub resources: Vec<String>,
}

impl OperatorDesc {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        OperatorDesc {
            name: name.into(),
            kind: kind.into(),
            resources: Vec::new(),
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum ElementKind {
    Input,
    Output,
    Operator(OperatorDesc),
    Pseudo,
    FlowPart(Box<FlowGraph>),
}

#[derive(Debug, Clone)]
pub struct Element {
    pub id: ElementId,
    pub name: String,
    pub kind: ElementKind,
    pub boundary: Boundary,
    pub inputs: Vec<PortId>,
    pub outputs: Vec<PortId>,
}

impl Element {
    pub fn operator(&self) -> Option<&OperatorDesc> {
        match &self.kind {
            ElementKind::Operator(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn is_pseudo(&self) -> bool {
        matches!(self.kind, ElementKind::Pseudo)
    }

    /// Input, output, or checkpoint: data is materialized here.
    pub fn is_stage_boundary(&self) -> bool {
        match self.kind {
            ElementKind::Input | ElementKind::Output => true,
            ElementKind::Pseudo => self.boundary == Boundary::Stage,
            _ => false,
        }
    }

    pub fn is_shuffle_boundary(&self) -> bool {
        self.boundary == Boundary::Shuffle
    }

    pub fn is_boundary(&self) -> bool {
        self.is_stage_boundary() || self.is_shuffle_boundary()
    }

    pub fn is_identity(&self) -> bool {
        self.is_pseudo() && self.boundary == Boundary::None
    }

    pub fn is_checkpoint(&self) -> bool {
        self.is_pseudo() && self.boundary == Boundary::Stage
    }

    /// An operator that must read materialized data.
    pub fn is_stage_head(&self) -> bool {
        matches!(self.kind, ElementKind::Operator(_)) && self.boundary == Boundary::Stage
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            ElementKind::Input => "input",
            ElementKind::Output => "output",
            ElementKind::Operator(_) => "operator",
            ElementKind::Pseudo if self.boundary == Boundary::Stage => "checkpoint",
            ElementKind::Pseudo => "identity",
            ElementKind::FlowPart(_) => "flow-part",
        }
    }
}

/// An edge from an output port to an input port. The graph owns the edge set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Connection {
    pub upstream: PortId,
    pub downstream: PortId,
}

// ── Flow graph ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    ids: IdAllocator,
    elements: BTreeMap<ElementId, Element>,
    ports: BTreeMap<PortId, Port>,
    connections: Vec<Connection>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Construction ────────────────────────────────────────────────────

    pub fn add_input(&mut self, name: impl Into<String>, data_type: DataType) -> ElementId {
        self.add_element(
            name.into(),
            ElementKind::Input,
            Boundary::None,
            Vec::new(),
            vec![PortDecl::new("out", data_type)],
        )
    }

    pub fn add_output(&mut self, name: impl Into<String>, data_type: DataType) -> ElementId {
        self.add_element(
            name.into(),
            ElementKind::Output,
            Boundary::None,
            vec![PortDecl::new("in", data_type)],
            Vec::new(),
        )
    }

    pub fn add_operator(
        &mut self,
        name: impl Into<String>,
        desc: OperatorDesc,
        inputs: Vec<PortDecl>,
        outputs: Vec<PortDecl>,
        boundary: Boundary,
    ) -> ElementId {
        self.add_element(
            name.into(),
            ElementKind::Operator(desc),
            boundary,
            inputs,
            outputs,
        )
    }

    /// Add a pass-through element: an identity for `Boundary::None`, a
    /// checkpoint for `Boundary::Stage`.
    pub fn add_pseudo(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        boundary: Boundary,
    ) -> ElementId {
        self.add_element(
            name.into(),
            ElementKind::Pseudo,
            boundary,
            vec![PortDecl::new("in", data_type.clone())],
            vec![PortDecl::new("out", data_type)],
        )
    }

    /// Add a nested flow graph. Its ports mirror the inner graph's inputs
    /// and outputs, in registration order, named after them.
    pub fn add_flow_part(&mut self, name: impl Into<String>, inner: FlowGraph) -> ElementId {
        let (inputs, outputs) = inner.exposed_ports();
        self.add_element(
            name.into(),
            ElementKind::FlowPart(Box::new(inner)),
            Boundary::None,
            inputs,
            outputs,
        )
    }

    /// Port declarations a flow part wrapping this graph exposes.
    pub fn exposed_ports(&self) -> (Vec<PortDecl>, Vec<PortDecl>) {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for elem in self.elements.values() {
            match elem.kind {
                ElementKind::Input => {
                    let ty = elem
                        .outputs
                        .first()
                        .map(|p| self.ports[p].data_type.clone())
                        .unwrap_or_else(|| DataType::new(""));
                    inputs.push(PortDecl::new(elem.name.clone(), ty));
                }
                ElementKind::Output => {
                    let ty = elem
                        .inputs
                        .first()
                        .map(|p| self.ports[p].data_type.clone())
                        .unwrap_or_else(|| DataType::new(""));
                    outputs.push(PortDecl::new(elem.name.clone(), ty));
                }
                _ => {}
            }
        }
        (inputs, outputs)
    }

    fn add_element(
        &mut self,
        name: String,
        kind: ElementKind,
        boundary: Boundary,
        inputs: Vec<PortDecl>,
        outputs: Vec<PortDecl>,
    ) -> ElementId {
        let id = self.ids.alloc_element();
        let inputs = inputs
            .into_iter()
            .map(|decl| self.add_port(id, PortDirection::Input, decl))
            .collect();
        let outputs = outputs
            .into_iter()
            .map(|decl| self.add_port(id, PortDirection::Output, decl))
            .collect();
        self.elements.insert(
            id,
            Element {
                id,
                name,
                kind,
                boundary,
                inputs,
                outputs,
            },
        );
        id
    }

    fn add_port(&mut self, owner: ElementId, direction: PortDirection, decl: PortDecl) -> PortId {
        let id = self.ids.alloc_port();
        self.ports.insert(
            id,
            Port {
                id,
                owner,
                direction,
                name: decl.name,
                data_type: decl.data_type,
                connectivity: decl.connectivity,
                key: decl.key,
            },
        );
        id
    }

    /// Connect an output port to an input port. Returns `false` if the
    /// connection already exists or the ports have the wrong direction.
    pub fn connect(&mut self, upstream: PortId, downstream: PortId) -> bool {
        let ok = matches!(
            (self.ports.get(&upstream), self.ports.get(&downstream)),
            (Some(u), Some(d)) if u.direction == PortDirection::Output
                && d.direction == PortDirection::Input
        );
        let conn = Connection {
            upstream,
            downstream,
        };
        if !ok || self.connections.contains(&conn) {
            return false;
        }
        self.connections.push(conn);
        true
    }

    pub fn disconnect(&mut self, upstream: PortId, downstream: PortId) -> bool {
        let before = self.connections.len();
        self.connections
            .retain(|c| !(c.upstream == upstream && c.downstream == downstream));
        self.connections.len() != before
    }

    /// Remove an element with its ports and every connection touching them.
    pub fn remove_element(&mut self, id: ElementId) -> Option<Element> {
        let elem = self.elements.remove(&id)?;
        let owned: HashSet<PortId> = elem.inputs.iter().chain(&elem.outputs).copied().collect();
        self.connections
            .retain(|c| !owned.contains(&c.upstream) && !owned.contains(&c.downstream));
        for p in &owned {
            self.ports.remove(p);
        }
        Some(elem)
    }

    pub fn rename(&mut self, id: ElementId, name: impl Into<String>) {
        if let Some(elem) = self.elements.get_mut(&id) {
            elem.name = name.into();
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn get(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn element(&self, id: ElementId) -> &Element {
        &self.elements[&id]
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.elements.contains_key(&id)
    }

    /// Elements in registration order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn element_ids(&self) -> Vec<ElementId> {
        self.elements.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get_port(&self, id: PortId) -> Option<&Port> {
        self.ports.get(&id)
    }

    pub fn port(&self, id: PortId) -> &Port {
        &self.ports[&id]
    }

    pub fn owner(&self, port: PortId) -> ElementId {
        self.ports[&port].owner
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// First element registered under `name`.
    pub fn find(&self, name: &str) -> Option<ElementId> {
        self.elements.values().find(|e| e.name == name).map(|e| e.id)
    }

    pub fn input_port(&self, elem: ElementId, name: &str) -> Option<PortId> {
        let elem = self.elements.get(&elem)?;
        elem.inputs.iter().copied().find(|p| self.ports[p].name == name)
    }

    pub fn output_port(&self, elem: ElementId, name: &str) -> Option<PortId> {
        let elem = self.elements.get(&elem)?;
        elem.outputs.iter().copied().find(|p| self.ports[p].name == name)
    }

    /// `element.port` label for diagnostics and dumps.
    pub fn port_label(&self, port: PortId) -> String {
        match self.ports.get(&port) {
            Some(p) => match self.elements.get(&p.owner) {
                Some(e) => format!("{}.{}", e.name, p.name),
                None => format!("?.{}", p.name),
            },
            None => format!("{port}"),
        }
    }

    /// Declaration that recreates `port` on another element.
    pub fn port_decl(&self, port: PortId) -> PortDecl {
        let p = &self.ports[&port];
        PortDecl {
            name: p.name.clone(),
            data_type: p.data_type.clone(),
            connectivity: p.connectivity,
            key: p.key.clone(),
        }
    }

    // ── Structural queries ──────────────────────────────────────────────

    /// Ports on the other side of every connection of `port`, in connection order.
    pub fn opposites(&self, port: PortId) -> Vec<PortId> {
        self.connections
            .iter()
            .filter_map(|c| {
                if c.upstream == port {
                    Some(c.downstream)
                } else if c.downstream == port {
                    Some(c.upstream)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn is_connected(&self, port: PortId) -> bool {
        self.connections
            .iter()
            .any(|c| c.upstream == port || c.downstream == port)
    }

    /// Connections into `elem`, ordered by input port then connection order.
    pub fn incoming(&self, elem: ElementId) -> Vec<Connection> {
        let Some(e) = self.elements.get(&elem) else {
            return Vec::new();
        };
        e.inputs
            .iter()
            .flat_map(|p| self.connections.iter().filter(move |c| c.downstream == *p))
            .copied()
            .collect()
    }

    /// Connections out of `elem`, ordered by output port then connection order.
    pub fn outgoing(&self, elem: ElementId) -> Vec<Connection> {
        let Some(e) = self.elements.get(&elem) else {
            return Vec::new();
        };
        e.outputs
            .iter()
            .flat_map(|p| self.connections.iter().filter(move |c| c.upstream == *p))
            .copied()
            .collect()
    }

    /// Distinct downstream elements, in port and connection order.
    pub fn successors(&self, elem: ElementId) -> Vec<ElementId> {
        dedup_in_order(self.outgoing(elem).iter().map(|c| self.owner(c.downstream)))
    }

    /// Distinct upstream elements, in port and connection order.
    pub fn predecessors(&self, elem: ElementId) -> Vec<ElementId> {
        dedup_in_order(self.incoming(elem).iter().map(|c| self.owner(c.upstream)))
    }

    pub fn is_stage_boundary(&self, id: ElementId) -> bool {
        self.elements.get(&id).is_some_and(Element::is_stage_boundary)
    }

    pub fn is_shuffle_boundary(&self, id: ElementId) -> bool {
        self.elements.get(&id).is_some_and(Element::is_shuffle_boundary)
    }

    pub fn is_boundary(&self, id: ElementId) -> bool {
        self.elements.get(&id).is_some_and(Element::is_boundary)
    }

    pub fn is_identity(&self, id: ElementId) -> bool {
        self.elements.get(&id).is_some_and(Element::is_identity)
    }

    pub fn is_checkpoint(&self, id: ElementId) -> bool {
        self.elements.get(&id).is_some_and(Element::is_checkpoint)
    }

    pub fn is_stage_head(&self, id: ElementId) -> bool {
        self.elements.get(&id).is_some_and(Element::is_stage_head)
    }

    pub fn has_flow_parts(&self) -> bool {
        self.elements
            .values()
            .any(|e| matches!(e.kind, ElementKind::FlowPart(_)))
    }

    /// Boundary elements reached from `port` by walking forward through
    /// non-boundary elements, in discovery order.
    pub fn succeeding_boundaries(&self, port: PortId) -> Vec<ElementId> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ElementId> = self
            .opposites(port)
            .into_iter()
            .map(|p| self.owner(p))
            .collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if self.is_boundary(id) {
                found.push(id);
            } else {
                queue.extend(self.successors(id));
            }
        }
        found
    }

    // ── Rewrite primitives ──────────────────────────────────────────────

    /// Insert a pseudo element on one connection: `up -> pseudo -> down`.
    pub fn insert_pseudo_on(&mut self, conn: Connection, boundary: Boundary) -> ElementId {
        let data_type = self.ports[&conn.upstream].data_type.clone();
        let id = self.add_fresh_pseudo(data_type, boundary);
        self.disconnect(conn.upstream, conn.downstream);
        let (pin, pout) = self.pseudo_ports(id);
        self.connect(conn.upstream, pin);
        self.connect(pout, conn.downstream);
        id
    }

    /// Insert a pseudo element right after an output port; every existing
    /// connection of the port is moved behind it.
    pub fn insert_pseudo_after(&mut self, port: PortId, boundary: Boundary) -> ElementId {
        let data_type = self.ports[&port].data_type.clone();
        let downstream = self.opposites(port);
        let id = self.add_fresh_pseudo(data_type, boundary);
        let (pin, pout) = self.pseudo_ports(id);
        for d in downstream {
            self.disconnect(port, d);
            self.connect(pout, d);
        }
        self.connect(port, pin);
        id
    }

    /// Connect every upstream of `elem` to every downstream of `elem`, then
    /// remove it. Returns `false` if `elem` is not in the graph.
    pub fn bypass(&mut self, elem: ElementId) -> bool {
        if !self.contains(elem) {
            return false;
        }
        let ups: Vec<PortId> = self.incoming(elem).iter().map(|c| c.upstream).collect();
        let downs: Vec<PortId> = self.outgoing(elem).iter().map(|c| c.downstream).collect();
        self.remove_element(elem);
        for &u in &ups {
            for &d in &downs {
                self.connect(u, d);
            }
        }
        true
    }

    fn add_fresh_pseudo(&mut self, data_type: DataType, boundary: Boundary) -> ElementId {
        let id = self.add_pseudo(String::new(), data_type, boundary);
        let label = self.elements[&id].kind_label();
        self.rename(id, format!("{label}#{}", id.0));
        id
    }

    fn pseudo_ports(&self, id: ElementId) -> (PortId, PortId) {
        let e = &self.elements[&id];
        (e.inputs[0], e.outputs[0])
    }
}

fn dedup_in_order(ids: impl Iterator<Item = ElementId>) -> Vec<ElementId> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for FlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for elem in self.elements.values() {
            write!(f, "{} {} `{}`", elem.id, elem.kind_label(), elem.name)?;
            if let Some(desc) = elem.operator() {
                write!(f, " [{}]", desc.kind)?;
                match elem.boundary {
                    Boundary::None => {}
                    Boundary::Stage => write!(f, " @stage")?,
                    Boundary::Shuffle => write!(f, " @shuffle")?,
                }
            }
            writeln!(f)?;
        }
        for c in &self.connections {
            writeln!(
                f,
                "{} -> {}",
                self.port_label(c.upstream),
                self.port_label(c.downstream)
            )?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
