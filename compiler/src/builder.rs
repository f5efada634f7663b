// builder.rs — Name-addressed flow graph construction
//
// Builds a `FlowGraph` from element names and `element.port` references.
// Calls chain; the first failure is recorded and reported by `build()`, so a
// whole description can be written before checking for mistakes.
//
// Preconditions: none.
// Postconditions: `build()` returns a graph whose element names are unique.
// Failure modes: duplicate element names, unknown element or port references,
//                ambiguous port references → `BuildError`.
// Side effects: none.

use std::collections::HashMap;

use thiserror::Error;

use crate::graph::{Boundary, Connectivity, DataType, FlowGraph, OperatorDesc, PortDecl};
use crate::id::{ElementId, PortId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("element `{0}` is defined more than once")]
    Duplicate(String),
    #[error("unknown element `{0}`")]
    UnknownElement(String),
    #[error("element `{element}` has no {direction} port `{port}`")]
    UnknownPort {
        element: String,
        port: String,
        direction: &'static str,
    },
    #[error("element `{element}` has {count} {direction} ports; name one as `{element}.<port>`")]
    AmbiguousPort {
        element: String,
        count: usize,
        direction: &'static str,
    },
}

/// Chained builder for flow graphs.
///
/// ```
/// use flowc::builder::FlowGraphBuilder;
/// use flowc::graph::Boundary;
///
/// let mut b = FlowGraphBuilder::new();
/// b.input("in")
///     .operator("op", "update", "in", "out", Boundary::None)
///     .output("out")
///     .connect("in", "op.in")
///     .connect("op", "out");
/// let graph = b.build().unwrap();
/// assert_eq!(graph.len(), 3);
/// ```
#[derive(Debug)]
pub struct FlowGraphBuilder {
    graph: FlowGraph,
    names: HashMap<String, ElementId>,
    data_type: DataType,
    error: Option<BuildError>,
}

impl Default for FlowGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowGraphBuilder {
    /// Builder whose shorthand ports carry the data type `Record`.
    pub fn new() -> Self {
        Self::with_data_type(DataType::new("Record"))
    }

    pub fn with_data_type(data_type: DataType) -> Self {
        FlowGraphBuilder {
            graph: FlowGraph::new(),
            names: HashMap::new(),
            data_type,
            error: None,
        }
    }

    pub fn input(&mut self, name: &str) -> &mut Self {
        let ty = self.data_type.clone();
        self.input_typed(name, ty)
    }

    pub fn input_typed(&mut self, name: &str, data_type: DataType) -> &mut Self {
        if self.claim(name) {
            let id = self.graph.add_input(name, data_type);
            self.names.insert(name.to_string(), id);
        }
        self
    }

    pub fn output(&mut self, name: &str) -> &mut Self {
        let ty = self.data_type.clone();
        self.output_typed(name, ty)
    }

    pub fn output_typed(&mut self, name: &str, data_type: DataType) -> &mut Self {
        if self.claim(name) {
            let id = self.graph.add_output(name, data_type);
            self.names.insert(name.to_string(), id);
        }
        self
    }

    /// Operator with whitespace-separated port names, all mandatory and of
    /// the builder's data type.
    pub fn operator(
        &mut self,
        name: &str,
        kind: &str,
        inputs: &str,
        outputs: &str,
        boundary: Boundary,
    ) -> &mut Self {
        self.operator_connectivity(name, kind, inputs, outputs, boundary, Connectivity::Mandatory)
    }

    /// Like `operator`, with every port given the same connectivity.
    pub fn operator_connectivity(
        &mut self,
        name: &str,
        kind: &str,
        inputs: &str,
        outputs: &str,
        boundary: Boundary,
        connectivity: Connectivity,
    ) -> &mut Self {
        let decls = |names: &str| -> Vec<PortDecl> {
            names
                .split_whitespace()
                .map(|n| PortDecl {
                    connectivity,
                    ..PortDecl::new(n, self.data_type.clone())
                })
                .collect()
        };
        let (ins, outs) = (decls(inputs), decls(outputs));
        self.operator_with(name, OperatorDesc::new(name, kind), ins, outs, boundary)
    }

    pub fn operator_with(
        &mut self,
        name: &str,
        desc: OperatorDesc,
        inputs: Vec<PortDecl>,
        outputs: Vec<PortDecl>,
        boundary: Boundary,
    ) -> &mut Self {
        if self.claim(name) {
            let id = self.graph.add_operator(name, desc, inputs, outputs, boundary);
            self.names.insert(name.to_string(), id);
        }
        self
    }

    /// Identity for `Boundary::None`, checkpoint for `Boundary::Stage`.
    pub fn pseudo(&mut self, name: &str, boundary: Boundary) -> &mut Self {
        let ty = self.data_type.clone();
        self.pseudo_typed(name, ty, boundary)
    }

    pub fn pseudo_typed(&mut self, name: &str, data_type: DataType, boundary: Boundary) -> &mut Self {
        if self.claim(name) {
            let id = self.graph.add_pseudo(name, data_type, boundary);
            self.names.insert(name.to_string(), id);
        }
        self
    }

    pub fn flow_part(&mut self, name: &str, inner: FlowGraph) -> &mut Self {
        if self.claim(name) {
            let id = self.graph.add_flow_part(name, inner);
            self.names.insert(name.to_string(), id);
        }
        self
    }

    /// Connect `upstream` to `downstream`. Each side is `element` (when the
    /// element has exactly one port in that direction) or `element.port`.
    pub fn connect(&mut self, upstream: &str, downstream: &str) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        let resolved = self
            .resolve(upstream, Direction::Output)
            .and_then(|u| self.resolve(downstream, Direction::Input).map(|d| (u, d)));
        match resolved {
            Ok((u, d)) => {
                self.graph.connect(u, d);
            }
            Err(e) => self.error = Some(e),
        }
        self
    }

    /// Element registered under `name`.
    pub fn id(&self, name: &str) -> Option<ElementId> {
        self.names.get(name).copied()
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn build(self) -> Result<FlowGraph, BuildError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.graph),
        }
    }

    fn claim(&mut self, name: &str) -> bool {
        if self.error.is_some() {
            return false;
        }
        if self.names.contains_key(name) {
            self.error = Some(BuildError::Duplicate(name.to_string()));
            return false;
        }
        true
    }

    fn resolve(&self, reference: &str, direction: Direction) -> Result<PortId, BuildError> {
        if let Some(&id) = self.names.get(reference) {
            let ports = direction.ports(&self.graph, id);
            return match ports {
                [single] => Ok(*single),
                _ => Err(BuildError::AmbiguousPort {
                    element: reference.to_string(),
                    count: ports.len(),
                    direction: direction.label(),
                }),
            };
        }
        let (elem, port) = reference
            .rsplit_once('.')
            .ok_or_else(|| BuildError::UnknownElement(reference.to_string()))?;
        let id = self
            .names
            .get(elem)
            .copied()
            .ok_or_else(|| BuildError::UnknownElement(elem.to_string()))?;
        let found = match direction {
            Direction::Input => self.graph.input_port(id, port),
            Direction::Output => self.graph.output_port(id, port),
        };
        found.ok_or_else(|| BuildError::UnknownPort {
            element: elem.to_string(),
            port: port.to_string(),
            direction: direction.label(),
        })
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Input,
    Output,
}

impl Direction {
    fn ports(self, graph: &FlowGraph, id: ElementId) -> &[PortId] {
        let elem = graph.element(id);
        match self {
            Direction::Input => &elem.inputs,
            Direction::Output => &elem.outputs,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}
