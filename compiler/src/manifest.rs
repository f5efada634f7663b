// manifest.rs — JSON flow manifest loading
//
// A manifest bundles everything one compile needs: the flow graph, extra
// processors, the data classes, and optional compiler options.
//
//   {
//     "name": "wordcount",
//     "options": { "parallel": false },
//     "data_classes": [{ "name": "Word", "properties": [{ "name": "text", "type": "text" }] }],
//     "processors": [{ "name": "dedupe", "kind": "rendezvous" }],
//     "flow": {
//       "type": "Word",
//       "elements": [
//         { "kind": "input", "name": "in" },
//         { "kind": "operator", "name": "count", "operator": "summarize",
//           "inputs": [{ "name": "in", "key": { "group": ["text"] } }],
//           "outputs": ["out"], "boundary": "shuffle" },
//         { "kind": "output", "name": "out" }
//       ],
//       "connections": [["in", "count"], ["count", "out"]]
//     }
//   }
//
// Preconditions: none.
// Postconditions: the graph is built but not validated.
// Failure modes: I/O, JSON syntax or schema errors, builder errors (duplicate
//                names, unknown references), registry errors → ManifestError.
// Side effects: `load` reads one file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::builder::{BuildError, FlowGraphBuilder};
use crate::datamodel::{DataClass, DataClassRegistry, DataModelError};
use crate::graph::{Boundary, DataType, FlowGraph, OperatorDesc, PortDecl, ShuffleKey};
use crate::pipeline::CompilerOptions;
use crate::registry::{Processor, ProcessorRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("flow `{flow}`: {source}")]
    Build {
        flow: String,
        source: BuildError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    DataModel(#[from] DataModelError),
}

// ── Wire format ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    options: Option<CompilerOptions>,
    #[serde(default)]
    data_classes: Vec<DataClass>,
    #[serde(default)]
    processors: Vec<Processor>,
    flow: RawFlow,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFlow {
    /// Data type of ports that do not name one.
    #[serde(rename = "type", default)]
    data_type: Option<DataType>,
    elements: Vec<RawElement>,
    #[serde(default)]
    connections: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
enum RawElement {
    Input {
        name: String,
        #[serde(rename = "type", default)]
        data_type: Option<DataType>,
    },
    Output {
        name: String,
        #[serde(rename = "type", default)]
        data_type: Option<DataType>,
    },
    Operator {
        name: String,
        /// Operator kind, the processor lookup key.
        operator: String,
        #[serde(default)]
        inputs: Vec<RawPort>,
        #[serde(default)]
        outputs: Vec<RawPort>,
        #[serde(default)]
        boundary: Boundary,
        #[serde(default)]
        resources: Vec<String>,
    },
    Pseudo {
        name: String,
        #[serde(rename = "type", default)]
        data_type: Option<DataType>,
        #[serde(default)]
        boundary: Boundary,
    },
    FlowPart {
        name: String,
        flow: RawFlow,
    },
}

/// A port is either its bare name or a full declaration.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Name(String),
    Decl {
        name: String,
        #[serde(rename = "type", default)]
        data_type: Option<DataType>,
        #[serde(default)]
        optional: bool,
        #[serde(default)]
        key: Option<ShuffleKey>,
    },
}

impl RawPort {
    fn into_decl(self, default_type: &DataType) -> PortDecl {
        match self {
            RawPort::Name(name) => PortDecl::new(name, default_type.clone()),
            RawPort::Decl {
                name,
                data_type,
                optional,
                key,
            } => {
                let mut decl = PortDecl::new(name, data_type.unwrap_or_else(|| default_type.clone()));
                if optional {
                    decl = decl.optional();
                }
                decl.key = key;
                decl
            }
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// A loaded manifest, ready to compile.
#[derive(Debug)]
pub struct Manifest {
    pub name: Option<String>,
    pub options: CompilerOptions,
    pub graph: FlowGraph,
    /// Built-in processors plus the manifest's own.
    pub processors: ProcessorRegistry,
    pub data_classes: DataClassRegistry,
}

/// Parse a manifest from JSON text.
pub fn parse(source: &str) -> Result<Manifest, ManifestError> {
    let raw: RawManifest = serde_json::from_str(source)?;

    let mut processors = ProcessorRegistry::with_builtins();
    for p in raw.processors {
        processors.register(p)?;
    }
    let data_classes = DataClassRegistry::from_classes(raw.data_classes)?;
    let flow_name = raw.name.clone().unwrap_or_else(|| "flow".to_string());
    let graph = build_flow(raw.flow, &flow_name)?;

    Ok(Manifest {
        name: raw.name,
        options: raw.options.unwrap_or_default(),
        graph,
        processors,
        data_classes,
    })
}

/// Read and parse a manifest file. Returns the raw text too, for provenance.
pub fn load(path: &Path) -> Result<(String, Manifest), ManifestError> {
    let source = std::fs::read_to_string(path).map_err(|e| ManifestError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let manifest = parse(&source)?;
    Ok((source, manifest))
}

fn build_flow(flow: RawFlow, flow_name: &str) -> Result<FlowGraph, ManifestError> {
    let default_type = flow.data_type.unwrap_or_else(|| DataType::new("Record"));
    let mut b = FlowGraphBuilder::with_data_type(default_type.clone());
    let ty = |t: Option<DataType>| t.unwrap_or_else(|| default_type.clone());

    for elem in flow.elements {
        match elem {
            RawElement::Input { name, data_type } => {
                b.input_typed(&name, ty(data_type));
            }
            RawElement::Output { name, data_type } => {
                b.output_typed(&name, ty(data_type));
            }
            RawElement::Operator {
                name,
                operator,
                inputs,
                outputs,
                boundary,
                resources,
            } => {
                let desc = OperatorDesc {
                    resources,
                    ..OperatorDesc::new(&name, operator)
                };
                let ins = inputs.into_iter().map(|p| p.into_decl(&default_type)).collect();
                let outs = outputs.into_iter().map(|p| p.into_decl(&default_type)).collect();
                b.operator_with(&name, desc, ins, outs, boundary);
            }
            RawElement::Pseudo {
                name,
                data_type,
                boundary,
            } => {
                b.pseudo_typed(&name, ty(data_type), boundary);
            }
            RawElement::FlowPart { name, flow } => {
                let inner = build_flow(flow, &format!("{flow_name}.{name}"))?;
                b.flow_part(&name, inner);
            }
        }
    }
    for (upstream, downstream) in &flow.connections {
        b.connect(upstream, downstream);
    }
    b.build().map_err(|source| ManifestError::Build {
        flow: flow_name.to_string(),
        source,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
