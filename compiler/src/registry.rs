// registry.rs — Processor capability registry
//
// Maps an operator kind to the processor that will execute it, and what shape
// of work that processor performs. Built-in processors cover the standard
// operator kinds; more can be loaded from a JSON manifest.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{Element, ElementKind};

// ── Data types ──────────────────────────────────────────────────────────────

/// Shape of the work a processor performs on its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    /// Record-at-a-time; can be chained with its successor.
    LinePart,
    /// Record-at-a-time, but ends a chain (e.g. fans out to several outputs).
    LineEnd,
    /// Consumes shuffled groups; starts the reduce side.
    Rendezvous,
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessorKind::LinePart => "line-part",
            ProcessorKind::LineEnd => "line-end",
            ProcessorKind::Rendezvous => "rendezvous",
        })
    }
}

/// Processor metadata. `name` is the operator kind it handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Processor {
    pub name: String,
    pub kind: ProcessorKind,
}

impl Processor {
    pub fn new(name: impl Into<String>, kind: ProcessorKind) -> Self {
        Processor {
            name: name.into(),
            kind,
        }
    }

    /// True for the pass-through processor that pseudo elements use.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// Errors that can occur during registry loading.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid processor manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate processor '{0}'")]
    Duplicate(String),
}

// ── Registry ────────────────────────────────────────────────────────────────

const LINE_PARTS: &[&str] = &[
    "update",
    "convert",
    "project",
    "restructure",
    "extend",
    "logging",
    "confluent",
];

const LINE_ENDS: &[&str] = &["branch", "extract", "split"];

const RENDEZVOUS: &[&str] = &[
    "cogroup",
    "group_sort",
    "fold",
    "summarize",
    "master_join",
    "master_check",
    "master_branch",
    "master_join_update",
];

/// Processor registry keyed by operator kind.
#[derive(Debug, Clone)]
pub struct ProcessorRegistry {
    processors: BTreeMap<String, Processor>,
    empty: Processor,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorRegistry {
    /// Registry with no processors besides the empty one.
    pub fn new() -> Self {
        ProcessorRegistry {
            processors: BTreeMap::new(),
            empty: Processor::new("", ProcessorKind::LinePart),
        }
    }

    /// Registry preloaded with the standard operator kinds.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        let groups = [
            (LINE_PARTS, ProcessorKind::LinePart),
            (LINE_ENDS, ProcessorKind::LineEnd),
            (RENDEZVOUS, ProcessorKind::Rendezvous),
        ];
        for (names, kind) in groups {
            for name in names {
                reg.processors
                    .insert(name.to_string(), Processor::new(*name, kind));
            }
        }
        reg
    }

    pub fn register(&mut self, processor: Processor) -> Result<(), RegistryError> {
        if self.processors.contains_key(&processor.name) {
            return Err(RegistryError::Duplicate(processor.name));
        }
        self.processors.insert(processor.name.clone(), processor);
        Ok(())
    }

    pub fn lookup(&self, kind: &str) -> Option<&Processor> {
        self.processors.get(kind)
    }

    /// The pass-through processor used for pseudo elements.
    pub fn empty(&self) -> &Processor {
        &self.empty
    }

    /// Processor for `elem`: the empty processor for pseudo elements, the
    /// registered processor for an operator's kind, `None` otherwise.
    pub fn resolve(&self, elem: &Element) -> Option<&Processor> {
        match &elem.kind {
            ElementKind::Pseudo => Some(&self.empty),
            ElementKind::Operator(desc) => self.lookup(&desc.kind),
            _ => None,
        }
    }

    /// Register processors from a JSON array. Returns the number loaded.
    pub fn load_json(&mut self, source: &str) -> Result<usize, RegistryError> {
        let processors: Vec<Processor> = serde_json::from_str(source)?;
        let count = processors.len();
        for p in processors {
            self.register(p)?;
        }
        Ok(count)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<usize, RegistryError> {
        let source = std::fs::read_to_string(path).map_err(|e| RegistryError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.load_json(&source)
    }

    pub fn processors(&self) -> impl Iterator<Item = &Processor> {
        self.processors.values()
    }

    /// Deterministic JSON form, sorted by name, for provenance hashing.
    pub fn canonical_json(&self) -> String {
        let all: Vec<&Processor> = self.processors.values().collect();
        serde_json::to_string(&all).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
