// pipeline.rs — Compilation state and pass orchestration
//
// Holds all pass artifacts and runs the minimal set of passes for a given
// terminal PassId.
//
// Preconditions: the flow graph and both registries are set before calling
//                run_pipeline.
// Postconditions: all artifacts for required passes are populated, or
//                 has_error is set.
// Failure modes: validation and stage graph errors abort the run; shuffle and
//                stage analysis errors are collected for every stage first.
// Side effects: calls on_pass_complete after each pass; emits tracing events.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Deserialize;

use crate::datamodel::DataClassRegistry;
use crate::diag::{codes, DiagSink, Diagnostic};
use crate::graph::FlowGraph;
use crate::normalize::{self, NormalizeStats};
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::plan::{self, StageBlock, StageGraph};
use crate::registry::ProcessorRegistry;
use crate::shuffle::{analyze_shuffle, ShuffleModel};
use crate::stage::{analyze_stage, StageModel};

// ── Options ────────────────────────────────────────────────────────────────

/// Knobs that change how, not what, the compiler computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerOptions {
    /// Analyze stages on the rayon thread pool.
    pub parallel: bool,
    /// Check pass certificates and report violations as E0901.
    pub certify: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            parallel: true,
            certify: true,
        }
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for hermetic builds and cache-key use.
///
/// `source_hash`: SHA-256 of the raw manifest text.
/// `registry_fingerprint`: SHA-256 of the canonical JSON of both registries.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub registry_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    /// Hex string of the source hash (64 characters).
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    /// Hex string of the registry fingerprint (64 characters).
    pub fn registry_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.registry_fingerprint)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"source_hash\": \"{}\",\n  \"registry_fingerprint\": \"{}\",\n  \"manifest_schema_version\": 1,\n  \"compiler_version\": \"{}\"\n}}\n",
            self.source_hash_hex(),
            self.registry_fingerprint_hex(),
            self.compiler_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(parts: &[&str]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance from manifest text and registries.
///
/// The fingerprint hashes the registries' canonical JSON (sorted, compact),
/// so it does not depend on the order entries were declared in.
pub fn compute_provenance(
    source: &str,
    processors: &ProcessorRegistry,
    data_classes: &DataClassRegistry,
) -> Provenance {
    Provenance {
        source_hash: sha256(&[source]),
        registry_fingerprint: sha256(&[
            &processors.canonical_json(),
            &data_classes.canonical_json(),
        ]),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Compilation state ──────────────────────────────────────────────────────

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub processors: ProcessorRegistry,
    pub data_classes: DataClassRegistry,
    /// The flow graph, rewritten in place by normalization. Moved into
    /// `stage_graph` once planning runs.
    pub graph: FlowGraph,
    pub normalize_stats: NormalizeStats,
    pub stage_graph: Option<StageGraph>,
    /// Per stage, in stage order.
    pub shuffles: Vec<Option<ShuffleModel>>,
    /// Per stage, in stage order.
    pub stage_models: Vec<Option<StageModel>>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    pub fn new(graph: FlowGraph, processors: ProcessorRegistry, data_classes: DataClassRegistry) -> Self {
        Self {
            processors,
            data_classes,
            graph,
            normalize_stats: NormalizeStats::default(),
            stage_graph: None,
            shuffles: Vec::new(),
            stage_models: Vec::new(),
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }

    /// The current flow graph, wherever it lives now.
    pub fn flow_graph(&self) -> &FlowGraph {
        match &self.stage_graph {
            Some(sg) => &sg.graph,
            None => &self.graph,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineError {
    /// The first pass that produced an error.
    pub failing_pass: PassId,
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compilation failed in pass `{}`", descriptor(self.failing_pass).name)
    }
}

impl std::error::Error for PipelineError {}

// ── Pass bookkeeping ───────────────────────────────────────────────────────

/// Per-pass post-processing: callback, accumulate, log. Returns true if the
/// pass raised an error.
fn record_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic], Duration),
) -> bool {
    on_pass_complete(pass_id, &diags, elapsed);
    let is_err = diags.iter().any(Diagnostic::is_error);
    tracing::debug!(
        pass = descriptor(pass_id).name,
        diagnostics = diags.len(),
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "pass complete"
    );
    state.diagnostics.extend(diags);
    if is_err {
        state.has_error = true;
    }
    is_err
}

/// Record a pass whose errors stop the pipeline.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic], Duration),
) -> Result<(), PipelineError> {
    if record_pass(state, pass_id, diags, elapsed, on_pass_complete) {
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

/// E0901 diagnostic for a failed certificate, if any.
fn cert_failure(pass_id: PassId, cert: &impl StageCert) -> Option<Diagnostic> {
    if cert.all_pass() {
        return None;
    }
    Some(
        Diagnostic::error(
            codes::E0901,
            format!(
                "{} verification failed: {}",
                descriptor(pass_id).name,
                cert.failures().join(", ")
            ),
        )
        .with_hint("this is a compiler defect; please report it with the flow manifest"),
    )
}

/// Stable order for diagnostics collected from concurrent stage workers.
fn sort_diagnostics(diags: &mut [Diagnostic]) {
    diags.sort_by(|a, b| {
        let key = |d: &Diagnostic| (d.element.as_ref().map(|e| e.id), d.code.map(|c| c.0), d.message.clone());
        key(a).cmp(&key(b))
    });
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Preconditions: `state.graph` and both registries are set.
/// Postconditions: artifacts for all passes in `required_passes(terminal)` are
///   populated, or `state.has_error` is true.
/// Failure modes: any pass producing error-level diagnostics; certificate
///   failures when `options.certify` is set.
/// Side effects: calls `on_pass_complete` after each pass.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    options: &CompilerOptions,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic], Duration),
) -> Result<(), PipelineError> {
    let mut deferred: Option<PassId> = None;

    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        match pass_id {
            PassId::Validate => {
                let sink = DiagSink::new();
                crate::validate::validate(&state.graph, &sink);
                finish_pass(state, pass_id, sink.take(), t.elapsed(), &mut on_pass_complete)?;
            }
            PassId::InlineFlowParts => {
                state.normalize_stats.flow_parts_inlined = normalize::inline_flow_parts(&mut state.graph);
                finish_pass(state, pass_id, Vec::new(), t.elapsed(), &mut on_pass_complete)?;
            }
            PassId::InsertCheckpoints => {
                state.normalize_stats.checkpoints_inserted = normalize::insert_checkpoints(&mut state.graph);
                finish_pass(state, pass_id, Vec::new(), t.elapsed(), &mut on_pass_complete)?;
            }
            PassId::InsertIdentities => {
                state.normalize_stats.identities_inserted = normalize::insert_identities(&mut state.graph);
                finish_pass(state, pass_id, Vec::new(), t.elapsed(), &mut on_pass_complete)?;
            }
            PassId::SplitIdentities => {
                state.normalize_stats.identities_split = normalize::split_identities(&mut state.graph);
                finish_pass(state, pass_id, Vec::new(), t.elapsed(), &mut on_pass_complete)?;
            }
            PassId::ReduceIdentities => {
                state.normalize_stats.identities_removed = normalize::reduce_identities(&mut state.graph);
                let mut diags = Vec::new();
                if options.certify {
                    let cert = normalize::verify_normalized(&state.graph);
                    diags.extend(cert_failure(pass_id, &cert));
                }
                finish_pass(state, pass_id, diags, t.elapsed(), &mut on_pass_complete)?;
            }
            PassId::BuildStageGraph => {
                let sink = DiagSink::new();
                let graph = std::mem::take(&mut state.graph);
                let sg = plan::build_stage_graph(graph, &sink);
                let mut diags = sink.take();
                if options.certify {
                    diags.extend(cert_failure(pass_id, &plan::verify_plan(&sg)));
                }
                state.stage_graph = Some(sg);
                finish_pass(state, pass_id, diags, t.elapsed(), &mut on_pass_complete)?;
            }
            PassId::AnalyzeShuffle => {
                let sink = DiagSink::new();
                let shuffles = match &state.stage_graph {
                    Some(sg) => {
                        let run = |stage: &StageBlock| {
                            analyze_shuffle(sg, stage, &state.processors, &state.data_classes, &sink)
                        };
                        if options.parallel {
                            sg.stages.par_iter().map(run).collect()
                        } else {
                            sg.stages.iter().map(run).collect()
                        }
                    }
                    None => Vec::new(),
                };
                state.shuffles = shuffles;
                let mut diags = sink.take();
                sort_diagnostics(&mut diags);
                if record_pass(state, pass_id, diags, t.elapsed(), &mut on_pass_complete) {
                    deferred.get_or_insert(pass_id);
                }
            }
            PassId::AnalyzeStages => {
                let sink = DiagSink::new();
                let models = match &state.stage_graph {
                    Some(sg) => {
                        let shuffles = &state.shuffles;
                        let run = |(i, stage): (usize, &StageBlock)| {
                            let shuffle = shuffles.get(i).and_then(Option::as_ref);
                            analyze_stage(sg, stage, shuffle, &state.processors, &sink)
                        };
                        if options.parallel {
                            sg.stages.par_iter().enumerate().map(run).collect()
                        } else {
                            sg.stages.iter().enumerate().map(run).collect()
                        }
                    }
                    None => Vec::new(),
                };
                state.stage_models = models;
                let mut diags = sink.take();
                sort_diagnostics(&mut diags);
                if record_pass(state, pass_id, diags, t.elapsed(), &mut on_pass_complete) {
                    deferred.get_or_insert(pass_id);
                }
            }
        }
    }

    tracing::info!(
        stages = state.stage_graph.as_ref().map_or(0, |sg| sg.stages.len()),
        errors = state.diagnostics.iter().filter(|d| d.is_error()).count(),
        "compilation finished"
    );
    match deferred {
        Some(failing_pass) => Err(PipelineError { failing_pass }),
        None => Ok(()),
    }
}

/// Run every pass on `graph`. Check `has_error` on the result before
/// trusting its models.
pub fn compile(
    graph: FlowGraph,
    processors: ProcessorRegistry,
    data_classes: DataClassRegistry,
    options: &CompilerOptions,
) -> CompilationState {
    let mut state = CompilationState::new(graph, processors, data_classes);
    // Errors are recorded in the state.
    let _ = run_pipeline(&mut state, PassId::AnalyzeStages, options, |_, _, _| {});
    state
}

// ── Tests ──────────────────────────────────────────────────────────────────
