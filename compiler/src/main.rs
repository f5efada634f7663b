use clap::Parser;
use std::path::PathBuf;

use flowc::diag::Diagnostic;
use flowc::pass::{descriptor, PassId};
use flowc::pipeline::{self, CompilationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Emit {
    /// Plain-text stage plan
    Plan,
    /// Graphviz DOT of the normalized flow graph
    FlowDot,
    /// Graphviz DOT of the stage graph
    StageDot,
    /// Provenance JSON
    BuildInfo,
}

#[derive(Parser, Debug)]
#[command(
    name = "flowc",
    version,
    about = "Flow plan compiler: partitions dataflow graphs into map/shuffle/reduce stage plans"
)]
struct Cli {
    /// Flow manifest (JSON)
    manifest: PathBuf,

    /// Additional processor registry (JSON array, repeatable)
    #[arg(long)]
    processors: Vec<PathBuf>,

    /// What to emit
    #[arg(long, value_enum, default_value_t = Emit::Plan)]
    emit: Emit,

    /// Output file path (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Analyze stages on the current thread
    #[arg(long)]
    sequential: bool,

    /// Print compiler passes and timing
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("flowc=debug")),
            )
            .with_writer(std::io::stderr)
            .init();
        eprintln!("flowc: manifest = {}", cli.manifest.display());
        eprintln!("flowc: emit     = {:?}", cli.emit);
    }

    // ── Load manifest and registries ──
    let (source, manifest) = match flowc::manifest::load(&cli.manifest) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("flowc: error: {}", e);
            std::process::exit(2);
        }
    };
    let mut processors = manifest.processors;
    for path in &cli.processors {
        match processors.load_file(path) {
            Ok(n) => {
                if cli.verbose {
                    eprintln!("flowc: loaded {} processors from {}", n, path.display());
                }
            }
            Err(e) => {
                eprintln!("flowc: error: {}", e);
                std::process::exit(2);
            }
        }
    }
    if cli.verbose {
        eprintln!(
            "flowc: {} processors, {} data classes registered",
            processors.len(),
            manifest.data_classes.len()
        );
    }

    let mut options = manifest.options;
    if cli.sequential {
        options.parallel = false;
    }

    let mut state = CompilationState::new(manifest.graph, processors, manifest.data_classes);
    state.provenance = Some(pipeline::compute_provenance(
        &source,
        &state.processors,
        &state.data_classes,
    ));

    // Build info needs no passes.
    if cli.emit == Emit::BuildInfo {
        if let Some(prov) = &state.provenance {
            write_output(&cli.output, &prov.to_json());
        }
        return;
    }

    // ── Run passes ──
    let terminal = match cli.emit {
        Emit::FlowDot => PassId::ReduceIdentities,
        Emit::StageDot => PassId::BuildStageGraph,
        Emit::Plan | Emit::BuildInfo => PassId::AnalyzeStages,
    };
    let verbose = cli.verbose;
    let result = pipeline::run_pipeline(&mut state, terminal, &options, |pass, diags, elapsed| {
        if verbose {
            let desc = descriptor(pass);
            eprintln!(
                "flowc: {:<20} {:>8.3}ms  {} diagnostic(s)  [{}]",
                desc.name,
                elapsed.as_secs_f64() * 1000.0,
                diags.len(),
                desc.invariants
            );
        }
    });
    print_diagnostics(&state.diagnostics);
    if let Err(e) = result {
        eprintln!("flowc: {}", e);
        std::process::exit(1);
    }

    // ── Emit ──
    let text = match cli.emit {
        Emit::FlowDot => flowc::dot::emit_flow_dot(state.flow_graph()),
        Emit::StageDot => match &state.stage_graph {
            Some(sg) => flowc::dot::emit_stage_dot(sg),
            None => unreachable_output(),
        },
        Emit::Plan | Emit::BuildInfo => match flowc::report::PlanReport::new(&state) {
            Some(report) => report.to_string(),
            None => unreachable_output(),
        },
    };
    write_output(&cli.output, &text);
}

fn print_diagnostics(diags: &[Diagnostic]) {
    for diag in diags {
        eprintln!("flowc: {}", diag);
    }
}

fn unreachable_output() -> ! {
    eprintln!("flowc: error: pipeline finished without producing its output");
    std::process::exit(1);
}

fn write_output(path: &Option<PathBuf>, text: &str) {
    match path {
        Some(path) => {
            if let Err(e) = std::fs::write(path, text) {
                eprintln!("flowc: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{}", text),
    }
}
