//! CLI binary for running and validating Attractor pipelines.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

/// Run (or validate) a DOT-based Attractor pipeline.
#[derive(Parser)]
#[command(name = "attractor", version, about = "DOT-based pipeline runner for AI workflows")]
struct Cli {
    /// Path to the pipeline .dot file
    file: PathBuf,

    /// Validate the pipeline and exit without running it
    #[arg(long)]
    validate_only: bool,

    /// Directory for checkpoints and run artifacts
    #[arg(long, default_value = ".attractor/logs")]
    logs_root: PathBuf,

    /// Resume from a checkpoint found under --logs-root
    #[arg(long)]
    resume: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Exit codes per the documented CLI surface: 0 success, 1 validation error,
/// 2 pipeline failure, 3 invalid invocation.
const EXIT_SUCCESS: u8 = 0;
const EXIT_VALIDATION_ERROR: u8 = 1;
const EXIT_PIPELINE_FAILURE: u8 = 2;
const EXIT_INVALID_INVOCATION: u8 = 3;

fn load_pipeline(path: &std::path::Path) -> anyhow::Result<attractor_pipeline::PipelineGraph> {
    let source = std::fs::read_to_string(path)?;
    let dot = attractor_dot::parse(&source)?;
    let graph = attractor_pipeline::PipelineGraph::from_dot(dot)?;
    Ok(graph)
}

fn print_diagnostics(diagnostics: &[attractor_pipeline::Diagnostic]) -> bool {
    let mut has_error = false;
    for diag in diagnostics {
        let severity = match diag.severity {
            attractor_pipeline::Severity::Error => {
                has_error = true;
                "ERROR"
            }
            attractor_pipeline::Severity::Warning => "WARN",
            attractor_pipeline::Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }
    has_error
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_INVALID_INVOCATION);
        }
    };

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let graph = match load_pipeline(&cli.file) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("Failed to load pipeline: {e}");
            return ExitCode::from(EXIT_INVALID_INVOCATION);
        }
    };

    let diagnostics = attractor_pipeline::validate(&graph);
    let has_error = print_diagnostics(&diagnostics);
    if has_error {
        return ExitCode::from(EXIT_VALIDATION_ERROR);
    }

    if cli.validate_only {
        println!("Pipeline is valid");
        return ExitCode::from(EXIT_SUCCESS);
    }

    println!("Running pipeline: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("Goal: {}", graph.goal);
    }

    let interviewer = std::sync::Arc::new(attractor_pipeline::ConsoleInterviewer);
    let registry = attractor_pipeline::default_registry_with_interviewer(interviewer);
    let executor = attractor_pipeline::PipelineExecutor::new(registry);
    let config = attractor_pipeline::PipelineConfig {
        logs_root: cli.logs_root.clone(),
    };

    match executor.run_with_config(&graph, &config, cli.resume).await {
        Ok(result) => {
            println!("\nPipeline completed");
            println!("Completed nodes: {:?}", result.completed_nodes);

            let total_cost: f64 = result
                .final_context
                .iter()
                .filter(|(k, _)| k.ends_with(".cost_usd"))
                .filter_map(|(_, v)| v.as_f64())
                .sum();
            if total_cost > 0.0 {
                println!("Total cost: ${:.4}", total_cost);
            }

            ExitCode::from(EXIT_SUCCESS)
        }
        Err(e) => {
            eprintln!("Pipeline failed: {e}");
            ExitCode::from(EXIT_PIPELINE_FAILURE)
        }
    }
}
