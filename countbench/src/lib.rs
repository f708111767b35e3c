#![warn(missing_docs)]
//! Countbench - Instruction-Count A/B Benchmarking
//!
//! Measures the same snippets in two or more environments (checkouts, builds,
//! virtualenvs) and hands back aligned result sequences for comparison.
//! Instruction counts that disagree across environments trigger timing-only
//! replicates, and a stability sentry flags environments whose measurements
//! are not deterministic to begin with.
//!
//! # Example
//!
//! ```ignore
//! use countbench::{StaticSuite, BenchmarkDef};
//!
//! fn main() -> anyhow::Result<()> {
//!     let suite = StaticSuite::new().standard(my_benchmark());
//!     countbench::run(&suite, MyExecutor::default())
//! }
//! ```
//!
//! The same binary serves as the measurement worker: the process backend
//! re-executes it with a hidden flag, and [`run`] hands control to the
//! executor's worker loop.

mod assemble;
mod collect;
mod config;
mod convergence;
mod diagnostics;
mod planner;
mod render;
mod sentry;
mod suite;

pub use assemble::{EnvironmentResults, ResultRow, RowValue, assemble};
pub use collect::{AbComparison, CollectError, Collection, Settings, ab_test, collect};
pub use config::*;
pub use convergence::{
    ComparisonTable, ConvergenceCallback, ConvergencePolicy, DEFAULT_REPLICATES, GroupId,
};
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticScope, environment_name};
pub use planner::{ExecutionPlan, OrderBudget, build_plan};
pub use render::{AbPair, AbReport, JsonRenderer, OutputFormat, RenderError, Renderer, ReportMeta};
pub use sentry::{SENTRY_RUNS, SentryPlan, check_counts, sentry_order};
pub use suite::{BenchmarkDef, StaticSuite, Suite, SuiteSelector};

use clap::{Parser, Subcommand};
use countbench_runner::{InProcessBackend, SnippetExecutor, WorkerMain};
use regex::Regex;
use std::io::Write;
use std::path::PathBuf;

/// Countbench CLI arguments
#[derive(Parser, Debug)]
#[command(name = "countbench")]
#[command(author, version, about = "Countbench - instruction-count A/B benchmarking")]
pub struct Cli {
    /// Subcommand; defaults to listing the standard suite
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Filter benchmarks by regex pattern on the label (e.g. "^Math/")
    #[arg(long, global = true)]
    pub filter: Option<String>,

    /// Number of concurrent measurements
    #[arg(long, global = true)]
    pub jobs: Option<usize>,

    /// Output file (stdout if not specified)
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Output format: json, json-compact
    #[arg(long, global = true)]
    pub format: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Internal: Run as worker process (used by the process backend)
    #[arg(long, hide = true)]
    pub countbench_worker: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Measure the suite in two environments and compare
    Ab {
        /// Shell command activating environment A (e.g. "source ~/a/activate")
        #[arg(name = "SOURCE_A")]
        source_a: String,
        /// Shell command activating environment B
        #[arg(name = "SOURCE_B")]
        source_b: String,
        /// Use the ad hoc suite
        #[arg(long)]
        ad_hoc: bool,
    },
    /// List the benchmarks that would be measured
    List {
        /// Use the ad hoc suite
        #[arg(long)]
        ad_hoc: bool,
    },
}

fn selector(ad_hoc: bool) -> SuiteSelector {
    if ad_hoc {
        SuiteSelector::AdHoc
    } else {
        SuiteSelector::Standard
    }
}

/// Run the countbench CLI with the JSON renderer.
/// This is the main entry point for harness binaries.
pub fn run<S, E>(suite: &S, executor: E) -> anyhow::Result<()>
where
    S: Suite + ?Sized,
    E: SnippetExecutor + 'static,
{
    run_with_cli(Cli::parse(), suite, executor, None)
}

/// Run the countbench CLI, presenting A/B results with `renderer`
pub fn run_with_renderer<S, E>(suite: &S, executor: E, renderer: &dyn Renderer) -> anyhow::Result<()>
where
    S: Suite + ?Sized,
    E: SnippetExecutor + 'static,
{
    run_with_cli(Cli::parse(), suite, executor, Some(renderer))
}

/// Run the countbench CLI with pre-parsed arguments.
///
/// Without a `renderer` the JSON renderer is used in the configured format.
pub fn run_with_cli<S, E>(
    cli: Cli,
    suite: &S,
    executor: E,
    renderer: Option<&dyn Renderer>,
) -> anyhow::Result<()>
where
    S: Suite + ?Sized,
    E: SnippetExecutor + 'static,
{
    // Handle worker mode first (before any other initialization)
    if cli.countbench_worker {
        return run_worker_mode(executor);
    }

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("countbench=debug")
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("countbench=info")
            .with_writer(std::io::stderr)
            .init();
    }

    // Discover countbench.toml configuration (CLI flags override)
    let config = CountbenchConfig::discover().unwrap_or_default();

    match cli.command {
        Some(Commands::Ab {
            ref source_a,
            ref source_b,
            ad_hoc,
        }) => {
            let format = match cli.format.as_deref() {
                Some(format) => format.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                None => config.output_format()?,
            };
            let json = JsonRenderer::with_format(format);
            let renderer = renderer.unwrap_or(&json);
            let comparison = ab_with_config(
                &cli,
                &config,
                suite,
                executor,
                selector(ad_hoc),
                (source_a.as_str(), source_b.as_str()),
                renderer,
            )?;
            write_output(&cli, &comparison.rendered)?;
        }
        Some(Commands::List { ad_hoc }) => list_benchmarks(&cli, suite, selector(ad_hoc))?,
        None => list_benchmarks(&cli, suite, SuiteSelector::Standard)?,
    }

    Ok(())
}

/// Run as a worker process (IPC mode)
fn run_worker_mode<E: SnippetExecutor>(executor: E) -> anyhow::Result<()> {
    let mut worker = WorkerMain::new(executor);
    worker
        .run()
        .map_err(|e| anyhow::anyhow!("Worker error: {}", e))
}

fn compile_filter(cli: &Cli) -> anyhow::Result<Option<Regex>> {
    cli.filter
        .as_deref()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid filter {:?}: {}", pattern, e))
        })
        .transpose()
}

/// Layer settings: countbench.toml defaults → CLI overrides
fn build_settings(cli: &Cli, config: &CountbenchConfig) -> anyhow::Result<Settings> {
    let mut settings = config.settings()?;
    if let Some(jobs) = cli.jobs {
        settings.jobs = jobs;
    }
    settings.filter = compile_filter(cli)?;
    settings.progress = true;
    Ok(settings)
}

fn ab_with_config<S, E>(
    cli: &Cli,
    config: &CountbenchConfig,
    suite: &S,
    executor: E,
    selector: SuiteSelector,
    (source_a, source_b): (&str, &str),
    renderer: &dyn Renderer,
) -> anyhow::Result<AbComparison>
where
    S: Suite + ?Sized,
    E: SnippetExecutor + 'static,
{
    let settings = build_settings(cli, config)?;

    let comparison = match config.runner.isolation {
        IsolationMode::InProcess => {
            tracing::warn!("running snippets in-process; counts are not isolated");
            let backend = InProcessBackend::new(executor);
            ab_test(suite, selector, source_a, source_b, backend, &settings, renderer)?
        }
        #[cfg(unix)]
        IsolationMode::Process => {
            let backend = countbench_runner::ProcessBackend::current_exe()?;
            ab_test(suite, selector, source_a, source_b, backend, &settings, renderer)?
        }
        #[cfg(not(unix))]
        IsolationMode::Process => {
            anyhow::bail!("process isolation is only supported on Unix; set isolation = \"in-process\"")
        }
    };

    tracing::info!(
        backend_invocations = comparison.collection.backend_invocations,
        diagnostics = comparison.collection.diagnostics.len(),
        "A/B comparison finished"
    );
    Ok(comparison)
}

fn write_output(cli: &Cli, output: &str) -> anyhow::Result<()> {
    if let Some(ref path) = cli.output {
        let mut file = std::fs::File::create(path)?;
        file.write_all(output.as_bytes())?;
        eprintln!("Report written to: {}", path.display());
    } else {
        println!("{}", output);
    }
    Ok(())
}

fn list_benchmarks<S: Suite + ?Sized>(
    cli: &Cli,
    suite: &S,
    selector: SuiteSelector,
) -> anyhow::Result<()> {
    let filter = compile_filter(cli)?;
    let plan = build_plan(
        suite.benchmarks(selector),
        filter.as_ref(),
        &[None],
        &OrderBudget::default(),
    );

    let mut out = format!("Countbench Plan ({}):\n", selector);
    for bench in &plan.benchmarks {
        out.push_str(&format!(
            "├── {} [{}, {} thread(s)]\n",
            bench.label, bench.mode, bench.timer_args.num_threads
        ));
    }
    out.push_str(&format!("{} benchmarks found.", plan.benchmarks.len()));

    write_output(cli, &out)
}
