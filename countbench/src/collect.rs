//! Collection Pipeline
//!
//! ```text
//! suite ─► planner ─► comparison table ─┐
//!                     sentry orders ────┴─► Runner + ConvergenceCallback
//!                                                  │ quiescent
//!                     sentry evaluation ◄──────────┤
//!                     result assembly   ◄──────────┘
//! ```

use crate::assemble::{EnvironmentResults, assemble};
use crate::convergence::{ComparisonTable, ConvergenceCallback, ConvergencePolicy};
use crate::diagnostics::Diagnostic;
use crate::planner::{OrderBudget, build_plan};
use crate::render::{RenderError, Renderer};
use crate::sentry::SentryPlan;
use crate::suite::{Suite, SuiteSelector};
use countbench_runner::{ContractViolation, MeasurementBackend, RetryPolicy, Runner, RunnerError};
use thiserror::Error;
use tracing::info;

/// Knobs for one collection
#[derive(Debug, Clone)]
pub struct Settings {
    /// Timeout and retries of every order
    pub budget: OrderBudget,
    /// Concurrent attempts
    pub jobs: usize,
    /// Backoff between attempts
    pub retry_policy: RetryPolicy,
    /// Replicates on count disagreement
    pub convergence: ConvergencePolicy,
    /// Run the stability sentry first
    pub sentry: bool,
    /// Only benchmarks whose label matches
    pub filter: Option<regex::Regex>,
    /// Show a progress bar
    pub progress: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            budget: OrderBudget::default(),
            jobs: 1,
            retry_policy: RetryPolicy::default(),
            convergence: ConvergencePolicy::default(),
            sentry: true,
            filter: None,
            progress: false,
        }
    }
}

/// Errors that abort a collection
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("At least one environment is required")]
    NoEnvironments,

    #[error("A/B comparison needs exactly two environments, got {0}")]
    NotAb(usize),

    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),
}

/// Everything a collection produced
#[derive(Debug, Clone)]
pub struct Collection {
    /// One result sequence per environment, in the order given
    pub environments: Vec<EnvironmentResults>,
    /// Non-fatal findings
    pub diagnostics: Vec<Diagnostic>,
    /// Backend attempts made, sentries and replicates included
    pub backend_invocations: u64,
}

/// Measure every selected benchmark of `suite` in every environment
pub fn collect<S, B>(
    suite: &S,
    selector: SuiteSelector,
    source_cmds: &[Option<String>],
    backend: B,
    settings: &Settings,
) -> Result<Collection, CollectError>
where
    S: Suite + ?Sized,
    B: MeasurementBackend + 'static,
{
    if source_cmds.is_empty() {
        return Err(CollectError::NoEnvironments);
    }

    let plan = build_plan(
        suite.benchmarks(selector),
        settings.filter.as_ref(),
        source_cmds,
        &settings.budget,
    );
    let benchmarks = plan.benchmarks.len();
    let table = ComparisonTable::with_environments(source_cmds.len(), plan.groups)?;
    let mut convergence = ConvergenceCallback::with_policy(table, settings.convergence)?;

    let sentry = settings
        .sentry
        .then(|| SentryPlan::new(source_cmds, &settings.budget));
    let orders: Vec<_> = sentry
        .iter()
        .flat_map(SentryPlan::orders)
        .chain(convergence.table().orders())
        .cloned()
        .collect();

    info!(
        selector = %selector,
        benchmarks,
        environments = source_cmds.len(),
        orders = orders.len(),
        "collecting measurements"
    );

    let outcome = Runner::new(backend)
        .jobs(settings.jobs)
        .retry_policy(settings.retry_policy.clone())
        .progress(settings.progress)
        .run_with_callback(orders, &mut convergence)?;

    let mut diagnostics = sentry
        .map(|plan| plan.evaluate(&outcome))
        .unwrap_or_default();
    let (environments, findings) = assemble(source_cmds, &convergence, &outcome);
    diagnostics.extend(findings);

    for diagnostic in &diagnostics {
        diagnostic.log();
    }
    info!(
        succeeded = outcome.success_count(),
        failed = outcome.failure_count(),
        diagnostics = diagnostics.len(),
        "collection complete"
    );

    Ok(Collection {
        environments,
        diagnostics,
        backend_invocations: outcome.backend_invocations(),
    })
}

/// Rendered A/B comparison and the collection behind it
#[derive(Debug, Clone)]
pub struct AbComparison {
    /// Output of the renderer
    pub rendered: String,
    /// Both environments' results
    pub collection: Collection,
}

/// Collect `source_a` and `source_b` and render them against each other
pub fn ab_test<S, B>(
    suite: &S,
    selector: SuiteSelector,
    source_a: &str,
    source_b: &str,
    backend: B,
    settings: &Settings,
    renderer: &dyn Renderer,
) -> Result<AbComparison, CollectError>
where
    S: Suite + ?Sized,
    B: MeasurementBackend + 'static,
{
    let source_cmds = [Some(source_a.to_string()), Some(source_b.to_string())];
    let collection = collect(suite, selector, &source_cmds, backend, settings)?;

    let [a, b] = collection.environments.as_slice() else {
        return Err(CollectError::NotAb(collection.environments.len()));
    };
    let rendered = renderer.render_ab(a, b, &collection.diagnostics)?;

    Ok(AbComparison {
        rendered,
        collection,
    })
}
