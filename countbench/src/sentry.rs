//! Stability Sentry
//!
//! Before trusting any count from an environment, run a tiny native snippet
//! there three times. Native execution under explicit timing is fully
//! deterministic, so any spread in its raw counts means the measurement
//! environment itself is noisy. Results from that environment stay usable but
//! are flagged.

use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::planner::OrderBudget;
use countbench_core::{CostEstimate, Label, Language, Mode, TimerArgs, WorkOrder};
use countbench_runner::RunOutcome;

/// Sentry runs per environment
pub const SENTRY_RUNS: usize = 3;

const SENTRY_SETUP: &str = "auto y = ones({4, 4});";
const SENTRY_STMT: &str = "auto x = ones({4, 4});\nauto z = x - y;";

/// One sentry order for `source_cmd`
pub fn sentry_order(source_cmd: Option<&str>, budget: &OrderBudget) -> WorkOrder {
    let timer_args = TimerArgs::new(SENTRY_STMT, Language::Native)
        .with_setup(SENTRY_SETUP)
        .with_num_threads(1)
        .with_cost(CostEstimate::LessThan10Us);

    WorkOrder::builder(Label::new(["Impl", "Sentry"]), Mode::ExplicitNative, timer_args)
        .source_cmd(source_cmd.map(str::to_string))
        .timeout(budget.timeout)
        .retries(budget.retries)
        .build()
}

/// Sentry orders for every environment of a collection
#[derive(Debug, Clone)]
pub struct SentryPlan {
    environments: Vec<(Option<String>, Vec<WorkOrder>)>,
}

impl SentryPlan {
    /// Three sentry orders per environment
    pub fn new(source_cmds: &[Option<String>], budget: &OrderBudget) -> Self {
        let environments = source_cmds
            .iter()
            .map(|source_cmd| {
                let orders = (0..SENTRY_RUNS)
                    .map(|_| sentry_order(source_cmd.as_deref(), budget))
                    .collect();
                (source_cmd.clone(), orders)
            })
            .collect();
        Self { environments }
    }

    /// Every sentry order, environment by environment
    pub fn orders(&self) -> impl Iterator<Item = &WorkOrder> {
        self.environments.iter().flat_map(|(_, orders)| orders)
    }

    /// Check every environment's sentry runs in `outcome`
    pub fn evaluate(&self, outcome: &RunOutcome) -> Vec<Diagnostic> {
        self.environments
            .iter()
            .filter_map(|(source_cmd, orders)| {
                evaluate_environment(source_cmd.as_deref(), orders, outcome)
            })
            .collect()
    }
}

fn evaluate_environment(
    source_cmd: Option<&str>,
    orders: &[WorkOrder],
    outcome: &RunOutcome,
) -> Option<Diagnostic> {
    let mut counts = Vec::with_capacity(orders.len());
    for (run, order) in orders.iter().enumerate() {
        let reason = match outcome.output(order) {
            Some(output) => match output.counts(false) {
                Some(count) => {
                    counts.push(count);
                    continue;
                }
                None => format!("sentry run {} reported no instruction counts", run + 1),
            },
            None => match outcome.failure(order) {
                Some(failed) => format!(
                    "sentry run {} failed after {} attempt(s): {}",
                    run + 1,
                    failed.attempts,
                    failed.last_error
                ),
                None => format!("sentry run {} produced no result", run + 1),
            },
        };
        return Some(Diagnostic::new(
            source_cmd,
            DiagnosticKind::SentryIncomplete { reason },
        ));
    }
    check_counts(source_cmd, &counts)
}

/// Warn unless every raw sentry count is identical
pub fn check_counts(source_cmd: Option<&str>, counts: &[u64]) -> Option<Diagnostic> {
    if counts.windows(2).all(|pair| pair[0] == pair[1]) {
        return None;
    }
    Some(Diagnostic::new(
        source_cmd,
        DiagnosticKind::UnstableEnvironment {
            counts: counts.to_vec(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticScope;
    use countbench_core::{InstructionCounts, WallTime, WorkerOutput};
    use countbench_runner::{BackendError, InProcessBackend, MeasureRequest, Runner};
    use countbench_runner::{SnippetError, SnippetExecutor};
    use std::collections::VecDeque;

    #[test]
    fn test_identical_counts_pass() {
        assert_eq!(check_counts(Some("env"), &[100, 100, 100]), None);
    }

    #[test]
    fn test_varying_counts_warn() {
        let diag = check_counts(Some("env"), &[100, 101, 100]).unwrap();
        assert_eq!(diag.scope, DiagnosticScope::environment(Some("env")));
        assert_eq!(
            diag.kind,
            DiagnosticKind::UnstableEnvironment {
                counts: vec![100, 101, 100]
            }
        );
    }

    #[test]
    fn test_sentry_orders() {
        let envs = vec![Some("a".to_string()), None];
        let plan = SentryPlan::new(&envs, &OrderBudget::default());

        let orders: Vec<_> = plan.orders().collect();
        assert_eq!(orders.len(), 6);
        assert!(orders.iter().all(|o| o.mode() == Mode::ExplicitNative));
        assert!(orders.iter().all(|o| o.timer_args().num_threads == 1));
        assert!(
            orders
                .iter()
                .all(|o| o.timer_args().cost == CostEstimate::LessThan10Us)
        );
        assert!(orders.iter().all(|o| o.label().to_string() == "Impl/Sentry"));
        assert_eq!(orders[0].source_cmd(), Some("a"));
        assert_eq!(orders[5].source_cmd(), None);
        // field-identical but individually tracked
        assert_ne!(orders[0].id(), orders[1].id());
    }

    /// Hands out raw counts in sequence; `None` fails the attempt
    struct Sequence(VecDeque<Option<u64>>);

    impl SnippetExecutor for Sequence {
        fn execute(&mut self, _request: &MeasureRequest) -> Result<WorkerOutput, SnippetError> {
            match self.0.pop_front().flatten() {
                Some(raw) => Ok(WorkerOutput::new(
                    InstructionCounts::new(raw, raw - 10),
                    WallTime::new(vec![1e-6]),
                )),
                None => Err(SnippetError::new("sentry did not compile")),
            }
        }
    }

    #[test]
    fn test_evaluate_flags_unstable_environment() {
        let envs = vec![Some("a".to_string())];
        let plan = SentryPlan::new(&envs, &OrderBudget::default());
        let backend = InProcessBackend::new(Sequence(
            [Some(100), Some(101), Some(100)].into_iter().collect(),
        ));

        let outcome = Runner::new(backend)
            .run(plan.orders().cloned())
            .unwrap();
        let diagnostics = plan.evaluate(&outcome);

        assert_eq!(diagnostics.len(), 1);
        match &diagnostics[0].kind {
            DiagnosticKind::UnstableEnvironment { counts } => {
                let mut sorted = counts.clone();
                sorted.sort();
                assert_eq!(sorted, vec![100, 100, 101]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_evaluate_reports_failed_sentry() {
        let envs = vec![None];
        let budget = OrderBudget {
            retries: 0,
            ..OrderBudget::default()
        };
        let plan = SentryPlan::new(&envs, &budget);
        let backend = InProcessBackend::new(Sequence(
            [Some(100), None, Some(100)].into_iter().collect(),
        ));

        let outcome = Runner::new(backend)
            .run(plan.orders().cloned())
            .unwrap();
        let diagnostics = plan.evaluate(&outcome);

        assert_eq!(diagnostics.len(), 1);
        assert!(matches!(
            diagnostics[0].kind,
            DiagnosticKind::SentryIncomplete { .. }
        ));
        assert_eq!(outcome.failure_count(), 1);
        assert!(matches!(
            outcome.failures().next().map(|f| &f.last_error),
            Some(BackendError::Snippet { .. })
        ));
    }
}
