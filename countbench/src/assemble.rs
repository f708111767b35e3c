//! Result Assembly
//!
//! Once the dispatcher is quiescent, every environment's orders are read back
//! in group order, yielding one row per logical benchmark. Row `i` of every
//! environment refers to the same benchmark.

use crate::convergence::{ConvergenceCallback, GroupId};
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use countbench_core::{InstructionCounts, Label, Mode, WallTime, WorkOrder};
use countbench_runner::RunOutcome;
use serde::Serialize;

/// One benchmark's result in one environment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    /// Benchmark
    pub label: Label,
    /// Intra-op thread count
    pub num_threads: u32,
    /// Execution strategy
    pub mode: Mode,
    /// Measurement or the reason there is none
    pub value: RowValue,
}

/// Measurement data of a row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RowValue {
    /// The original order produced output
    Measured {
        /// Counts of the original order (`None` when it did not collect them)
        instructions: Option<InstructionCounts>,
        /// Wall time of the original order (exactly one entry)
        wall_times: Vec<WallTime>,
        /// True only when counts agreed across environments, or the
        /// benchmark does not collect instructions
        stable: bool,
        /// Wall times of timing-only replicates, if any were spawned
        replicate_wall_times: Vec<WallTime>,
    },
    /// The original order exhausted its attempt budget
    Missing {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        reason: String,
    },
}

impl RowValue {
    /// Whether the row carries a measurement
    pub fn is_measured(&self) -> bool {
        matches!(self, RowValue::Measured { .. })
    }
}

/// Rows of one environment, in suite order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentResults {
    /// Environment the rows were measured in
    pub source_cmd: Option<String>,
    /// One row per benchmark
    pub rows: Vec<ResultRow>,
}

/// Read back one sequence per environment plus findings about the benchmark orders
pub fn assemble(
    source_cmds: &[Option<String>],
    convergence: &ConvergenceCallback,
    outcome: &RunOutcome,
) -> (Vec<EnvironmentResults>, Vec<Diagnostic>) {
    let table = convergence.table();
    let mut diagnostics = Vec::new();

    for group in convergence.unstable_groups() {
        let Some(first) = table.get(group, 0) else {
            continue;
        };
        diagnostics.push(Diagnostic::across_environments(
            DiagnosticKind::CountDisagreement {
                label: first.label().clone(),
                counts: convergence
                    .observed_counts(group)
                    .map(<[u64]>::to_vec)
                    .unwrap_or_default(),
            },
        ));
    }

    let environments = source_cmds
        .iter()
        .enumerate()
        .map(|(env, source_cmd)| {
            let rows = table
                .group_ids()
                .filter_map(|group| {
                    let order = table.get(group, env)?;
                    let stable = is_stable(convergence, group);
                    Some(row(order, stable, convergence, outcome, &mut diagnostics))
                })
                .collect();
            EnvironmentResults {
                source_cmd: source_cmd.clone(),
                rows,
            }
        })
        .collect();

    (environments, diagnostics)
}

/// Counts were compared and agreed. Groups that never collect instructions have
/// nothing to compare and count as stable; a group left unchecked because a
/// member failed does not.
fn is_stable(convergence: &ConvergenceCallback, group: GroupId) -> bool {
    if convergence.is_unstable(group) {
        return false;
    }
    !convergence.table().collects_instructions(group) || convergence.is_checked(group)
}

fn row(
    order: &WorkOrder,
    stable: bool,
    convergence: &ConvergenceCallback,
    outcome: &RunOutcome,
    diagnostics: &mut Vec<Diagnostic>,
) -> ResultRow {
    for replicate in convergence.replicates_of(order) {
        report_failure(replicate, outcome, diagnostics);
    }

    let value = match outcome.output(order) {
        Some(output) => RowValue::Measured {
            instructions: output.instructions,
            wall_times: vec![output.wall_time.clone()],
            stable,
            replicate_wall_times: convergence
                .replicates_of(order)
                .iter()
                .filter_map(|replicate| outcome.output(replicate))
                .map(|output| output.wall_time.clone())
                .collect(),
        },
        None => {
            report_failure(order, outcome, diagnostics);
            match outcome.failure(order) {
                Some(failed) => RowValue::Missing {
                    attempts: failed.attempts,
                    reason: failed.last_error.to_string(),
                },
                None => RowValue::Missing {
                    attempts: 0,
                    reason: "no result recorded".to_string(),
                },
            }
        }
    };

    ResultRow {
        label: order.label().clone(),
        num_threads: order.timer_args().num_threads,
        mode: order.mode(),
        value,
    }
}

fn report_failure(order: &WorkOrder, outcome: &RunOutcome, diagnostics: &mut Vec<Diagnostic>) {
    if let Some(failed) = outcome.failure(order) {
        diagnostics.push(Diagnostic::new(
            order.source_cmd(),
            DiagnosticKind::PermanentFailure {
                label: order.label().clone(),
                attempts: failed.attempts,
                error: failed.last_error.to_string(),
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::ComparisonTable;
    use countbench_core::{Language, TimerArgs, WorkerOutput};
    use countbench_runner::{InProcessBackend, MeasureRequest, Runner, SnippetError, SnippetExecutor};

    /// Count is the statement length, except `fail` which never succeeds
    struct ByStatement;

    impl SnippetExecutor for ByStatement {
        fn execute(&mut self, request: &MeasureRequest) -> Result<WorkerOutput, SnippetError> {
            if request.timer_args.stmt == "fail" {
                return Err(SnippetError::new("boom"));
            }
            let count = request.timer_args.stmt.len() as u64;
            Ok(WorkerOutput::new(
                InstructionCounts::exact(count),
                WallTime::new(vec![count as f64 * 1e-9]),
            ))
        }
    }

    fn group(name: &str, stmt: &str, envs: &[Option<String>]) -> Vec<WorkOrder> {
        envs.iter()
            .map(|source_cmd| {
                WorkOrder::builder(
                    Label::new([name]),
                    Mode::Native,
                    TimerArgs::new(stmt, Language::Native),
                )
                .source_cmd(source_cmd.clone())
                .retries(0)
                .build()
            })
            .collect()
    }

    #[test]
    fn test_rows_follow_group_order() {
        let envs = vec![Some("a".to_string()), Some("b".to_string())];
        let groups = vec![
            group("add", "x + y", &envs),
            group("neg", "-x", &envs),
            group("broken", "fail", &envs),
        ];
        let table = ComparisonTable::from_groups(groups).unwrap();
        let mut convergence = ConvergenceCallback::new(table);
        let orders: Vec<_> = convergence.table().orders().cloned().collect();

        let outcome = Runner::new(InProcessBackend::new(ByStatement))
            .run_with_callback(orders, &mut convergence)
            .unwrap();
        let (environments, diagnostics) = assemble(&envs, &convergence, &outcome);

        assert_eq!(environments.len(), 2);
        assert_eq!(environments[1].source_cmd.as_deref(), Some("b"));
        for env in &environments {
            let labels: Vec<_> = env.rows.iter().map(|r| r.label.to_string()).collect();
            assert_eq!(labels, vec!["add", "neg", "broken"]);
            assert!(env.rows[0].value.is_measured());
            assert!(matches!(
                env.rows[2].value,
                RowValue::Missing { attempts: 1, .. }
            ));
        }
        match &environments[0].rows[0].value {
            RowValue::Measured {
                instructions,
                wall_times,
                stable,
                replicate_wall_times,
            } => {
                assert_eq!(instructions.map(|c| c.denoised), Some(5));
                assert_eq!(wall_times.len(), 1);
                assert!(*stable);
                assert!(replicate_wall_times.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        let failures = diagnostics
            .iter()
            .filter(|d| matches!(d.kind, DiagnosticKind::PermanentFailure { .. }))
            .count();
        assert_eq!(failures, 2);
    }
}
