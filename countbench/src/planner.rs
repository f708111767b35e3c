//! Benchmark Planner
//!
//! Builds the execution plan by filtering the suite and expanding every
//! remaining definition into one work order per environment.
//!
//! Filtering: regex match on the displayed label (`Math/add`).
//!
//! Ordering: suite order is preserved. Row `i` of every environment's results
//! refers to the `i`-th selected definition.

use crate::suite::BenchmarkDef;
use countbench_core::{DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECS, WorkOrder};
use std::time::Duration;

/// Timeout and retry budget stamped onto every planned order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBudget {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Additional attempts after a failure
    pub retries: u32,
}

impl Default for OrderBudget {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retries: DEFAULT_RETRIES,
        }
    }
}

impl OrderBudget {
    /// Order for `def` under `source_cmd`
    pub fn order(&self, def: &BenchmarkDef, source_cmd: Option<&str>) -> WorkOrder {
        WorkOrder::builder(def.label.clone(), def.mode, def.timer_args.clone())
            .source_cmd(source_cmd.map(str::to_string))
            .timeout(self.timeout)
            .retries(self.retries)
            .build()
    }
}

/// Execution plan for one collection
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Selected definitions, in suite order
    pub benchmarks: Vec<BenchmarkDef>,
    /// One group per definition, one order per environment
    pub groups: Vec<Vec<WorkOrder>>,
}

impl ExecutionPlan {
    /// Every planned order, group by group
    pub fn orders(&self) -> impl Iterator<Item = &WorkOrder> {
        self.groups.iter().flatten()
    }
}

/// Build the execution plan for `source_cmds` from the suite's definitions
pub fn build_plan(
    benchmarks: impl IntoIterator<Item = BenchmarkDef>,
    filter: Option<&regex::Regex>,
    source_cmds: &[Option<String>],
    budget: &OrderBudget,
) -> ExecutionPlan {
    let benchmarks: Vec<_> = benchmarks
        .into_iter()
        .filter(|b| filter.is_none_or(|re| re.is_match(&b.label.to_string())))
        .collect();

    let groups = benchmarks
        .iter()
        .map(|def| {
            source_cmds
                .iter()
                .map(|source_cmd| budget.order(def, source_cmd.as_deref()))
                .collect()
        })
        .collect();

    ExecutionPlan { benchmarks, groups }
}
