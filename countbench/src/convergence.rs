//! Instruction-Count Convergence
//!
//! The same logical benchmark measured in every environment forms a comparison
//! group. Once all members of a group have reported, their denoised
//! instruction counts must agree exactly. When they do not, counts for that
//! benchmark cannot be trusted, so each member is replicated with instruction
//! collection disabled and only its wall time is stabilized further.
//!
//! Replicates are never tracked as a group of their own, so every original
//! group triggers at most one generation of follow-up work and the dispatcher
//! always reaches quiescence.

use countbench_core::{WorkOrder, WorkOrderId, WorkerOutput};
use countbench_runner::{Callback, ContractViolation};
use fxhash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Default number of replicates per member of a disagreeing group
pub const DEFAULT_REPLICATES: usize = 3;

/// Index of a logical benchmark within a comparison table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct GroupId(usize);

impl GroupId {
    /// Position of the group (suite order)
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work orders keyed by `(group, environment)`
///
/// Every group holds exactly one order per environment, and all members of a
/// group agree on label, mode and thread count.
#[derive(Debug, Clone)]
pub struct ComparisonTable {
    environments: usize,
    groups: usize,
    entries: FxHashMap<(GroupId, usize), WorkOrder>,
    positions: FxHashMap<WorkOrderId, (GroupId, usize)>,
}

impl ComparisonTable {
    /// Build a table from one vector per logical benchmark, one entry per environment
    pub fn from_groups(groups: Vec<Vec<WorkOrder>>) -> Result<Self, ContractViolation> {
        let environments = groups.first().map_or(0, Vec::len);
        if !groups.is_empty() && environments == 0 {
            return Err(ContractViolation::NoEnvironments);
        }
        Self::build(environments, groups)
    }

    /// Like [`from_groups`](Self::from_groups) but with a known environment
    /// count, so that a table without benchmarks still has environments
    pub fn with_environments(
        environments: usize,
        groups: Vec<Vec<WorkOrder>>,
    ) -> Result<Self, ContractViolation> {
        if environments == 0 {
            return Err(ContractViolation::NoEnvironments);
        }
        Self::build(environments, groups)
    }

    fn build(environments: usize, groups: Vec<Vec<WorkOrder>>) -> Result<Self, ContractViolation> {
        let group_count = groups.len();
        let mut entries = FxHashMap::default();
        let mut positions = FxHashMap::default();

        for (index, members) in groups.into_iter().enumerate() {
            let group = GroupId(index);
            if members.len() != environments {
                return Err(ContractViolation::MismatchedGroupSize {
                    group: index,
                    expected: environments,
                    got: members.len(),
                });
            }

            let expected = alignment_key(&members[0]);
            for (env, order) in members.into_iter().enumerate() {
                let got = alignment_key(&order);
                if got != expected {
                    return Err(ContractViolation::MisalignedGroup {
                        group: index,
                        expected,
                        got,
                    });
                }
                if positions.insert(order.id(), (group, env)).is_some() {
                    return Err(ContractViolation::DuplicateTrackedOrder { order: order.id() });
                }
                entries.insert((group, env), order);
            }
        }

        Ok(Self {
            environments,
            groups: group_count,
            entries,
            positions,
        })
    }

    /// Number of environments (orders per group)
    pub fn environment_count(&self) -> usize {
        self.environments
    }

    /// Number of logical benchmarks
    pub fn group_count(&self) -> usize {
        self.groups
    }

    /// Group ids in suite order
    pub fn group_ids(&self) -> impl Iterator<Item = GroupId> {
        (0..self.groups).map(GroupId)
    }

    /// Order for `group` in environment `env`
    pub fn get(&self, group: GroupId, env: usize) -> Option<&WorkOrder> {
        self.entries.get(&(group, env))
    }

    /// Members of `group`, in environment order
    pub fn group(&self, group: GroupId) -> impl Iterator<Item = &WorkOrder> {
        (0..self.environments).filter_map(move |env| self.get(group, env))
    }

    /// Orders of environment `env`, in group order
    pub fn environment(&self, env: usize) -> impl Iterator<Item = &WorkOrder> {
        self.group_ids().filter_map(move |group| self.get(group, env))
    }

    /// `(group, environment)` of a tracked order
    pub fn position(&self, order: &WorkOrder) -> Option<(GroupId, usize)> {
        self.positions.get(&order.id()).copied()
    }

    /// Every order in the table, group by group
    pub fn orders(&self) -> impl Iterator<Item = &WorkOrder> {
        self.group_ids().flat_map(move |group| self.group(group))
    }

    /// Whether every member of `group` collects instruction counts
    pub fn collects_instructions(&self, group: GroupId) -> bool {
        self.group(group)
            .all(|order| order.timer_args().collect_instructions)
    }
}

fn alignment_key(order: &WorkOrder) -> String {
    format!(
        "{} ({}, {} thread(s))",
        order.label(),
        order.mode(),
        order.timer_args().num_threads
    )
}

/// Tunable part of convergence handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergencePolicy {
    /// Timing-only replicates emitted per member of a disagreeing group
    pub replicates: usize,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            replicates: DEFAULT_REPLICATES,
        }
    }
}

impl ConvergencePolicy {
    /// Reject policies that could not feed a majority rule downstream
    pub fn validate(&self) -> Result<(), ContractViolation> {
        if self.replicates == 0 {
            return Err(ContractViolation::InvalidPolicy(
                "replicates must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Dispatcher callback checking instruction-count agreement per group
#[derive(Debug)]
pub struct ConvergenceCallback {
    table: ComparisonTable,
    policy: ConvergencePolicy,
    outstanding: Vec<usize>,
    outputs: FxHashMap<WorkOrderId, WorkerOutput>,
    observed: FxHashMap<GroupId, Vec<u64>>,
    replicates: FxHashMap<WorkOrderId, Vec<WorkOrder>>,
    unstable: FxHashSet<GroupId>,
}

impl ConvergenceCallback {
    /// Track every group of `table` with the default policy
    pub fn new(table: ComparisonTable) -> Self {
        let outstanding = vec![table.environment_count(); table.group_count()];
        Self {
            table,
            policy: ConvergencePolicy::default(),
            outstanding,
            outputs: FxHashMap::default(),
            observed: FxHashMap::default(),
            replicates: FxHashMap::default(),
            unstable: FxHashSet::default(),
        }
    }

    /// Track every group of `table` under `policy`
    pub fn with_policy(
        table: ComparisonTable,
        policy: ConvergencePolicy,
    ) -> Result<Self, ContractViolation> {
        policy.validate()?;
        let mut callback = Self::new(table);
        callback.policy = policy;
        Ok(callback)
    }

    /// The table being tracked
    pub fn table(&self) -> &ComparisonTable {
        &self.table
    }

    /// Output recorded for `order`, tracked or not
    pub fn output(&self, order: &WorkOrder) -> Option<&WorkerOutput> {
        self.outputs.get(&order.id())
    }

    /// Timing-only replicates spawned for an original order
    pub fn replicates_of(&self, order: &WorkOrder) -> &[WorkOrder] {
        self.replicates
            .get(&order.id())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `group` reported disagreeing counts
    pub fn is_unstable(&self, group: GroupId) -> bool {
        self.unstable.contains(&group)
    }

    /// Disagreeing groups in suite order
    pub fn unstable_groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<_> = self.unstable.iter().copied().collect();
        groups.sort();
        groups
    }

    /// Whether counts of `group` were compared across all environments.
    ///
    /// Stays false when a member never reported, e.g. after a permanent failure.
    pub fn is_checked(&self, group: GroupId) -> bool {
        self.observed.contains_key(&group)
    }

    /// Denoised counts of a fully reported group, in environment order
    pub fn observed_counts(&self, group: GroupId) -> Option<&[u64]> {
        self.observed.get(&group).map(Vec::as_slice)
    }

    /// Members of `group` still to report
    pub fn outstanding(&self, group: GroupId) -> usize {
        self.outstanding.get(group.index()).copied().unwrap_or(0)
    }

    fn check_group(&mut self, group: GroupId) -> Result<Vec<WorkOrder>, ContractViolation> {
        let members: Vec<WorkOrder> = self.table.group(group).cloned().collect();
        let mut counts = Vec::with_capacity(members.len());
        for order in &members {
            let count = self
                .outputs
                .get(&order.id())
                .and_then(|output| output.counts(true))
                .ok_or_else(|| ContractViolation::MissingInstructionCounts {
                    order: order.id(),
                    label: order.label().to_string(),
                })?;
            counts.push(count);
        }

        let converged = counts.windows(2).all(|pair| pair[0] == pair[1]);
        self.observed.insert(group, counts);
        if converged {
            debug!(group = %group, "instruction counts converged");
            return Ok(Vec::new());
        }

        debug!(
            group = %group,
            counts = ?self.observed.get(&group),
            replicates = self.policy.replicates,
            "instruction counts disagree, replicating for wall time"
        );
        self.unstable.insert(group);

        let mut follow_up = Vec::with_capacity(members.len() * self.policy.replicates);
        for order in &members {
            let copies: Vec<WorkOrder> = (0..self.policy.replicates)
                .map(|_| order.without_instructions())
                .collect();
            follow_up.extend(copies.iter().cloned());
            self.replicates.insert(order.id(), copies);
        }
        Ok(follow_up)
    }
}

impl Callback for ConvergenceCallback {
    fn on_complete(
        &mut self,
        order: &WorkOrder,
        output: &WorkerOutput,
    ) -> Result<Vec<WorkOrder>, ContractViolation> {
        if self.outputs.contains_key(&order.id()) {
            return Err(ContractViolation::duplicate_completion(order));
        }
        self.outputs.insert(order.id(), output.clone());

        let Some((group, _)) = self.table.position(order) else {
            return Ok(Vec::new());
        };
        if !self.table.collects_instructions(group) {
            return Ok(Vec::new());
        }
        if output.instructions.is_none() {
            return Err(ContractViolation::MissingInstructionCounts {
                order: order.id(),
                label: order.label().to_string(),
            });
        }

        let remaining = &mut self.outstanding[group.index()];
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return Ok(Vec::new());
        }
        self.check_group(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use countbench_core::{
        InstructionCounts, Label, Language, Mode, TimerArgs, WallTime,
    };
    use std::time::Duration;

    fn order(name: &str, source: Option<&str>) -> WorkOrder {
        WorkOrder::builder(
            Label::new(["Math", name]),
            Mode::Native,
            TimerArgs::new("x + y", Language::Native).with_num_threads(2),
        )
        .source_cmd(source.map(str::to_string))
        .timeout(Duration::from_secs(30))
        .retries(1)
        .build()
    }

    fn group(name: &str, n: usize) -> Vec<WorkOrder> {
        (0..n)
            .map(|i| order(name, Some(&format!("source env{}", i))))
            .collect()
    }

    fn output(denoised: u64) -> WorkerOutput {
        WorkerOutput::new(
            InstructionCounts::new(denoised + 17, denoised),
            WallTime::new(vec![2e-6]),
        )
    }

    fn callback(groups: Vec<Vec<WorkOrder>>) -> ConvergenceCallback {
        ConvergenceCallback::new(ComparisonTable::from_groups(groups).unwrap())
    }

    #[test]
    fn test_agreeing_group_emits_nothing() {
        let members = group("add", 3);
        let mut cb = callback(vec![members.clone()]);

        for order in &members {
            assert!(cb.on_complete(order, &output(1000)).unwrap().is_empty());
        }
        assert!(!cb.is_unstable(GroupId(0)));
        assert_eq!(cb.observed_counts(GroupId(0)), Some(&[1000, 1000, 1000][..]));
    }

    #[test]
    fn test_group_with_silent_member_stays_unchecked() {
        let members = group("add", 2);
        let mut cb = callback(vec![members.clone()]);

        assert!(cb.on_complete(&members[0], &output(1000)).unwrap().is_empty());
        assert_eq!(cb.outstanding(GroupId(0)), 1);
        assert!(!cb.is_checked(GroupId(0)));
        assert!(!cb.is_unstable(GroupId(0)));
        assert_eq!(cb.observed_counts(GroupId(0)), None);
    }

    #[test]
    fn test_disagreeing_group_emits_replicates_per_member() {
        let members = group("add", 3);
        let mut cb = callback(vec![members.clone()]);

        assert!(cb.on_complete(&members[0], &output(1000)).unwrap().is_empty());
        assert!(cb.on_complete(&members[1], &output(1001)).unwrap().is_empty());
        let follow_up = cb.on_complete(&members[2], &output(1000)).unwrap();

        assert_eq!(follow_up.len(), 3 * members.len());
        assert!(cb.is_unstable(GroupId(0)));
        for original in &members {
            let copies = cb.replicates_of(original);
            assert_eq!(copies.len(), 3);
            for copy in copies {
                assert_ne!(copy.id(), original.id());
                assert!(!copy.timer_args().collect_instructions);
                assert_eq!(
                    copy.timer_args(),
                    &original.timer_args().clone().with_collect_instructions(false)
                );
                assert_eq!(copy.label(), original.label());
                assert_eq!(copy.mode(), original.mode());
                assert_eq!(copy.source_cmd(), original.source_cmd());
                assert_eq!(copy.timeout(), original.timeout());
                assert_eq!(copy.retries(), original.retries());
                assert!(follow_up.contains(copy));
            }
        }
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        let members = group("add", 3);
        for permutation in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let mut cb = callback(vec![members.clone()]);
            let counts = [5, 6, 5];
            let emitted: Vec<usize> = permutation
                .iter()
                .map(|&i| cb.on_complete(&members[i], &output(counts[i])).unwrap().len())
                .collect();
            assert_eq!(emitted, vec![0, 0, 9]);
            assert_eq!(cb.observed_counts(GroupId(0)), Some(&[5, 6, 5][..]));
        }
    }

    #[test]
    fn test_groups_are_independent() {
        let add = group("add", 2);
        let mul = group("mul", 2);
        let mut cb = callback(vec![add.clone(), mul.clone()]);

        cb.on_complete(&add[0], &output(10)).unwrap();
        cb.on_complete(&mul[0], &output(20)).unwrap();
        assert_eq!(cb.outstanding(GroupId(0)), 1);
        assert!(cb.on_complete(&mul[1], &output(20)).unwrap().is_empty());
        assert_eq!(cb.on_complete(&add[1], &output(11)).unwrap().len(), 6);
        assert_eq!(cb.unstable_groups(), vec![GroupId(0)]);
    }

    #[test]
    fn test_duplicate_invocation_is_contract_violation() {
        let members = group("add", 2);
        let mut cb = callback(vec![members.clone()]);

        cb.on_complete(&members[0], &output(10)).unwrap();
        let err = cb.on_complete(&members[0], &output(10)).unwrap_err();
        assert!(matches!(err, ContractViolation::DuplicateCompletion { .. }));
    }

    #[test]
    fn test_untracked_orders_are_ignored_once() {
        let members = group("add", 2);
        let mut cb = callback(vec![members]);
        let sentry = order("sentry", None);

        assert!(cb.on_complete(&sentry, &output(1)).unwrap().is_empty());
        assert!(cb.output(&sentry).is_some());
        assert!(cb.on_complete(&sentry, &output(1)).is_err());
    }

    #[test]
    fn test_replicates_never_emit_further_work() {
        let members = group("add", 2);
        let mut cb = callback(vec![members.clone()]);

        cb.on_complete(&members[0], &output(1)).unwrap();
        let follow_up = cb.on_complete(&members[1], &output(2)).unwrap();
        for replicate in &follow_up {
            let timing = WorkerOutput::timing_only(WallTime::new(vec![1e-6]));
            assert!(cb.on_complete(replicate, &timing).unwrap().is_empty());
        }
    }

    #[test]
    fn test_missing_counts_is_contract_violation() {
        let members = group("add", 2);
        let mut cb = callback(vec![members.clone()]);

        let timing = WorkerOutput::timing_only(WallTime::new(vec![1e-6]));
        let err = cb.on_complete(&members[0], &timing).unwrap_err();
        assert!(matches!(
            err,
            ContractViolation::MissingInstructionCounts { .. }
        ));
    }

    #[test]
    fn test_timing_only_groups_are_not_checked() {
        let members: Vec<_> = group("add", 2)
            .iter()
            .map(WorkOrder::without_instructions)
            .collect();
        let mut cb = callback(vec![members.clone()]);

        let timing = WorkerOutput::timing_only(WallTime::new(vec![1e-6]));
        for order in &members {
            assert!(cb.on_complete(order, &timing).unwrap().is_empty());
        }
        assert!(cb.observed_counts(GroupId(0)).is_none());
    }

    #[test]
    fn test_custom_replicate_count() {
        let members = group("add", 2);
        let table = ComparisonTable::from_groups(vec![members.clone()]).unwrap();
        let mut cb =
            ConvergenceCallback::with_policy(table, ConvergencePolicy { replicates: 5 }).unwrap();

        cb.on_complete(&members[0], &output(1)).unwrap();
        assert_eq!(cb.on_complete(&members[1], &output(2)).unwrap().len(), 10);
    }

    #[test]
    fn test_zero_replicates_rejected() {
        let table = ComparisonTable::from_groups(vec![group("add", 2)]).unwrap();
        let err = ConvergenceCallback::with_policy(table, ConvergencePolicy { replicates: 0 })
            .unwrap_err();
        assert!(matches!(err, ContractViolation::InvalidPolicy(_)));
    }

    #[test]
    fn test_table_rejects_mismatched_lengths() {
        let err = ComparisonTable::from_groups(vec![group("add", 2), group("mul", 3)]).unwrap_err();
        assert_eq!(
            err,
            ContractViolation::MismatchedGroupSize {
                group: 1,
                expected: 2,
                got: 3
            }
        );
    }

    #[test]
    fn test_table_rejects_misaligned_group() {
        let err = ComparisonTable::from_groups(vec![vec![
            order("add", Some("a")),
            order("mul", Some("b")),
        ]])
        .unwrap_err();
        assert!(matches!(err, ContractViolation::MisalignedGroup { group: 0, .. }));
    }

    #[test]
    fn test_table_rejects_repeated_order() {
        let add = order("add", None);
        let err = ComparisonTable::from_groups(vec![vec![add.clone(), add]]).unwrap_err();
        assert!(matches!(err, ContractViolation::DuplicateTrackedOrder { .. }));
    }

    #[test]
    fn test_table_requires_environments() {
        assert_eq!(
            ComparisonTable::from_groups(vec![Vec::new()]).unwrap_err(),
            ContractViolation::NoEnvironments
        );
        assert_eq!(
            ComparisonTable::with_environments(0, Vec::new()).unwrap_err(),
            ContractViolation::NoEnvironments
        );
        let empty = ComparisonTable::with_environments(2, Vec::new()).unwrap();
        assert_eq!(empty.environment_count(), 2);
        assert_eq!(empty.group_count(), 0);
    }

    #[test]
    fn test_table_lookup() {
        let add = group("add", 2);
        let mul = group("mul", 2);
        let table = ComparisonTable::from_groups(vec![add.clone(), mul.clone()]).unwrap();

        assert_eq!(table.get(GroupId(1), 0), Some(&mul[0]));
        assert_eq!(table.position(&add[1]), Some((GroupId(0), 1)));
        let env1: Vec<_> = table.environment(1).collect();
        assert_eq!(env1, vec![&add[1], &mul[1]]);
        assert_eq!(table.orders().count(), 4);
    }
}
