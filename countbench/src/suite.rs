//! Benchmark Suites
//!
//! A suite is the pre-declared list of snippets to measure. countbench never
//! decides which benchmarks exist; it only expands what the suite hands over.

use countbench_core::{Label, Mode, TimerArgs};
use std::fmt;

/// One logical benchmark
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkDef {
    /// Hierarchical name
    pub label: Label,
    /// Execution strategy
    pub mode: Mode,
    /// Snippet and collection parameters
    pub timer_args: TimerArgs,
}

impl BenchmarkDef {
    /// Create a definition
    pub fn new(label: Label, mode: Mode, timer_args: TimerArgs) -> Self {
        Self {
            label,
            mode,
            timer_args,
        }
    }
}

/// Which list of a suite to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuiteSelector {
    /// The curated suite
    #[default]
    Standard,
    /// Ad hoc definitions under active investigation
    AdHoc,
}

impl fmt::Display for SuiteSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuiteSelector::Standard => f.write_str("standard"),
            SuiteSelector::AdHoc => f.write_str("ad-hoc"),
        }
    }
}

/// Source of benchmark definitions
pub trait Suite {
    /// Definitions for `selector`, in the order they should be reported
    fn benchmarks(&self, selector: SuiteSelector) -> Vec<BenchmarkDef>;
}

/// Suite backed by two fixed lists
#[derive(Debug, Clone, Default)]
pub struct StaticSuite {
    standard: Vec<BenchmarkDef>,
    ad_hoc: Vec<BenchmarkDef>,
}

impl StaticSuite {
    /// Create an empty suite
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the standard list
    pub fn standard(mut self, def: BenchmarkDef) -> Self {
        self.standard.push(def);
        self
    }

    /// Append to the ad hoc list
    pub fn ad_hoc(mut self, def: BenchmarkDef) -> Self {
        self.ad_hoc.push(def);
        self
    }
}

impl Suite for StaticSuite {
    fn benchmarks(&self, selector: SuiteSelector) -> Vec<BenchmarkDef> {
        match selector {
            SuiteSelector::Standard => self.standard.clone(),
            SuiteSelector::AdHoc => self.ad_hoc.clone(),
        }
    }
}

impl<S: Suite + ?Sized> Suite for &S {
    fn benchmarks(&self, selector: SuiteSelector) -> Vec<BenchmarkDef> {
        (**self).benchmarks(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use countbench_core::Language;

    fn def(name: &str) -> BenchmarkDef {
        BenchmarkDef::new(
            Label::new(["Math", name]),
            Mode::Native,
            TimerArgs::new(format!("{}(x)", name), Language::Native),
        )
    }

    #[test]
    fn test_static_suite_selects_list() {
        let suite = StaticSuite::new()
            .standard(def("add"))
            .standard(def("mul"))
            .ad_hoc(def("div"));

        let standard = suite.benchmarks(SuiteSelector::Standard);
        assert_eq!(standard.len(), 2);
        assert_eq!(standard[0].label.to_string(), "Math/add");
        assert_eq!(standard[1].label.to_string(), "Math/mul");

        let ad_hoc = suite.benchmarks(SuiteSelector::AdHoc);
        assert_eq!(ad_hoc.len(), 1);
        assert_eq!(ad_hoc[0].label.to_string(), "Math/div");
    }
}
