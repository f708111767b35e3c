//! Countbench Example Harness
//!
//! A toy executor whose "instruction count" is the number of loop iterations a
//! snippet asks for, scaled by `DEMO_SCALE`. Because each environment's
//! `source_cmd` runs before the worker starts, exporting a different scale in
//! one environment shows up as a count disagreement.
//!
//! Run with:
//!   cargo run --example ab -- list
//!   cargo run --example ab -- ab "export DEMO_SCALE=1" "export DEMO_SCALE=1"
//!   cargo run --example ab -- ab "export DEMO_SCALE=1" "export DEMO_SCALE=2"
//!   cargo run --example ab -- --filter '^Loop/' ab "true" "true"

use countbench::{BenchmarkDef, StaticSuite};
use countbench_core::{
    CostEstimate, InstructionCounts, Label, Language, Mode, TimerArgs, WallTime, WorkerOutput,
};
use countbench_runner::{MeasureRequest, SnippetError, SnippetExecutor};
use std::hint::black_box;
use std::time::Instant;

#[derive(Default)]
struct LoopExecutor;

impl SnippetExecutor for LoopExecutor {
    fn execute(&mut self, request: &MeasureRequest) -> Result<WorkerOutput, SnippetError> {
        let parsed = request
            .timer_args
            .stmt
            .strip_prefix("loop ")
            .and_then(|n| n.trim().parse::<u64>().ok());
        // The stability sentry is an element-wise op on 16 elements.
        let iterations = match (parsed, request.mode) {
            (Some(n), _) => n,
            (None, Mode::ExplicitNative) => 16,
            (None, _) => {
                return Err(SnippetError::new(format!(
                    "cannot run {:?}",
                    request.timer_args.stmt
                )));
            }
        };
        let scale: u64 = std::env::var("DEMO_SCALE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let mut samples = Vec::with_capacity(5);
        for _ in 0..5 {
            let start = Instant::now();
            let mut acc = 0u64;
            for i in 0..iterations * scale {
                acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
            }
            black_box(acc);
            samples.push(start.elapsed().as_secs_f64());
        }

        Ok(WorkerOutput::new(
            InstructionCounts::exact(iterations * scale),
            WallTime::new(samples),
        ))
    }
}

fn def(group: &str, name: &str, iterations: u64) -> BenchmarkDef {
    BenchmarkDef::new(
        Label::new([group, name]),
        Mode::Native,
        TimerArgs::new(format!("loop {}", iterations), Language::Native)
            .with_cost(CostEstimate::LessThan50Us),
    )
}

fn main() -> anyhow::Result<()> {
    let suite = StaticSuite::new()
        .standard(def("Loop", "small", 1_000))
        .standard(def("Loop", "medium", 10_000))
        .standard(def("Loop", "large", 100_000))
        .ad_hoc(def("Scratch", "huge", 1_000_000));

    countbench::run(&suite, LoopExecutor)
}
