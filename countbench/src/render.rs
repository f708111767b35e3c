//! Rendering Seam
//!
//! A renderer receives exactly two environments' result sequences, aligned by
//! row, plus the diagnostics of the collection. Only JSON ships here;
//! human-facing tables are left to other [`Renderer`] implementations.

use crate::assemble::{EnvironmentResults, RowValue};
use crate::diagnostics::Diagnostic;
use chrono::{DateTime, Utc};
use countbench_core::{Label, Mode};
use serde::Serialize;
use thiserror::Error;

/// Errors from rendering
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Result sequences are not aligned: {a} row(s) vs {b} row(s)")]
    Misaligned { a: usize, b: usize },
}

/// Presentation of an A/B comparison
pub trait Renderer {
    /// Render environment `a` against environment `b`
    fn render_ab(
        &self,
        a: &EnvironmentResults,
        b: &EnvironmentResults,
        diagnostics: &[Diagnostic],
    ) -> Result<String, RenderError>;
}

/// Output format for the built-in renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Indented JSON
    #[default]
    Json,
    /// Single-line JSON
    JsonCompact,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" | "json-pretty" => Ok(OutputFormat::Json),
            "json-compact" | "compact" => Ok(OutputFormat::JsonCompact),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}

/// Report metadata
#[derive(Debug, Clone, Serialize)]
pub struct ReportMeta {
    /// Report layout version
    pub schema_version: u32,
    /// countbench version that produced the report
    pub version: String,
    /// When the report was rendered
    pub timestamp: DateTime<Utc>,
}

/// One benchmark compared across both environments
#[derive(Debug, Clone, Serialize)]
pub struct AbPair {
    /// Benchmark
    pub label: Label,
    /// Intra-op thread count
    pub num_threads: u32,
    /// Execution strategy
    pub mode: Mode,
    /// Denoised count in environment A
    pub a_instructions: Option<u64>,
    /// Denoised count in environment B
    pub b_instructions: Option<u64>,
    /// `b - a` saturated to the `i64` range, when both counts exist
    pub delta_instructions: Option<i64>,
    /// Whether both rows were measured and their counts agreed
    pub stable: bool,
}

/// `b - a` without wrapping counts above `i64::MAX`
fn count_delta(a: u64, b: u64) -> i64 {
    if b >= a {
        i64::try_from(b - a).unwrap_or(i64::MAX)
    } else {
        i64::try_from(a - b).map_or(i64::MIN, |d| -d)
    }
}

/// JSON document emitted by [`JsonRenderer`]
#[derive(Debug, Clone, Serialize)]
pub struct AbReport<'a> {
    /// Metadata
    pub meta: ReportMeta,
    /// Row-by-row comparison
    pub pairs: Vec<AbPair>,
    /// Full result sequences
    pub a: &'a EnvironmentResults,
    /// Full result sequences
    pub b: &'a EnvironmentResults,
    /// Findings of the collection
    pub diagnostics: &'a [Diagnostic],
}

impl<'a> AbReport<'a> {
    /// Pair up two aligned sequences
    pub fn new(
        a: &'a EnvironmentResults,
        b: &'a EnvironmentResults,
        diagnostics: &'a [Diagnostic],
    ) -> Result<Self, RenderError> {
        if a.rows.len() != b.rows.len() {
            return Err(RenderError::Misaligned {
                a: a.rows.len(),
                b: b.rows.len(),
            });
        }

        let pairs = a
            .rows
            .iter()
            .zip(&b.rows)
            .map(|(row_a, row_b)| {
                let a_instructions = denoised(&row_a.value);
                let b_instructions = denoised(&row_b.value);
                AbPair {
                    label: row_a.label.clone(),
                    num_threads: row_a.num_threads,
                    mode: row_a.mode,
                    a_instructions,
                    b_instructions,
                    delta_instructions: a_instructions
                        .zip(b_instructions)
                        .map(|(a, b)| count_delta(a, b)),
                    stable: is_stable(&row_a.value) && is_stable(&row_b.value),
                }
            })
            .collect();

        Ok(Self {
            meta: ReportMeta {
                schema_version: 1,
                version: env!("CARGO_PKG_VERSION").to_string(),
                timestamp: Utc::now(),
            },
            pairs,
            a,
            b,
            diagnostics,
        })
    }
}

fn denoised(value: &RowValue) -> Option<u64> {
    match value {
        RowValue::Measured { instructions, .. } => instructions.map(|c| c.denoised),
        RowValue::Missing { .. } => None,
    }
}

fn is_stable(value: &RowValue) -> bool {
    matches!(value, RowValue::Measured { stable: true, .. })
}

/// Renders an [`AbReport`] as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer {
    format: OutputFormat,
}

impl JsonRenderer {
    /// Indented output
    pub fn new() -> Self {
        Self::default()
    }

    /// Renderer for `format`
    pub fn with_format(format: OutputFormat) -> Self {
        Self { format }
    }
}

impl Renderer for JsonRenderer {
    fn render_ab(
        &self,
        a: &EnvironmentResults,
        b: &EnvironmentResults,
        diagnostics: &[Diagnostic],
    ) -> Result<String, RenderError> {
        let report = AbReport::new(a, b, diagnostics)?;
        Ok(match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&report)?,
            OutputFormat::JsonCompact => serde_json::to_string(&report)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::ResultRow;
    use crate::diagnostics::DiagnosticKind;
    use countbench_core::{InstructionCounts, WallTime};

    #[test]
    fn test_count_delta_beyond_i64() {
        assert_eq!(count_delta(100, 90), -10);
        assert_eq!(count_delta(u64::MAX - 5, u64::MAX), 5);
        assert_eq!(count_delta(u64::MAX, u64::MAX - 5), -5);
        assert_eq!(count_delta(0, u64::MAX), i64::MAX);
        assert_eq!(count_delta(u64::MAX, 0), i64::MIN);
        assert_eq!(count_delta(0, i64::MAX as u64), i64::MAX);
        assert_eq!(count_delta(i64::MAX as u64, 0), -i64::MAX);
    }

    fn row(name: &str, count: Option<u64>, stable: bool) -> ResultRow {
        ResultRow {
            label: Label::new(["Math", name]),
            num_threads: 1,
            mode: Mode::Native,
            value: match count {
                Some(count) => RowValue::Measured {
                    instructions: Some(InstructionCounts::exact(count)),
                    wall_times: vec![WallTime::new(vec![1e-6])],
                    stable,
                    replicate_wall_times: Vec::new(),
                },
                None => RowValue::Missing {
                    attempts: 3,
                    reason: "Worker crashed: signal 11".to_string(),
                },
            },
        }
    }

    fn env(source: &str, rows: Vec<ResultRow>) -> EnvironmentResults {
        EnvironmentResults {
            source_cmd: Some(source.to_string()),
            rows,
        }
    }

    #[test]
    fn test_json_report_pairs_rows() {
        let a = env("a", vec![row("add", Some(100), true), row("mul", Some(50), false)]);
        let b = env("b", vec![row("add", Some(90), true), row("mul", None, false)]);
        let diagnostics = vec![Diagnostic::new(
            Some("b"),
            DiagnosticKind::PermanentFailure {
                label: Label::new(["Math", "mul"]),
                attempts: 3,
                error: "Worker crashed: signal 11".to_string(),
            },
        )];

        let text = JsonRenderer::new().render_ab(&a, &b, &diagnostics).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(json["meta"]["schema_version"], 1);
        assert_eq!(json["pairs"][0]["delta_instructions"], -10);
        assert_eq!(json["pairs"][0]["stable"], true);
        assert!(json["pairs"][1]["b_instructions"].is_null());
        assert_eq!(json["pairs"][1]["stable"], false);
        assert_eq!(json["b"]["rows"][1]["value"]["status"], "missing");
        assert_eq!(json["diagnostics"][0]["kind"]["kind"], "permanent_failure");
    }

    #[test]
    fn test_misaligned_sequences_rejected() {
        let a = env("a", vec![row("add", Some(1), true)]);
        let b = env("b", Vec::new());
        let err = JsonRenderer::new().render_ab(&a, &b, &[]).unwrap_err();
        assert!(matches!(err, RenderError::Misaligned { a: 1, b: 0 }));
    }

    #[test]
    fn test_compact_is_single_line() {
        let a = env("a", vec![row("add", Some(1), true)]);
        let b = env("b", vec![row("add", Some(1), true)]);
        let text = JsonRenderer::with_format(OutputFormat::JsonCompact)
            .render_ab(&a, &b, &[])
            .unwrap();
        assert!(!text.contains('\n'));
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!(
            "JSON-Compact".parse::<OutputFormat>(),
            Ok(OutputFormat::JsonCompact)
        );
        assert!("html".parse::<OutputFormat>().is_err());
    }
}
