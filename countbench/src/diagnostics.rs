//! Structured Diagnostics
//!
//! Non-fatal findings of a collection. They are returned to the caller rather
//! than printed, so the harness and renderers decide how to present them.

use countbench_core::Label;
use serde::Serialize;
use std::fmt;
use tracing::warn;

/// One finding, tagged with the environment(s) it concerns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Which environments the finding concerns
    pub scope: DiagnosticScope,
    /// What was found
    pub kind: DiagnosticKind,
}

/// Environments a diagnostic concerns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "source_cmd", rename_all = "snake_case")]
pub enum DiagnosticScope {
    /// A single environment; `None` is the ambient environment
    Environment(Option<String>),
    /// Every environment of the collection
    AllEnvironments,
}

impl DiagnosticScope {
    /// Scope of a single environment
    pub fn environment(source_cmd: Option<&str>) -> Self {
        DiagnosticScope::Environment(source_cmd.map(str::to_string))
    }
}

impl fmt::Display for DiagnosticScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticScope::Environment(source_cmd) => {
                f.write_str(environment_name(source_cmd.as_deref()))
            }
            DiagnosticScope::AllEnvironments => f.write_str("<all environments>"),
        }
    }
}

/// Kinds of findings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Sentry runs reported differing raw counts
    UnstableEnvironment {
        /// Raw counts of the sentry runs
        counts: Vec<u64>,
    },
    /// Sentry runs could not all be evaluated
    SentryIncomplete {
        /// Why
        reason: String,
    },
    /// A benchmark's denoised counts differed across environments
    CountDisagreement {
        /// Benchmark
        label: Label,
        /// Denoised counts, in environment order
        counts: Vec<u64>,
    },
    /// A work order exhausted its attempt budget
    PermanentFailure {
        /// Benchmark
        label: Label,
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        error: String,
    },
}

impl Diagnostic {
    /// Diagnostic about a single environment
    pub fn new(source_cmd: Option<&str>, kind: DiagnosticKind) -> Self {
        Self {
            scope: DiagnosticScope::environment(source_cmd),
            kind,
        }
    }

    /// Diagnostic comparing all environments
    pub fn across_environments(kind: DiagnosticKind) -> Self {
        Self {
            scope: DiagnosticScope::AllEnvironments,
            kind,
        }
    }

    /// Emit through `tracing` at warn level
    pub fn log(&self) {
        warn!(environment = %self.scope, "{}", self.kind);
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scope, self.kind)
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::UnstableEnvironment { counts } => write!(
                f,
                "measurement environment is not deterministic: sentry counts {:?}",
                counts
            ),
            DiagnosticKind::SentryIncomplete { reason } => {
                write!(f, "stability sentry incomplete: {}", reason)
            }
            DiagnosticKind::CountDisagreement { label, counts } => write!(
                f,
                "{}: instruction counts disagree across environments {:?}",
                label, counts
            ),
            DiagnosticKind::PermanentFailure {
                label,
                attempts,
                error,
            } => write!(f, "{}: failed after {} attempt(s): {}", label, attempts, error),
        }
    }
}

/// Display name of an environment
pub fn environment_name(source_cmd: Option<&str>) -> &str {
    source_cmd.unwrap_or("<current environment>")
}
