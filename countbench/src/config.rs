//! Configuration loading from countbench.toml
//!
//! Countbench configuration can be specified in a `countbench.toml` file in the project root.
//! The configuration is automatically discovered by walking up from the current directory.

use crate::collect::Settings;
use crate::convergence::{ConvergencePolicy, DEFAULT_REPLICATES};
use crate::planner::OrderBudget;
use crate::render::OutputFormat;
use countbench_core::{DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECS};
use countbench_runner::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// File name searched for by [`CountbenchConfig::discover`]
pub const CONFIG_FILE: &str = "countbench.toml";

/// Countbench configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CountbenchConfig {
    /// Runner configuration
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Convergence configuration
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    /// Stability sentry configuration
    #[serde(default)]
    pub sentry: SentryConfig,
    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,
}

/// Isolation mode for measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Run each attempt in a separate worker process (default)
    #[default]
    Process,
    /// Run snippets in-process (no isolation, useful for debugging)
    InProcess,
}

impl IsolationMode {
    /// Whether this mode provides process isolation
    pub fn is_isolated(self) -> bool {
        matches!(self, IsolationMode::Process)
    }
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Timeout for a single attempt (e.g., "180s", "3m")
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// Additional attempts after a failed one
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Number of concurrent attempts
    #[serde(default)]
    pub jobs: Option<usize>,
    /// Wait before the first retry (e.g., "0s", "250ms")
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: String,
    /// Growth factor of the wait per further retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single wait
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,
    /// Isolation mode: "process" or "in-process"
    #[serde(default)]
    pub isolation: IsolationMode,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            retries: default_retries(),
            jobs: None,
            retry_backoff: default_retry_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff: default_max_backoff(),
            isolation: IsolationMode::default(),
        }
    }
}

fn default_timeout() -> String {
    format!("{}s", DEFAULT_TIMEOUT_SECS)
}
fn default_retries() -> u32 {
    DEFAULT_RETRIES
}
fn default_retry_backoff() -> String {
    "0s".to_string()
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff() -> String {
    "10s".to_string()
}

/// Convergence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Timing-only replicates per member of a disagreeing group
    #[serde(default = "default_replicates")]
    pub replicates: usize,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            replicates: default_replicates(),
        }
    }
}

fn default_replicates() -> usize {
    DEFAULT_REPLICATES
}

/// Stability sentry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentryConfig {
    /// Run the sentry before the benchmarks
    #[serde(default = "default_sentry_enabled")]
    pub enabled: bool,
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            enabled: default_sentry_enabled(),
        }
    }
}

fn default_sentry_enabled() -> bool {
    true
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Default output format: "json" or "json-compact"
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
        }
    }
}

fn default_format() -> String {
    "json".to_string()
}

impl CountbenchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path).ok();
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# Countbench Configuration

[runner]
# Timeout for a single measurement attempt
timeout = "180s"
# Additional attempts after a failed one
retries = 2
# Number of concurrent attempts (uncomment to enable)
# jobs = 4
# Wait before the first retry; 0s retries immediately
retry_backoff = "0s"
# Growth factor of the wait per further retry
backoff_multiplier = 2.0
# Upper bound on any single wait
max_backoff = "10s"
# Isolation mode: "process" or "in-process"
isolation = "process"

[convergence]
# Timing-only replicates per environment when instruction counts disagree
replicates = 3

[sentry]
# Run the stability sentry before the benchmarks
enabled = true

[output]
# Output format: json, json-compact
format = "json"
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m")
    pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow::anyhow!("Invalid duration: {}", s));
        }

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" | "" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok(Duration::from_nanos((value * multiplier as f64).round() as u64))
    }

    /// Output format named by `[output] format`
    pub fn output_format(&self) -> anyhow::Result<OutputFormat> {
        self.output
            .format
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    /// Collection settings described by this configuration
    pub fn settings(&self) -> anyhow::Result<Settings> {
        Ok(Settings {
            budget: OrderBudget {
                timeout: Self::parse_duration(&self.runner.timeout)?,
                retries: self.runner.retries,
            },
            jobs: self.runner.jobs.unwrap_or(1),
            retry_policy: RetryPolicy {
                initial_backoff: Self::parse_duration(&self.runner.retry_backoff)?,
                multiplier: self.runner.backoff_multiplier,
                max_backoff: Self::parse_duration(&self.runner.max_backoff)?,
            },
            convergence: ConvergencePolicy {
                replicates: self.convergence.replicates,
            },
            sentry: self.sentry.enabled,
            filter: None,
            progress: false,
        })
    }
}
