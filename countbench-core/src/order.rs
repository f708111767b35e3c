//! Work Orders
//!
//! A `WorkOrder` describes what to run (`TimerArgs`), how (`Mode`), where
//! (`source_cmd`) and with what budget (`timeout`, `retries`).
//!
//! Orders are compared by identity: every constructed order receives a fresh
//! `WorkOrderId`, so two orders with identical fields are still distinct.
//! Cloning an order yields another handle to the same order.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_WORK_ORDER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a work order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkOrderId(u64);

impl WorkOrderId {
    fn next() -> Self {
        Self(NEXT_WORK_ORDER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value (stable for the lifetime of the process)
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hierarchical benchmark name, e.g. `["Pointwise", "Math", "add"]`
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[archive(check_bytes)]
#[serde(transparent)]
pub struct Label(Vec<String>);

impl Label {
    /// Build a label from its parts
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Label components, outermost first
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Append a component, returning the extended label
    pub fn child(&self, part: impl Into<String>) -> Self {
        let mut parts = self.0.clone();
        parts.push(part.into());
        Self(parts)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl<S: Into<String>> FromIterator<S> for Label {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// Language a snippet is written in
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "kebab-case")]
pub enum Language {
    /// Interpreted host language
    Interpreted,
    /// Compiled native code
    Native,
}

/// Execution strategy for a snippet
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Interpreted snippet
    Interpreted,
    /// Native snippet
    Native,
    /// Interpreted snippet driving a scripted (pre-compiled) model
    InterpretedScripted,
    /// Native snippet driving a scripted (pre-compiled) model
    NativeScripted,
    /// Hand-written interpreted snippet, no translation
    ExplicitInterpreted,
    /// Hand-written native snippet, no translation. The most deterministic mode.
    ExplicitNative,
}

impl Mode {
    /// Language the backend must execute this mode in
    pub fn language(self) -> Language {
        match self {
            Mode::Interpreted | Mode::InterpretedScripted | Mode::ExplicitInterpreted => {
                Language::Interpreted
            }
            Mode::Native | Mode::NativeScripted | Mode::ExplicitNative => Language::Native,
        }
    }

    /// Short display name
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Interpreted => "Interpreted",
            Mode::Native => "Native",
            Mode::InterpretedScripted => "Interpreted (scripted)",
            Mode::NativeScripted => "Native (scripted)",
            Mode::ExplicitInterpreted => "Explicit (interpreted)",
            Mode::ExplicitNative => "Explicit (native)",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rough cost of one snippet invocation, used by backends to pick iteration counts
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "kebab-case")]
pub enum CostEstimate {
    /// Let the backend decide
    #[default]
    Auto,
    /// Under 10 microseconds
    LessThan10Us,
    /// Under 50 microseconds
    LessThan50Us,
    /// Under 100 microseconds
    LessThan100Us,
    /// Under 250 microseconds
    LessThan250Us,
    /// Under one millisecond
    LessThan1000Us,
    /// Anything slower
    Giant,
}

/// Snippet and collection parameters for one measurement
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[archive(check_bytes)]
pub struct TimerArgs {
    /// Statement being measured
    pub stmt: String,
    /// Per-measurement setup (not measured)
    pub setup: String,
    /// One-time setup shared by all measurements
    pub global_setup: String,
    /// Intra-op thread count
    pub num_threads: u32,
    /// Snippet language
    pub language: Language,
    /// Cost hint
    pub cost: CostEstimate,
    /// Whether the backend should collect instruction counts.
    /// When false only wall time is gathered.
    pub collect_instructions: bool,
}

impl TimerArgs {
    /// Single-threaded args with no setup and instruction collection enabled
    pub fn new(stmt: impl Into<String>, language: Language) -> Self {
        Self {
            stmt: stmt.into(),
            setup: String::new(),
            global_setup: String::new(),
            num_threads: 1,
            language,
            cost: CostEstimate::Auto,
            collect_instructions: true,
        }
    }

    /// Set the per-measurement setup
    pub fn with_setup(mut self, setup: impl Into<String>) -> Self {
        self.setup = setup.into();
        self
    }

    /// Set the one-time global setup
    pub fn with_global_setup(mut self, global_setup: impl Into<String>) -> Self {
        self.global_setup = global_setup.into();
        self
    }

    /// Set the thread count
    pub fn with_num_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the cost hint
    pub fn with_cost(mut self, cost: CostEstimate) -> Self {
        self.cost = cost;
        self
    }

    /// Enable or disable instruction collection
    pub fn with_collect_instructions(mut self, collect: bool) -> Self {
        self.collect_instructions = collect;
        self
    }
}

/// One measurement task.
///
/// Never mutated after construction; use [`WorkOrder::with_timer_args`] to
/// derive a modified copy, which is a new order with a new identity.
#[derive(Debug, Clone)]
pub struct WorkOrder {
    id: WorkOrderId,
    label: Label,
    mode: Mode,
    timer_args: TimerArgs,
    source_cmd: Option<String>,
    timeout: Duration,
    retries: u32,
}

impl WorkOrder {
    /// Start building an order with the default timeout and retry budget
    pub fn builder(label: Label, mode: Mode, timer_args: TimerArgs) -> WorkOrderBuilder {
        WorkOrderBuilder {
            label,
            mode,
            timer_args,
            source_cmd: None,
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECS),
            retries: crate::DEFAULT_RETRIES,
        }
    }

    /// Identity used for all tracking
    pub fn id(&self) -> WorkOrderId {
        self.id
    }

    /// Benchmark label
    pub fn label(&self) -> &Label {
        &self.label
    }

    /// Execution strategy
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Snippet and collection parameters
    pub fn timer_args(&self) -> &TimerArgs {
        &self.timer_args
    }

    /// Environment to measure under; `None` is the ambient environment
    pub fn source_cmd(&self) -> Option<&str> {
        self.source_cmd.as_deref()
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Additional attempts allowed after a failure
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Copy of this order with different timer args and a fresh identity
    pub fn with_timer_args(&self, timer_args: TimerArgs) -> WorkOrder {
        WorkOrder {
            id: WorkOrderId::next(),
            timer_args,
            ..self.clone()
        }
    }

    /// Copy of this order that only gathers wall time
    pub fn without_instructions(&self) -> WorkOrder {
        self.with_timer_args(self.timer_args.clone().with_collect_instructions(false))
    }
}

impl PartialEq for WorkOrder {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WorkOrder {}

impl Hash for WorkOrder {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for WorkOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.id, self.mode, self.label)?;
        if let Some(cmd) = &self.source_cmd {
            write!(f, " @ `{}`", cmd)?;
        }
        Ok(())
    }
}

/// Builder for [`WorkOrder`]
#[derive(Debug, Clone)]
pub struct WorkOrderBuilder {
    label: Label,
    mode: Mode,
    timer_args: TimerArgs,
    source_cmd: Option<String>,
    timeout: Duration,
    retries: u32,
}

impl WorkOrderBuilder {
    /// Environment to measure under
    pub fn source_cmd(mut self, source_cmd: Option<String>) -> Self {
        self.source_cmd = source_cmd;
        self
    }

    /// Per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Additional attempts after a failure
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Finish, assigning a fresh identity
    pub fn build(self) -> WorkOrder {
        WorkOrder {
            id: WorkOrderId::next(),
            label: self.label,
            mode: self.mode,
            timer_args: self.timer_args,
            source_cmd: self.source_cmd,
            timeout: self.timeout,
            retries: self.retries,
        }
    }
}
