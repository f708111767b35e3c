//! Worker Outputs
//!
//! What a measurement backend produces for one work order. The core only
//! reads instruction counts (for convergence and sentry checks); wall times are
//! carried through to rendering untouched.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// Instruction counts for one measurement
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
pub struct InstructionCounts {
    /// Count as reported by the instrumentation
    pub raw: u64,
    /// Count with known sources of jitter removed
    pub denoised: u64,
}

impl InstructionCounts {
    /// Create counts from raw and denoised values
    pub fn new(raw: u64, denoised: u64) -> Self {
        Self { raw, denoised }
    }

    /// Counts where no denoising applies
    pub fn exact(count: u64) -> Self {
        Self {
            raw: count,
            denoised: count,
        }
    }

    /// Denoised or raw count
    #[inline]
    pub fn counts(&self, denoise: bool) -> u64 {
        if denoise { self.denoised } else { self.raw }
    }
}

/// Wall-time samples in seconds
#[derive(
    Debug, Clone, PartialEq, Default, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[serde(transparent)]
pub struct WallTime {
    samples: Vec<f64>,
}

impl WallTime {
    /// Wrap samples (seconds per invocation)
    pub fn new(samples: Vec<f64>) -> Self {
        Self { samples }
    }

    /// Raw samples
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Arithmetic mean, `None` when empty
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Median, `None` when empty
    pub fn median(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }
}

/// Result of executing one work order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct WorkerOutput {
    /// `None` when the order disabled instruction collection
    pub instructions: Option<InstructionCounts>,
    /// Timing samples
    pub wall_time: WallTime,
}

impl WorkerOutput {
    /// Output with both instruction counts and timing
    pub fn new(instructions: InstructionCounts, wall_time: WallTime) -> Self {
        Self {
            instructions: Some(instructions),
            wall_time,
        }
    }

    /// Timing-only output
    pub fn timing_only(wall_time: WallTime) -> Self {
        Self {
            instructions: None,
            wall_time,
        }
    }

    /// Instruction count, if collected
    pub fn counts(&self, denoise: bool) -> Option<u64> {
        self.instructions.map(|i| i.counts(denoise))
    }
}
