// Types and enums for the automation loop
use super::error::{AutomationError, AutomationResult};
use crate::template_matching::{Frame, ReferenceImage};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
}

/// Settings fixed for the lifetime of one run.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    interval: Duration,
    threshold: f32,
    reference: ReferenceImage,
}

impl LoopConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);
    pub const DEFAULT_THRESHOLD: f32 = 0.8;

    pub fn new(reference: ReferenceImage) -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            threshold: Self::DEFAULT_THRESHOLD,
            reference,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Interval must be non-zero and threshold within (0.0, 1.0].
    pub fn validate(&self) -> AutomationResult<()> {
        if self.interval.is_zero() {
            return Err(AutomationError::InvalidConfig {
                reason: "polling interval must be greater than zero".to_string(),
            });
        }
        // Written so that NaN fails too
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(AutomationError::InvalidConfig {
                reason: format!(
                    "confidence threshold must be within (0.0, 1.0], got {}",
                    self.threshold
                ),
            });
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn reference(&self) -> &ReferenceImage {
        &self.reference
    }
}

/// Result of asking a [`FrameProvider`](super::FrameProvider) for a frame.
#[derive(Debug, Clone)]
pub enum FrameOutcome {
    Ready(Frame),
    /// Nothing to match this cycle (capture not ready, transient failure)
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchOutcome {
    Completed,
    Cancelled,
}

/// What one cycle ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    FrameUnavailable,
    MatchFailed {
        reason: String,
    },
    NoMatch {
        confidence: f32,
    },
    Dispatched {
        x: f32,
        y: f32,
        confidence: f32,
        outcome: DispatchOutcome,
    },
    DispatchFailed {
        x: f32,
        y: f32,
        reason: String,
    },
    /// Shutdown was observed between two steps of the cycle
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    /// 1-based within one run
    pub index: u64,
    pub started_at: Instant,
    pub elapsed: Duration,
    pub outcome: CycleOutcome,
}

/// Per-run counters, reset on every start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub cycles: u64,
    pub frames_unavailable: u64,
    pub match_failures: u64,
    pub misses: u64,
    pub dispatched: u64,
    pub dispatch_cancelled: u64,
    pub dispatch_failures: u64,
    pub interrupted: u64,
}

impl LoopStats {
    pub fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::FrameUnavailable => self.frames_unavailable += 1,
            CycleOutcome::MatchFailed { .. } => self.match_failures += 1,
            CycleOutcome::NoMatch { .. } => self.misses += 1,
            CycleOutcome::Dispatched {
                outcome: DispatchOutcome::Completed,
                ..
            } => self.dispatched += 1,
            CycleOutcome::Dispatched {
                outcome: DispatchOutcome::Cancelled,
                ..
            } => self.dispatch_cancelled += 1,
            CycleOutcome::DispatchFailed { .. } => self.dispatch_failures += 1,
            CycleOutcome::Interrupted => self.interrupted += 1,
        }
    }
}
