// Automation loop module
// Periodically captures a frame, searches it for the reference image and
// performs a pointer action at the best match.

pub mod automation_loop;
pub mod capabilities;
pub mod error;
pub mod local;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export the main types for easy access
pub use automation_loop::AutomationLoop;
pub use capabilities::{ActionDispatcher, FrameProvider};
pub use error::{AutomationError, AutomationResult};
pub use local::{DryRunDispatcher, StillFrameProvider};
pub use types::{
    CycleOutcome, CycleReport, DispatchOutcome, FrameOutcome, LoopConfig, LoopState, LoopStats,
};
