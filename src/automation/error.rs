use super::types::LoopState;
use crate::template_matching::MatchError;
use thiserror::Error;

/// A specialized `Result` type for automation loop operations.
pub type AutomationResult<T> = Result<T, AutomationError>;

/// The error type for the capture → match → act loop.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Automation loop is already running (state: {state:?})")]
    AlreadyRunning { state: LoopState },

    #[error("Invalid loop configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Action dispatch at ({x:.1}, {y:.1}) failed: {reason}")]
    DispatchFailed { x: f32, y: f32, reason: String },

    #[error("Template matching failed: {source}")]
    Match {
        #[from]
        source: MatchError,
    },

    #[error("Matching task failed to complete: {source}")]
    JoinError {
        #[from]
        source: tokio::task::JoinError,
    },
}
