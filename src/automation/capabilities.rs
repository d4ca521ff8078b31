// Capabilities the loop is handed at start: where frames come from and
// where pointer actions go.
use super::error::AutomationResult;
use super::types::{DispatchOutcome, FrameOutcome};
use std::future::Future;
use std::sync::Arc;

/// Source of screen frames.
///
/// "No frame yet" is a normal [`FrameOutcome::Unavailable`], never an error.
/// Implementations should return within a bounded time.
pub trait FrameProvider: Send + Sync + 'static {
    fn try_get_frame(&self) -> impl Future<Output = FrameOutcome> + Send;
}

/// Performs one pointer action at frame coordinates.
///
/// `Ok(Cancelled)` means the platform dropped the action; `Err` means it could
/// not be delivered at all. The loop never retries within a cycle.
pub trait ActionDispatcher: Send + Sync + 'static {
    fn dispatch(
        &self,
        x: f32,
        y: f32,
    ) -> impl Future<Output = AutomationResult<DispatchOutcome>> + Send;
}

impl<T: FrameProvider> FrameProvider for Arc<T> {
    fn try_get_frame(&self) -> impl Future<Output = FrameOutcome> + Send {
        (**self).try_get_frame()
    }
}

impl<T: ActionDispatcher> ActionDispatcher for Arc<T> {
    fn dispatch(
        &self,
        x: f32,
        y: f32,
    ) -> impl Future<Output = AutomationResult<DispatchOutcome>> + Send {
        (**self).dispatch(x, y)
    }
}
