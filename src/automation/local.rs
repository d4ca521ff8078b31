//! In-process capabilities: a fixed screenshot as the frame source and a
//! dispatcher that only logs. Used for dry runs and offline tuning of
//! thresholds against saved screenshots.

use super::capabilities::{ActionDispatcher, FrameProvider};
use super::error::AutomationResult;
use super::types::{DispatchOutcome, FrameOutcome};
use crate::template_matching::{Frame, MatchError};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Serves the same decoded image on every poll.
#[derive(Debug, Clone)]
pub struct StillFrameProvider {
    frame: Frame,
}

impl StillFrameProvider {
    pub fn new(frame: Frame) -> Self {
        Self { frame }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, MatchError> {
        Frame::open(path).map(Self::new)
    }
}

impl FrameProvider for StillFrameProvider {
    async fn try_get_frame(&self) -> FrameOutcome {
        FrameOutcome::Ready(self.frame.clone())
    }
}

/// Logs each requested action instead of performing it.
#[derive(Debug, Default)]
pub struct DryRunDispatcher {
    actions: AtomicU64,
}

impl DryRunDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of actions requested so far.
    pub fn actions(&self) -> u64 {
        self.actions.load(Ordering::Relaxed)
    }
}

impl ActionDispatcher for DryRunDispatcher {
    async fn dispatch(&self, x: f32, y: f32) -> AutomationResult<DispatchOutcome> {
        let count = self.actions.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!("🧪 Dry run: would tap at ({x:.1}, {y:.1}) [#{count}]");
        Ok(DispatchOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_still_provider_serves_same_frame() {
        let frame = Frame::new(2, 2, 1, vec![1, 2, 3, 4]).unwrap();
        let provider = StillFrameProvider::new(frame.clone());

        for _ in 0..3 {
            match provider.try_get_frame().await {
                FrameOutcome::Ready(got) => assert_eq!(got, frame),
                FrameOutcome::Unavailable => panic!("Expected a frame"),
            }
        }
    }

    #[tokio::test]
    async fn test_dry_run_counts_actions() {
        let dispatcher = DryRunDispatcher::new();

        assert_eq!(
            dispatcher.dispatch(10.0, 20.0).await.unwrap(),
            DispatchOutcome::Completed
        );
        dispatcher.dispatch(1.5, 2.5).await.unwrap();

        assert_eq!(dispatcher.actions(), 2);
    }

    #[test]
    fn test_open_missing_file() {
        let err = StillFrameProvider::open("does-not-exist.png").unwrap_err();
        assert!(matches!(err, MatchError::Decode { .. }));
    }
}
