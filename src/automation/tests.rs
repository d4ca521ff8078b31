// Tests for the automation loop
// Focus: state machine, cycle outcomes, cadence, cancellation, resource release

use super::*;
use crate::template_matching::{Frame, ReferenceImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};

// ============================================================
// FAKE COLLABORATORS
// ============================================================

/// Plays back a script of outcomes, then reports `Unavailable` forever.
struct ScriptedFrames {
    script: Mutex<VecDeque<FrameOutcome>>,
    polls: AtomicUsize,
    delay: Duration,
}

impl ScriptedFrames {
    fn new(script: Vec<FrameOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            polls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl FrameProvider for ScriptedFrames {
    async fn try_get_frame(&self) -> FrameOutcome {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FrameOutcome::Unavailable)
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    Complete,
    Cancel,
    Fail,
}

struct RecordingDispatcher {
    calls: Mutex<Vec<(f32, f32)>>,
    behaviour: Behaviour,
    /// When set, each dispatch announces itself and waits to be released
    gate: Option<(mpsc::UnboundedSender<()>, Arc<Notify>)>,
}

impl RecordingDispatcher {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            behaviour,
            gate: None,
        }
    }

    fn gated(entered: mpsc::UnboundedSender<()>, release: Arc<Notify>) -> Self {
        Self {
            gate: Some((entered, release)),
            ..Self::new(Behaviour::Complete)
        }
    }

    fn calls(&self) -> Vec<(f32, f32)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ActionDispatcher for RecordingDispatcher {
    async fn dispatch(&self, x: f32, y: f32) -> AutomationResult<DispatchOutcome> {
        self.calls.lock().unwrap().push((x, y));
        if let Some((entered, release)) = &self.gate {
            let _ = entered.send(());
            release.notified().await;
        }
        match self.behaviour {
            Behaviour::Complete => Ok(DispatchOutcome::Completed),
            Behaviour::Cancel => Ok(DispatchOutcome::Cancelled),
            Behaviour::Fail => Err(AutomationError::DispatchFailed {
                x,
                y,
                reason: "injected failure".to_string(),
            }),
        }
    }
}

// ============================================================
// HELPERS
// ============================================================

fn solid_rgba(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    rgba.repeat((width * height) as usize)
}

/// 100x100 dark frame with a 10x10 red patch at (40, 40).
fn patch_frame() -> Frame {
    let mut samples = solid_rgba(100, 100, [30, 30, 30, 255]);
    for y in 40..50 {
        for x in 40..50 {
            let i = (y * 100 + x) * 4;
            samples[i..i + 4].copy_from_slice(&[200, 40, 40, 255]);
        }
    }
    Frame::new(100, 100, 4, samples).unwrap()
}

fn patch_template() -> ReferenceImage {
    ReferenceImage::new(10, 10, 4, solid_rgba(10, 10, [200, 40, 40, 255])).unwrap()
}

fn config(interval_ms: u64) -> LoopConfig {
    LoopConfig::new(patch_template()).with_interval(Duration::from_millis(interval_ms))
}

async fn next_report(rx: &mut broadcast::Receiver<CycleReport>) -> CycleReport {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for a cycle report")
        .expect("Cycle report channel closed")
}

// ============================================================
// CONFIGURATION TESTS
// ============================================================

#[test]
fn test_config_defaults() {
    let config = LoopConfig::new(patch_template());

    assert_eq!(config.interval(), Duration::from_millis(1000));
    assert_eq!(config.threshold(), 0.8);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_rejects_zero_interval() {
    let config = LoopConfig::new(patch_template()).with_interval(Duration::ZERO);
    assert!(matches!(
        config.validate(),
        Err(AutomationError::InvalidConfig { .. })
    ));
}

#[test]
fn test_config_threshold_range() {
    for bad in [0.0, -0.5, 1.01, f32::NAN] {
        let config = LoopConfig::new(patch_template()).with_threshold(bad);
        assert!(
            matches!(config.validate(), Err(AutomationError::InvalidConfig { .. })),
            "threshold {bad} should be rejected"
        );
    }
    for good in [0.01, 0.5, 1.0] {
        let config = LoopConfig::new(patch_template()).with_threshold(good);
        assert!(config.validate().is_ok(), "threshold {good} should be accepted");
    }
}

#[test]
fn test_stats_record_outcomes() {
    let mut stats = LoopStats::default();
    stats.record(&CycleOutcome::FrameUnavailable);
    stats.record(&CycleOutcome::NoMatch { confidence: 0.2 });
    stats.record(&CycleOutcome::Dispatched {
        x: 1.0,
        y: 2.0,
        confidence: 0.9,
        outcome: DispatchOutcome::Cancelled,
    });
    stats.record(&CycleOutcome::Interrupted);

    assert_eq!(stats.cycles, 4);
    assert_eq!(stats.frames_unavailable, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.dispatch_cancelled, 1);
    assert_eq!(stats.dispatched, 0);
    assert_eq!(stats.interrupted, 1);
}

// ============================================================
// STATE MACHINE TESTS
// ============================================================

#[tokio::test]
async fn test_stop_when_idle_is_noop() {
    let automation = AutomationLoop::new();

    automation.stop().await;
    assert_eq!(automation.state(), LoopState::Idle);
    automation.stop().await;
    assert_eq!(automation.state(), LoopState::Idle);
    assert!(!automation.is_running());
}

#[tokio::test]
async fn test_stop_twice_after_run() {
    let automation = AutomationLoop::new();
    automation
        .start(
            config(10),
            ScriptedFrames::new(Vec::new()),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();
    assert!(automation.is_running());

    automation.stop().await;
    assert_eq!(automation.state(), LoopState::Idle);
    automation.stop().await;
    assert_eq!(automation.state(), LoopState::Idle);
}

#[tokio::test]
async fn test_start_while_running_fails_without_disturbing_run() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();
    automation
        .start(
            config(10),
            ScriptedFrames::new(Vec::new()),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();
    let first = next_report(&mut reports).await;

    let err = automation
        .start(
            config(10),
            ScriptedFrames::new(Vec::new()),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        AutomationError::AlreadyRunning {
            state: LoopState::Running
        }
    ));

    // The original run keeps cycling
    assert!(automation.is_running());
    let later = next_report(&mut reports).await;
    assert!(later.index > first.index);

    automation.stop().await;
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let automation = AutomationLoop::new();
    let err = automation
        .start(
            config(10).with_threshold(0.0),
            ScriptedFrames::new(Vec::new()),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap_err();

    assert!(matches!(err, AutomationError::InvalidConfig { .. }));
    assert_eq!(automation.state(), LoopState::Idle);
}

#[tokio::test]
async fn test_restart_resets_stats() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();

    automation
        .start(
            config(10),
            ScriptedFrames::new(Vec::new()),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();
    next_report(&mut reports).await;
    next_report(&mut reports).await;
    automation.stop().await;
    assert!(automation.stats().cycles >= 2);

    let mut reports = automation.subscribe_cycles();
    automation
        .start(
            config(10_000),
            ScriptedFrames::new(Vec::new()),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();
    let first = next_report(&mut reports).await;
    assert_eq!(first.index, 1);
    assert_eq!(automation.stats().cycles, 1);
    automation.stop().await;
}

#[tokio::test]
async fn test_state_transitions_are_published() {
    let automation = AutomationLoop::new();
    let mut state_rx = automation.subscribe_state();
    assert_eq!(*state_rx.borrow_and_update(), LoopState::Idle);

    automation
        .start(
            config(10),
            ScriptedFrames::new(Vec::new()),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();
    assert_eq!(*state_rx.borrow_and_update(), LoopState::Running);

    automation.stop().await;
    assert_eq!(*state_rx.borrow_and_update(), LoopState::Idle);
}

// ============================================================
// CYCLE BEHAVIOUR TESTS
// ============================================================

#[tokio::test]
async fn test_alternating_availability_dispatches_only_on_frames() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();
    let frames = Arc::new(ScriptedFrames::new(vec![
        FrameOutcome::Unavailable,
        FrameOutcome::Ready(patch_frame()),
        FrameOutcome::Unavailable,
        FrameOutcome::Ready(patch_frame()),
    ]));
    let dispatcher = Arc::new(RecordingDispatcher::new(Behaviour::Complete));

    automation
        .start(config(10), Arc::clone(&frames), Arc::clone(&dispatcher))
        .unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(next_report(&mut reports).await.outcome);
    }
    automation.stop().await;

    assert_eq!(outcomes[0], CycleOutcome::FrameUnavailable);
    assert!(matches!(
        outcomes[1],
        CycleOutcome::Dispatched {
            x,
            y,
            outcome: DispatchOutcome::Completed,
            ..
        } if x == 45.0 && y == 45.0
    ));
    assert_eq!(outcomes[2], CycleOutcome::FrameUnavailable);
    assert!(matches!(outcomes[3], CycleOutcome::Dispatched { .. }));

    assert_eq!(dispatcher.calls(), vec![(45.0, 45.0), (45.0, 45.0)]);
    assert!(frames.polls() >= 4);
    assert_eq!(automation.state(), LoopState::Idle);
}

#[tokio::test]
async fn test_below_threshold_does_not_dispatch() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();
    let absent = ReferenceImage::new(10, 10, 4, solid_rgba(10, 10, [0, 200, 0, 255])).unwrap();
    let dispatcher = Arc::new(RecordingDispatcher::new(Behaviour::Complete));

    automation
        .start(
            LoopConfig::new(absent).with_interval(Duration::from_millis(10)),
            ScriptedFrames::new(vec![FrameOutcome::Ready(patch_frame())]),
            Arc::clone(&dispatcher),
        )
        .unwrap();
    let report = next_report(&mut reports).await;
    automation.stop().await;

    match report.outcome {
        CycleOutcome::NoMatch { confidence } => assert!(confidence < 0.8),
        other => panic!("Expected NoMatch, got {other:?}"),
    }
    assert!(dispatcher.calls().is_empty());
}

#[tokio::test]
async fn test_match_error_skips_cycle_and_keeps_running() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();
    let small = Frame::new(5, 5, 1, vec![0; 25]).unwrap();

    automation
        .start(
            config(10),
            ScriptedFrames::new(vec![
                FrameOutcome::Ready(small.clone()),
                FrameOutcome::Ready(small),
            ]),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();

    for _ in 0..2 {
        let report = next_report(&mut reports).await;
        assert!(matches!(report.outcome, CycleOutcome::MatchFailed { .. }));
    }
    assert!(automation.is_running());
    automation.stop().await;
    assert_eq!(automation.stats().match_failures, 2);
}

#[tokio::test]
async fn test_dispatch_failure_is_not_fatal() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();
    let dispatcher = Arc::new(RecordingDispatcher::new(Behaviour::Fail));

    automation
        .start(
            config(10),
            ScriptedFrames::new(vec![
                FrameOutcome::Ready(patch_frame()),
                FrameOutcome::Ready(patch_frame()),
            ]),
            Arc::clone(&dispatcher),
        )
        .unwrap();

    for _ in 0..2 {
        let report = next_report(&mut reports).await;
        assert!(matches!(report.outcome, CycleOutcome::DispatchFailed { .. }));
    }
    automation.stop().await;

    // One attempt per qualifying cycle, no retries
    assert_eq!(dispatcher.calls().len(), 2);
    assert_eq!(automation.stats().dispatch_failures, 2);
}

#[tokio::test]
async fn test_cancelled_dispatch_is_reported() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();

    automation
        .start(
            config(10),
            ScriptedFrames::new(vec![FrameOutcome::Ready(patch_frame())]),
            RecordingDispatcher::new(Behaviour::Cancel),
        )
        .unwrap();
    let report = next_report(&mut reports).await;
    automation.stop().await;

    assert!(matches!(
        report.outcome,
        CycleOutcome::Dispatched {
            outcome: DispatchOutcome::Cancelled,
            ..
        }
    ));
    assert_eq!(automation.stats().dispatch_cancelled, 1);
}

// ============================================================
// CADENCE TESTS
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_slow_cycle_does_not_stack_delay() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();

    automation
        .start(
            config(1000),
            ScriptedFrames::new(Vec::new()).with_delay(Duration::from_millis(300)),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();

    let mut starts = Vec::new();
    for _ in 0..3 {
        let report = next_report(&mut reports).await;
        assert!(report.elapsed >= Duration::from_millis(300));
        starts.push(report.started_at);
    }
    automation.stop().await;

    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(990) && gap <= Duration::from_millis(1010),
            "cycle starts {gap:?} apart, expected ~1000ms"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_overlong_cycle_starts_next_immediately() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();

    automation
        .start(
            config(1000),
            ScriptedFrames::new(Vec::new()).with_delay(Duration::from_millis(1500)),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();

    let first = next_report(&mut reports).await;
    let second = next_report(&mut reports).await;
    automation.stop().await;

    let gap = second.started_at - first.started_at;
    assert!(gap >= Duration::from_millis(1500) && gap <= Duration::from_millis(1510));
}

// ============================================================
// CANCELLATION TESTS
// ============================================================

#[tokio::test]
async fn test_stop_interrupts_inter_cycle_sleep() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();

    automation
        .start(
            config(60_000),
            ScriptedFrames::new(Vec::new()),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();
    next_report(&mut reports).await;

    let stopped = tokio::time::timeout(Duration::from_secs(1), automation.stop()).await;
    assert!(stopped.is_ok(), "stop() should not wait out the interval");
    assert_eq!(automation.state(), LoopState::Idle);
}

#[tokio::test]
async fn test_stop_waits_for_inflight_dispatch() {
    let automation = Arc::new(AutomationLoop::new());
    let mut reports = automation.subscribe_cycles();
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let frames = Arc::new(ScriptedFrames::new(vec![
        FrameOutcome::Ready(patch_frame()),
        FrameOutcome::Ready(patch_frame()),
    ]));

    automation
        .start(
            config(10),
            Arc::clone(&frames),
            RecordingDispatcher::gated(entered_tx, Arc::clone(&release)),
        )
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), entered_rx.recv())
        .await
        .expect("Dispatch never started");

    let stopper = {
        let automation = Arc::clone(&automation);
        tokio::spawn(async move { automation.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(automation.state(), LoopState::Stopping);
    assert!(!stopper.is_finished());

    release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), stopper)
        .await
        .expect("stop() did not finish")
        .unwrap();
    assert_eq!(automation.state(), LoopState::Idle);

    // The in-flight dispatch completed, and nothing was issued afterwards
    let report = next_report(&mut reports).await;
    assert!(matches!(
        report.outcome,
        CycleOutcome::Dispatched {
            outcome: DispatchOutcome::Completed,
            ..
        }
    ));
    let polls = frames.polls();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(frames.polls(), polls);
    assert_eq!(polls, 1);
}

#[tokio::test]
async fn test_stop_releases_capabilities() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();
    let frames = Arc::new(ScriptedFrames::new(Vec::new()));
    let dispatcher = Arc::new(RecordingDispatcher::new(Behaviour::Complete));

    automation
        .start(config(10), Arc::clone(&frames), Arc::clone(&dispatcher))
        .unwrap();
    next_report(&mut reports).await;
    assert_eq!(Arc::strong_count(&frames), 2);

    automation.stop().await;
    assert_eq!(Arc::strong_count(&frames), 1);
    assert_eq!(Arc::strong_count(&dispatcher), 1);
}

#[tokio::test]
async fn test_concurrent_stops_all_reach_idle() {
    let automation = Arc::new(AutomationLoop::new());
    let mut reports = automation.subscribe_cycles();
    automation
        .start(
            config(10),
            ScriptedFrames::new(Vec::new()).with_delay(Duration::from_millis(20)),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();
    next_report(&mut reports).await;

    let stops: Vec<_> = (0..3)
        .map(|_| {
            let automation = Arc::clone(&automation);
            tokio::spawn(async move { automation.stop().await })
        })
        .collect();
    for stop in stops {
        tokio::time::timeout(Duration::from_secs(5), stop)
            .await
            .expect("stop() hung")
            .unwrap();
    }
    assert_eq!(automation.state(), LoopState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_returns_when_loop_is_restarted_immediately() {
    let automation = Arc::new(AutomationLoop::new());
    automation
        .start(
            config(10),
            ScriptedFrames::new(Vec::new()),
            RecordingDispatcher::new(Behaviour::Complete),
        )
        .unwrap();

    // Starts a second run the moment the first one reports Idle
    let restarter = {
        let automation = Arc::clone(&automation);
        let mut state_rx = automation.subscribe_state();
        tokio::spawn(async move {
            state_rx
                .wait_for(|state| *state == LoopState::Idle)
                .await
                .map(|_| ())
                .unwrap();
            automation.start(
                config(10),
                ScriptedFrames::new(Vec::new()),
                RecordingDispatcher::new(Behaviour::Complete),
            )
        })
    };

    let stops: Vec<_> = (0..2)
        .map(|_| {
            let automation = Arc::clone(&automation);
            tokio::spawn(async move { automation.stop().await })
        })
        .collect();
    for stop in stops {
        tokio::time::timeout(Duration::from_secs(2), stop)
            .await
            .expect("stop() hung after the loop was restarted")
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(2), restarter)
        .await
        .expect("Restart never happened")
        .unwrap()
        .unwrap();

    automation.stop().await;
    assert_eq!(automation.state(), LoopState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_frame_request_skips_dispatch() {
    let automation = AutomationLoop::new();
    let mut reports = automation.subscribe_cycles();
    let frames = Arc::new(
        ScriptedFrames::new(vec![FrameOutcome::Ready(patch_frame())])
            .with_delay(Duration::from_millis(500)),
    );
    let dispatcher = Arc::new(RecordingDispatcher::new(Behaviour::Complete));

    automation
        .start(config(1000), Arc::clone(&frames), Arc::clone(&dispatcher))
        .unwrap();
    while frames.polls() == 0 {
        tokio::task::yield_now().await;
    }

    // The provider is still sleeping; the matching frame it returns must not be acted on
    automation.stop().await;

    let report = reports.try_recv().unwrap();
    assert_eq!(report.outcome, CycleOutcome::Interrupted);
    assert!(reports.try_recv().is_err());
    assert!(dispatcher.calls().is_empty());
    assert_eq!(automation.stats().interrupted, 1);
    assert_eq!(automation.stats().cycles, 1);
    assert_eq!(automation.state(), LoopState::Idle);
}
