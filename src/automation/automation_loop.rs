// Capture → match → act loop
use super::capabilities::{ActionDispatcher, FrameProvider};
use super::error::{AutomationError, AutomationResult};
use super::types::{
    CycleOutcome, CycleReport, DispatchOutcome, FrameOutcome, LoopConfig, LoopState, LoopStats,
};
use crate::template_matching::{Frame, MatchResult, TemplateMatcher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};

const CYCLE_REPORT_CAPACITY: usize = 64;

/// Handle to the spawned cycle task of the current run.
struct RunHandle {
    generation: u64,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The live run, if any, and the generation number of the latest run.
#[derive(Default)]
struct RunSlot {
    current: Option<RunHandle>,
    generation: u64,
}

/// Drives periodic capture-match-act cycles.
///
/// At most one run exists per instance and cycles never overlap. The provider
/// and dispatcher passed to [`start`](Self::start) are owned by the run and
/// dropped when it ends.
pub struct AutomationLoop {
    state_tx: Arc<watch::Sender<LoopState>>,
    /// Highest run generation whose teardown has finished
    finished_tx: Arc<watch::Sender<u64>>,
    cycle_tx: broadcast::Sender<CycleReport>,
    stats: Arc<Mutex<LoopStats>>,
    run: Mutex<RunSlot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AutomationLoop {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(LoopState::Idle);
        let (finished_tx, _) = watch::channel(0);
        let (cycle_tx, _) = broadcast::channel(CYCLE_REPORT_CAPACITY);
        Self {
            state_tx: Arc::new(state_tx),
            finished_tx: Arc::new(finished_tx),
            cycle_tx,
            stats: Arc::new(Mutex::new(LoopStats::default())),
            run: Mutex::new(RunSlot::default()),
        }
    }

    /// Begin cycling. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// * [`AutomationError::AlreadyRunning`] unless the loop is `Idle`; the
    ///   existing run is left untouched
    /// * [`AutomationError::InvalidConfig`] if `config` fails validation
    pub fn start<F, A>(&self, config: LoopConfig, frames: F, actions: A) -> AutomationResult<()>
    where
        F: FrameProvider,
        A: ActionDispatcher,
    {
        let mut run = lock(&self.run);
        let state = *self.state_tx.borrow();
        if state != LoopState::Idle {
            return Err(AutomationError::AlreadyRunning { state });
        }
        config.validate()?;

        *lock(&self.stats) = LoopStats::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = CycleRunner {
            matcher: TemplateMatcher::new(),
            config,
            frames,
            actions,
            shutdown: shutdown_rx,
            stats: Arc::clone(&self.stats),
            reports: self.cycle_tx.clone(),
        };

        run.generation += 1;
        self.state_tx.send_replace(LoopState::Running);
        let task = tokio::spawn(runner.run());
        run.current = Some(RunHandle {
            generation: run.generation,
            shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Cancel the run and wait until it has fully ended.
    ///
    /// No-op when already idle; safe to call repeatedly or concurrently, also
    /// with [`start`](Self::start). Once this returns, the run that was live
    /// (or stopping) when it was called issues no further frame requests or
    /// dispatches. A run started afterwards is not affected.
    pub async fn stop(&self) {
        let mut finished_rx = self.finished_tx.subscribe();
        let (target, handle) = {
            let mut run = lock(&self.run);
            let handle = run.current.take();
            if handle.is_some() {
                self.state_tx.send_replace(LoopState::Stopping);
            }
            (run.generation, handle)
        };

        if let Some(RunHandle {
            generation,
            shutdown_tx,
            task,
        }) = handle
        {
            log::info!("⏹️ Stopping automation loop");
            let state_tx = Arc::clone(&self.state_tx);
            let finished_tx = Arc::clone(&self.finished_tx);
            // Teardown runs detached so that dropping this future cannot
            // leave the loop in `Stopping`
            tokio::spawn(async move {
                let _ = shutdown_tx.send(true);
                if let Err(e) = task.await {
                    log::error!("Automation loop task ended abnormally: {e}");
                }
                state_tx.send_replace(LoopState::Idle);
                finished_tx.send_modify(|done| *done = (*done).max(generation));
                log::info!("🛑 Automation loop stopped");
            });
        }

        // Generations only grow, so a restart after this run cannot hide its end
        let _ = finished_rx.wait_for(|done| *done >= target).await;
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn state(&self) -> LoopState {
        *self.state_tx.borrow()
    }

    /// Counters of the current (or last) run.
    pub fn stats(&self) -> LoopStats {
        *lock(&self.stats)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    /// Reports for every cycle completed after this call. Slow receivers
    /// lose the oldest reports; the loop never waits on them.
    pub fn subscribe_cycles(&self) -> broadcast::Receiver<CycleReport> {
        self.cycle_tx.subscribe()
    }
}

impl Default for AutomationLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// State owned by the spawned cycle task.
struct CycleRunner<F, A> {
    matcher: TemplateMatcher,
    config: LoopConfig,
    frames: F,
    actions: A,
    shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<LoopStats>>,
    reports: broadcast::Sender<CycleReport>,
}

impl<F: FrameProvider, A: ActionDispatcher> CycleRunner<F, A> {
    async fn run(mut self) {
        log::info!(
            "🚀 Automation loop started (interval: {}ms, threshold: {:.2}, template: {}x{})",
            self.config.interval().as_millis(),
            self.config.threshold(),
            self.config.reference().width(),
            self.config.reference().height()
        );

        let mut index = 0;
        while !self.is_shutdown() {
            index += 1;
            let started_at = Instant::now();
            let outcome = self.cycle().await;
            let elapsed = started_at.elapsed();
            log::debug!("Cycle {index} finished in {}ms: {outcome:?}", elapsed.as_millis());

            self.record(CycleReport {
                index,
                started_at,
                elapsed,
                outcome,
            });

            let pause = self.config.interval().saturating_sub(elapsed);
            if !self.pause(pause).await {
                break;
            }
        }

        log::info!("🎮 Automation loop ended after {index} cycles");
    }

    /// Shutdown requested, or the loop handle that owned the sender is gone.
    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Sleep unless shutdown arrives first. Returns whether to keep going.
    async fn pause(&mut self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return false;
        }
        let shutdown = &mut self.shutdown;
        tokio::select! {
            _ = sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
        !self.is_shutdown()
    }

    async fn cycle(&mut self) -> CycleOutcome {
        let frame = match self.frames.try_get_frame().await {
            FrameOutcome::Ready(frame) => frame,
            FrameOutcome::Unavailable => {
                log::debug!("👀 No frame available, skipping cycle");
                return CycleOutcome::FrameUnavailable;
            }
        };
        if self.is_shutdown() {
            return CycleOutcome::Interrupted;
        }

        let result = match self.match_frame(frame).await {
            Ok(result) => result,
            Err(e) => {
                log::warn!("⚠️ Matching failed, skipping cycle: {e}");
                return CycleOutcome::MatchFailed {
                    reason: e.to_string(),
                };
            }
        };
        if !result.found {
            log::debug!(
                "👀 No match (best confidence: {:.3} < {:.3})",
                result.confidence,
                self.config.threshold()
            );
            return CycleOutcome::NoMatch {
                confidence: result.confidence,
            };
        }
        if self.is_shutdown() {
            return CycleOutcome::Interrupted;
        }

        self.act(result).await
    }

    /// Runs the matcher on the blocking pool. The worker is always awaited,
    /// so a loop never has more than one matching computation in flight.
    async fn match_frame(&self, frame: Frame) -> AutomationResult<MatchResult> {
        let matcher = self.matcher;
        let reference = self.config.reference().clone();
        let threshold = self.config.threshold();
        let result = tokio::task::spawn_blocking(move || {
            matcher.match_template(&frame, &reference, threshold)
        })
        .await??;
        Ok(result)
    }

    async fn act(&self, result: MatchResult) -> CycleOutcome {
        let (x, y) = (result.x, result.y);
        log::debug!(
            "🎯 Template found at ({x:.1}, {y:.1}) with confidence {:.3}",
            result.confidence
        );

        match self.actions.dispatch(x, y).await {
            Ok(outcome) => {
                match outcome {
                    DispatchOutcome::Completed => log::info!("✅ Action performed at ({x:.1}, {y:.1})"),
                    DispatchOutcome::Cancelled => log::warn!("⚠️ Action at ({x:.1}, {y:.1}) was cancelled"),
                }
                CycleOutcome::Dispatched {
                    x,
                    y,
                    confidence: result.confidence,
                    outcome,
                }
            }
            Err(e) => {
                log::warn!("❌ {e}");
                CycleOutcome::DispatchFailed {
                    x,
                    y,
                    reason: e.to_string(),
                }
            }
        }
    }

    fn record(&self, report: CycleReport) {
        lock(&self.stats).record(&report.outcome);
        // No subscribers is fine
        let _ = self.reports.send(report);
    }
}
