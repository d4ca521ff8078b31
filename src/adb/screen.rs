// Device screen as loop capabilities: screencap frames in, input taps out
use super::error::{AdbError, AdbResult};
use super::shell::AdbShell;
use super::types::ImageCapture;
use crate::automation::{
    ActionDispatcher, AutomationError, AutomationResult, DispatchOutcome, FrameOutcome,
    FrameProvider,
};
use crate::template_matching::Frame;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::timeout;

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Map a point in frame pixels to a device tap coordinate.
///
/// Screenshots come back at physical resolution while `input tap` uses the
/// (possibly overridden) display size, so the point is scaled when the two
/// differ. Returns `None` for points outside the screen.
pub fn to_device_pixel(
    x: f32,
    y: f32,
    frame_size: Option<(u32, u32)>,
    screen: (u32, u32),
) -> Option<(u32, u32)> {
    let (sx, sy) = match frame_size {
        Some((fw, fh)) if fw > 0 && fh > 0 => {
            (screen.0 as f32 / fw as f32, screen.1 as f32 / fh as f32)
        }
        _ => (1.0, 1.0),
    };
    let (dx, dy) = ((x * sx).floor(), (y * sy).floor());
    if !(dx >= 0.0 && dy >= 0.0 && dx < screen.0 as f32 && dy < screen.1 as f32) {
        return None;
    }
    Some((dx as u32, dy as u32))
}

/// A connected device used as both frame source and tap target.
pub struct AdbScreen {
    shell: AdbShell,
    capture_timeout: Duration,
    tap_timeout: Duration,
    captures: AtomicU64,
    last_frame_size: Mutex<Option<(u32, u32)>>,
}

impl AdbScreen {
    pub fn new(shell: AdbShell) -> Self {
        Self {
            shell,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            tap_timeout: DEFAULT_TAP_TIMEOUT,
            captures: AtomicU64::new(0),
            last_frame_size: Mutex::new(None),
        }
    }

    pub fn with_capture_timeout(mut self, capture_timeout: Duration) -> Self {
        self.capture_timeout = capture_timeout;
        self
    }

    /// Taps still running after this long are abandoned (the `adb` child is
    /// killed) and reported as cancelled.
    pub fn with_tap_timeout(mut self, tap_timeout: Duration) -> Self {
        self.tap_timeout = tap_timeout;
        self
    }

    pub fn shell(&self) -> &AdbShell {
        &self.shell
    }

    pub async fn capture(&self) -> AdbResult<ImageCapture> {
        let started = Instant::now();
        let bytes = timeout(self.capture_timeout, self.shell.screen_capture_bytes())
            .await
            .map_err(|_| AdbError::Timeout {
                duration: self.capture_timeout,
                description: "screencap".to_string(),
            })??;
        let index = self.captures.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(ImageCapture {
            bytes,
            duration_ms: started.elapsed().as_millis(),
            index,
        })
    }

    fn frame_size(&self) -> Option<(u32, u32)> {
        *self
            .last_frame_size
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl FrameProvider for AdbScreen {
    async fn try_get_frame(&self) -> FrameOutcome {
        let capture = match self.capture().await {
            Ok(capture) => capture,
            Err(e) => {
                log::warn!("📸 Screen capture failed: {e}");
                return FrameOutcome::Unavailable;
            }
        };
        match Frame::from_encoded(&capture.bytes) {
            Ok(frame) => {
                log::debug!(
                    "📸 Capture #{} {}x{} in {}ms",
                    capture.index,
                    frame.width(),
                    frame.height(),
                    capture.duration_ms
                );
                *self
                    .last_frame_size
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) =
                    Some((frame.width(), frame.height()));
                FrameOutcome::Ready(frame)
            }
            Err(e) => {
                log::warn!("📸 Capture #{} could not be decoded: {e}", capture.index);
                FrameOutcome::Unavailable
            }
        }
    }
}

impl ActionDispatcher for AdbScreen {
    async fn dispatch(&self, x: f32, y: f32) -> AutomationResult<DispatchOutcome> {
        let (tap_x, tap_y) = to_device_pixel(x, y, self.frame_size(), self.shell.screen_dimensions())
            .ok_or_else(|| AutomationError::DispatchFailed {
                x,
                y,
                reason: "point is outside the device screen".to_string(),
            })?;

        match timeout(self.tap_timeout, self.shell.tap(tap_x, tap_y)).await {
            Ok(Ok(())) => {
                log::debug!("👆 Tapped {} at ({tap_x}, {tap_y})", self.shell.device_name());
                Ok(DispatchOutcome::Completed)
            }
            Ok(Err(e)) => Err(AutomationError::DispatchFailed {
                x,
                y,
                reason: e.to_string(),
            }),
            Err(_) => {
                log::warn!(
                    "⏱️ Tap at ({tap_x}, {tap_y}) did not finish within {}ms, abandoned",
                    self.tap_timeout.as_millis()
                );
                Ok(DispatchOutcome::Cancelled)
            }
        }
    }
}
