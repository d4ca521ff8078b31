// ADB module - Android Debug Bridge via the platform-tools `adb` binary
// Provides device discovery, screenshots and taps, and exposes a device
// screen as the automation loop's frame source and action target.

pub mod error;
pub mod screen;
pub mod shell;
pub mod types;

// Re-export the main types and functions for easy access
pub use error::{AdbError, AdbResult};
pub use screen::AdbScreen;
pub use shell::AdbShell;
pub use types::{Device, ImageCapture};
