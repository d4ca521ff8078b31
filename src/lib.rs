pub mod adb;
pub mod args;
pub mod automation;
pub mod template_matching;

pub use automation::{ActionDispatcher, AutomationLoop, FrameProvider, LoopConfig, LoopState};
pub use template_matching::{Frame, MatchResult, ReferenceImage, TemplateMatcher};
