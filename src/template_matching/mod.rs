//! Template matching for locating a reference image inside screen frames
//!
//! - Luminance reduction with fixed BT.601 weights
//! - Zero-mean normalized cross-correlation over every valid offset
//! - Integral images for window statistics
//! - Deterministic row-major tie breaking
pub mod error;
pub mod matcher;
pub mod types;

pub use error::MatchError;
pub use matcher::TemplateMatcher;
pub use types::{Frame, MatchResult, PixelGrid, ReferenceImage, luminance};
