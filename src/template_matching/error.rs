use std::path::PathBuf;
use thiserror::Error;

/// The error type for frame/template construction and matching.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error(
        "Template {template_width}x{template_height} does not fit in frame {frame_width}x{frame_height}"
    )]
    InvalidDimensions {
        template_width: u32,
        template_height: u32,
        frame_width: u32,
        frame_height: u32,
    },

    #[error("Failed to decode image {path:?}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
}

impl MatchError {
    pub(crate) fn invalid_input(reason: impl Into<String>) -> Self {
        MatchError::InvalidInput {
            reason: reason.into(),
        }
    }
}
