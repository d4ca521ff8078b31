//! Template matching data types

use super::error::MatchError;
use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// BT.601 luma weights in 14-bit fixed point (they sum to 1 << 14).
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;
const LUMA_SHIFT: u32 = 14;

/// Reduce one RGB sample to 8-bit intensity.
///
/// `Y = (R*4899 + G*9617 + B*1868 + 8192) >> 14`, i.e. ITU-R BT.601 weights
/// (0.299, 0.587, 0.114) rounded to nearest.
pub fn luminance(r: u8, g: u8, b: u8) -> u8 {
    let weighted = u32::from(r) * LUMA_R + u32::from(g) * LUMA_G + u32::from(b) * LUMA_B;
    ((weighted + (1 << (LUMA_SHIFT - 1))) >> LUMA_SHIFT) as u8
}

/// Validated row-major pixel storage shared by [`Frame`] and [`ReferenceImage`].
///
/// Supported layouts: 1 (gray), 2 (gray + alpha), 3 (RGB), 4 (RGBA) channels,
/// interleaved, one byte per sample.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelGrid {
    width: u32,
    height: u32,
    channels: u8,
    samples: Vec<u8>,
}

impl PixelGrid {
    pub fn new(width: u32, height: u32, channels: u8, samples: Vec<u8>) -> Result<Self, MatchError> {
        if width == 0 || height == 0 {
            return Err(MatchError::invalid_input(format!(
                "pixel grid must not be empty, got {width}x{height}"
            )));
        }
        if !(1..=4).contains(&channels) {
            return Err(MatchError::invalid_input(format!(
                "unsupported channel count {channels}, expected 1 to 4"
            )));
        }
        let expected = width as usize * height as usize * channels as usize;
        if samples.len() != expected {
            return Err(MatchError::invalid_input(format!(
                "{width}x{height}x{channels} grid needs {expected} samples, got {}",
                samples.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            samples,
        })
    }

    /// Build a grid from a decoded image, keeping gray images single-channel.
    pub fn from_dynamic(image: &DynamicImage) -> Result<Self, MatchError> {
        let (width, height) = image.dimensions();
        let color = image.color();
        match (color.has_color(), color.has_alpha()) {
            (false, false) => Self::new(width, height, 1, image.to_luma8().into_raw()),
            (false, true) => Self::new(width, height, 2, image.to_luma_alpha8().into_raw()),
            (true, false) => Self::new(width, height, 3, image.to_rgb8().into_raw()),
            (true, true) => Self::new(width, height, 4, image.to_rgba8().into_raw()),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    /// Intensity of the pixel at (x, y). Alpha is ignored. Callers keep
    /// (x, y) inside the grid.
    pub(crate) fn intensity_at(&self, x: u32, y: u32) -> u8 {
        let channels = self.channels as usize;
        let start = (y as usize * self.width as usize + x as usize) * channels;
        let px = &self.samples[start..start + channels];
        match channels {
            1 | 2 => px[0],
            _ => luminance(px[0], px[1], px[2]),
        }
    }

    /// Single-channel intensity image used by the matcher.
    pub fn to_luma(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([self.intensity_at(x, y)])
        })
    }
}

impl fmt::Debug for PixelGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelGrid")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("samples", &self.samples.len())
            .finish()
    }
}

fn decode(path: &Path) -> Result<DynamicImage, MatchError> {
    image::open(path).map_err(|source| MatchError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// One captured screen image. Owned by the cycle that requested it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    grid: PixelGrid,
}

impl Frame {
    pub fn new(width: u32, height: u32, channels: u8, samples: Vec<u8>) -> Result<Self, MatchError> {
        PixelGrid::new(width, height, channels, samples).map(Self::from_grid)
    }

    pub fn from_grid(grid: PixelGrid) -> Self {
        Self { grid }
    }

    pub fn from_dynamic(image: &DynamicImage) -> Result<Self, MatchError> {
        PixelGrid::from_dynamic(image).map(Self::from_grid)
    }

    /// Decode an encoded screenshot (PNG, JPEG) held in memory.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self, MatchError> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| MatchError::invalid_input(format!("undecodable frame: {e}")))?;
        Self::from_dynamic(&image)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, MatchError> {
        Self::from_dynamic(&decode(path.as_ref())?)
    }

    pub fn grid(&self) -> &PixelGrid {
        &self.grid
    }

    pub fn width(&self) -> u32 {
        self.grid.width
    }

    pub fn height(&self) -> u32 {
        self.grid.height
    }
}

/// The image searched for in every frame.
///
/// Pixels live behind an `Arc`, so clones share storage; the image is
/// never mutated once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceImage {
    grid: Arc<PixelGrid>,
}

impl ReferenceImage {
    pub fn new(width: u32, height: u32, channels: u8, samples: Vec<u8>) -> Result<Self, MatchError> {
        PixelGrid::new(width, height, channels, samples).map(Self::from_grid)
    }

    pub fn from_grid(grid: PixelGrid) -> Self {
        Self {
            grid: Arc::new(grid),
        }
    }

    pub fn from_dynamic(image: &DynamicImage) -> Result<Self, MatchError> {
        PixelGrid::from_dynamic(image).map(Self::from_grid)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, MatchError> {
        Self::from_dynamic(&decode(path.as_ref())?)
    }

    pub fn grid(&self) -> &PixelGrid {
        &self.grid
    }

    pub fn width(&self) -> u32 {
        self.grid.width
    }

    pub fn height(&self) -> u32 {
        self.grid.height
    }
}

/// Outcome of one matching pass.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MatchResult {
    /// Whether `confidence` reached the threshold
    pub found: bool,
    /// Match centre in frame pixels, `0.0` on a miss
    pub x: f32,
    pub y: f32,
    /// Best correlation score observed, in [-1.0, 1.0], also on a miss
    pub confidence: f32,
    /// Top-left offset of the best window, reported on a miss as well
    pub offset_x: u32,
    pub offset_y: u32,
}

impl MatchResult {
    pub fn hit(offset_x: u32, offset_y: u32, x: f32, y: f32, confidence: f32) -> Self {
        Self {
            found: true,
            x,
            y,
            confidence,
            offset_x,
            offset_y,
        }
    }

    pub fn miss(offset_x: u32, offset_y: u32, confidence: f32) -> Self {
        Self {
            found: false,
            x: 0.0,
            y: 0.0,
            confidence,
            offset_x,
            offset_y,
        }
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = self.confidence * 100.0;
        if self.found {
            write!(f, "match at ({:.1},{:.1}) - {pct:.1}%", self.x, self.y)
        } else {
            write!(
                f,
                "no match (best {pct:.1}% at offset {},{})",
                self.offset_x, self.offset_y
            )
        }
    }
}
