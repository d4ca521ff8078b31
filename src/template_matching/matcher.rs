//! Normalized cross-correlation template matching
//!
//! Both images are reduced to 8-bit intensity, so every sum below is an exact
//! integer. Window sums and sums of squares come from integral images. The
//! template/window cross term is accumulated directly for small searches and
//! taken from one FFT correlation per frame otherwise; the FFT values are
//! rounded back to the integers they approximate.

use super::error::MatchError;
use super::types::{Frame, MatchResult, ReferenceImage};
use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

/// Multiply-adds (offsets × template pixels) above which the cross term is
/// computed in the frequency domain.
const DIRECT_WORK_LIMIT: u64 = 1 << 22;

/// Stateless single-target matcher.
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateMatcher;

/// Template intensities and their precomputed moments.
struct TemplateStats {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
    sum: i128,
    /// `n*ΣT² − (ΣT)²`, zero for a flat template
    spread: i128,
}

impl TemplateStats {
    fn new(luma: GrayImage) -> Self {
        let width = luma.width() as usize;
        let height = luma.height() as usize;
        let pixels = luma.into_raw();
        let n = pixels.len() as i128;
        let sum: i128 = pixels.iter().map(|&p| i128::from(p)).sum();
        let sum_sq: i128 = pixels.iter().map(|&p| i128::from(p) * i128::from(p)).sum();
        Self {
            width,
            height,
            pixels,
            sum,
            spread: n * sum_sq - sum * sum,
        }
    }

    fn len(&self) -> i128 {
        self.pixels.len() as i128
    }
}

/// Integral tables over the frame intensities.
struct WindowSums {
    sums: Image<Luma<u64>>,
    squares: Image<Luma<u64>>,
}

impl WindowSums {
    fn new(luma: &GrayImage) -> Self {
        Self {
            sums: integral_image::<_, u64>(luma),
            squares: integral_squared_image::<_, u64>(luma),
        }
    }

    /// (ΣW, ΣW²) over the window with top-left (x, y) and size w×h.
    fn window(&self, x: u32, y: u32, w: u32, h: u32) -> (i128, i128) {
        (
            rect_sum(&self.sums, x, y, w, h),
            rect_sum(&self.squares, x, y, w, h),
        )
    }
}

// Integral images are one pixel larger than their source: I(x, y) = Σ F(x' < x, y' < y).
fn rect_sum(table: &Image<Luma<u64>>, x: u32, y: u32, w: u32, h: u32) -> i128 {
    let at = |x: u32, y: u32| i128::from(table.get_pixel(x, y)[0]);
    at(x + w, y + h) + at(x, y) - at(x + w, y) - at(x, y + h)
}

/// Correlation coefficient from integer moments.
///
/// Flat (zero-variance) inputs have no defined coefficient: two flat patches
/// score 1.0 when their intensities agree and 0.0 otherwise, and a flat
/// patch against a textured one scores 0.0.
fn coefficient(template: &TemplateStats, window_sum: i128, window_spread: i128, cross: i128) -> f64 {
    match (template.spread == 0, window_spread == 0) {
        (true, true) => {
            if template.sum == window_sum {
                1.0
            } else {
                0.0
            }
        }
        (true, false) | (false, true) => 0.0,
        (false, false) => {
            let numerator = template.len() * cross - template.sum * window_sum;
            let denominator = (template.spread as f64).sqrt() * (window_spread as f64).sqrt();
            (numerator as f64 / denominator).clamp(-1.0, 1.0)
        }
    }
}

fn cross_term(frame: &[u8], frame_width: usize, template: &TemplateStats, x: usize, y: usize) -> i128 {
    let mut total: u64 = 0;
    for row in 0..template.height {
        let start = (y + row) * frame_width + x;
        let frame_row = &frame[start..start + template.width];
        let template_row = &template.pixels[row * template.width..(row + 1) * template.width];
        total += frame_row
            .iter()
            .zip(template_row)
            .map(|(&f, &t)| u64::from(f) * u64::from(t))
            .sum::<u64>();
    }
    i128::from(total)
}

/// `dst[x * height + y] = src[y * width + x]`
fn transpose(src: &[Complex<f64>], width: usize, height: usize) -> Vec<Complex<f64>> {
    let mut dst = vec![Complex::default(); src.len()];
    for (y, row) in src.chunks_exact(width).enumerate() {
        for (x, value) in row.iter().enumerate() {
            dst[x * height + y] = *value;
        }
    }
    dst
}

/// Forward 2-D FFT of a row-major `width × height` buffer. The spectrum is
/// left transposed (`width` rows of `height` bins).
fn forward_2d(planner: &mut FftPlanner<f64>, buffer: &mut Vec<Complex<f64>>, width: usize, height: usize) {
    planner.plan_fft_forward(width).process(buffer);
    let mut columns = transpose(buffer, width, height);
    planner.plan_fft_forward(height).process(&mut columns);
    *buffer = columns;
}

/// Inverse of [`forward_2d`], back to row-major layout. Unnormalized.
fn inverse_2d(planner: &mut FftPlanner<f64>, buffer: &mut Vec<Complex<f64>>, width: usize, height: usize) {
    planner.plan_fft_inverse(height).process(buffer);
    let mut rows = transpose(buffer, height, width);
    planner.plan_fft_inverse(width).process(&mut rows);
    *buffer = rows;
}

/// Source of Σ(T·W) for every window offset.
enum CrossTerms<'a> {
    Direct { frame: &'a [u8], frame_width: usize },
    /// Circular correlation of the frame with the zero-padded template, row
    /// major at frame size. Offsets that fit the template never wrap.
    Spectral { values: Vec<f64>, frame_width: usize },
}

impl<'a> CrossTerms<'a> {
    fn for_frame(frame: &'a GrayImage, template: &TemplateStats) -> Self {
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        let offsets = ((width - template.width + 1) * (height - template.height + 1)) as u64;
        if offsets * template.pixels.len() as u64 <= DIRECT_WORK_LIMIT {
            Self::direct(frame)
        } else {
            Self::spectral(frame, template)
        }
    }

    fn direct(frame: &'a GrayImage) -> Self {
        Self::Direct {
            frame: frame.as_raw(),
            frame_width: frame.width() as usize,
        }
    }

    fn spectral(frame: &GrayImage, template: &TemplateStats) -> Self {
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        log::debug!(
            "Correlating {width}x{height} frame with {}x{} template via FFT",
            template.width,
            template.height
        );
        let mut planner = FftPlanner::<f64>::new();

        let mut spectrum: Vec<Complex<f64>> = frame
            .as_raw()
            .iter()
            .map(|&p| Complex::new(f64::from(p), 0.0))
            .collect();
        let mut kernel = vec![Complex::default(); width * height];
        for (row, pixels) in template.pixels.chunks_exact(template.width).enumerate() {
            for (col, &p) in pixels.iter().enumerate() {
                kernel[row * width + col] = Complex::new(f64::from(p), 0.0);
            }
        }

        forward_2d(&mut planner, &mut spectrum, width, height);
        forward_2d(&mut planner, &mut kernel, width, height);
        for (bin, k) in spectrum.iter_mut().zip(&kernel) {
            *bin *= k.conj();
        }
        inverse_2d(&mut planner, &mut spectrum, width, height);

        let scale = 1.0 / (width * height) as f64;
        Self::Spectral {
            values: spectrum.into_iter().map(|c| c.re * scale).collect(),
            frame_width: width,
        }
    }

    fn at(&self, template: &TemplateStats, x: usize, y: usize) -> i128 {
        match self {
            Self::Direct { frame, frame_width } => cross_term(frame, *frame_width, template, x, y),
            Self::Spectral { values, frame_width } => values[y * frame_width + x].round() as i128,
        }
    }
}

impl TemplateMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Find the window of `frame` most correlated with `template`.
    ///
    /// The whole frame is scanned in row-major order; ties keep the first
    /// (lowest row, then lowest column) offset. A score below `threshold` is a
    /// normal miss, not an error.
    ///
    /// # Errors
    /// * [`MatchError::InvalidDimensions`] if the template is wider or taller
    ///   than the frame
    /// * [`MatchError::InvalidInput`] if `threshold` is not a finite number
    pub fn match_template(
        &self,
        frame: &Frame,
        template: &ReferenceImage,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let (frame_width, frame_height) = (frame.width(), frame.height());
        let (template_width, template_height) = (template.width(), template.height());

        if template_width > frame_width || template_height > frame_height {
            return Err(MatchError::InvalidDimensions {
                template_width,
                template_height,
                frame_width,
                frame_height,
            });
        }
        if !threshold.is_finite() {
            return Err(MatchError::invalid_input(format!(
                "threshold must be finite, got {threshold}"
            )));
        }

        let frame_luma = frame.grid().to_luma();
        let stats = TemplateStats::new(template.grid().to_luma());
        let windows = WindowSums::new(&frame_luma);
        let cross_terms = if stats.spread == 0 {
            CrossTerms::direct(&frame_luma)
        } else {
            CrossTerms::for_frame(&frame_luma, &stats)
        };

        let mut best_score = f64::NEG_INFINITY;
        let mut best_offset = (0_u32, 0_u32);

        for y in 0..=(frame_height - template_height) {
            for x in 0..=(frame_width - template_width) {
                let (window_sum, window_sum_sq) =
                    windows.window(x, y, template_width, template_height);
                let window_spread = stats.len() * window_sum_sq - window_sum * window_sum;

                let cross = if stats.spread == 0 || window_spread == 0 {
                    0
                } else {
                    cross_terms.at(&stats, x as usize, y as usize)
                };

                let score = coefficient(&stats, window_sum, window_spread, cross);
                if score > best_score {
                    best_score = score;
                    best_offset = (x, y);
                }
            }
        }

        let confidence = best_score as f32;
        let (offset_x, offset_y) = best_offset;

        let result = if confidence >= threshold {
            let center_x = offset_x as f32 + template_width as f32 / 2.0;
            let center_y = offset_y as f32 + template_height as f32 / 2.0;
            log::debug!(
                "Template found at ({center_x}, {center_y}) with confidence {confidence:.3}"
            );
            MatchResult::hit(offset_x, offset_y, center_x, center_y, confidence)
        } else {
            log::debug!(
                "Template not found. Best match: {confidence:.3} at offset ({offset_x}, {offset_y})"
            );
            MatchResult::miss(offset_x, offset_y, confidence)
        };

        Ok(result)
    }
}
