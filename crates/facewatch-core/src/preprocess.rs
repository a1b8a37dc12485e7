//! Sample normalisation shared by enrollment and live recognition.
//!
//! Every face crop goes through the same three steps before it reaches the
//! appearance model: grayscale, fixed square resize, global histogram
//! equalisation.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use thiserror::Error;

pub const DEFAULT_CANONICAL_SIZE: u32 = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("sample has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
}

/// A grayscale, canonical-size, equalised face sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSample {
    image: GrayImage,
}

impl CanonicalSample {
    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn into_image(self) -> GrayImage {
        self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    #[cfg(test)]
    pub(crate) fn from_raw_gray(image: GrayImage) -> Self {
        Self { image }
    }
}

/// Normalises face crops into [`CanonicalSample`]s.
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    size: u32,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_CANONICAL_SIZE)
    }
}

impl Preprocessor {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn canonical_size(&self) -> u32 {
        self.size
    }

    /// Grayscale, resize to `size`×`size` (aspect ratio is not preserved),
    /// then equalise.
    pub fn preprocess(&self, image: &DynamicImage) -> Result<CanonicalSample, PreprocessError> {
        self.preprocess_gray(&image.to_luma8())
    }

    /// Same as [`preprocess`](Self::preprocess) for an image that is already grayscale.
    pub fn preprocess_gray(&self, gray: &GrayImage) -> Result<CanonicalSample, PreprocessError> {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return Err(PreprocessError::Empty { width, height });
        }

        let mut resized = if (width, height) == (self.size, self.size) {
            gray.clone()
        } else {
            imageops::resize(gray, self.size, self.size, FilterType::Triangle)
        };

        equalize_histogram(&mut resized);
        Ok(CanonicalSample { image: resized })
    }
}

/// Global histogram equalisation, in place.
///
/// The darkest occupied level maps to 0 and the brightest to 255. Levels above
/// the darkest never map to 0, so equalising an equalised image is a no-op.
/// Flat images are left untouched.
pub fn equalize_histogram(gray: &mut GrayImage) {
    let mut hist = [0u64; 256];
    for p in gray.pixels() {
        hist[p.0[0] as usize] += 1;
    }

    let total: u64 = hist.iter().sum();
    let Some(min_level) = hist.iter().position(|&c| c > 0) else {
        return;
    };
    let darkest = hist[min_level];
    if darkest == total {
        return;
    }

    // lut[i] = round(255 * (cdf(i) - darkest) / (total - darkest)), integer-only.
    let span = total - darkest;
    let mut lut = [0u8; 256];
    let mut cdf = 0u64;
    for (level, &count) in hist.iter().enumerate() {
        cdf += count;
        if level <= min_level {
            continue;
        }
        let scaled = ((cdf - darkest) * 255 * 2 + span) / (2 * span);
        lut[level] = scaled.clamp(1, 255) as u8;
    }

    for p in gray.pixels_mut() {
        p.0[0] = lut[p.0[0] as usize];
    }
}
