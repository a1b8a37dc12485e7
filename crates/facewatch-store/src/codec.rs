//! Filesystem image codec.
//!
//! Event crops are written as JPEG under `<data>/recognition_events/`,
//! enrollment samples as PNG under `<data>/face_samples/`.

use crate::db::StoreError;
use chrono::Utc;
use facewatch_core::ports::{ImageCodec, PortError};
use facewatch_core::types::ImageRef;
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};

pub const EVENTS_DIR: &str = "recognition_events";
pub const SAMPLES_DIR: &str = "face_samples";

pub struct FsImageCodec {
    data_dir: PathBuf,
}

impl FsImageCodec {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    /// Write an event crop: `<name>_<YYYYmmdd_HHMMSS>_<uuid>.jpg`.
    pub fn save_event_image(&self, image: &DynamicImage, name: &str) -> Result<PathBuf, StoreError> {
        let file = format!("{}_{}.jpg", sanitize(name), unique_suffix());
        let path = self.data_dir.join(EVENTS_DIR).join(file);
        write_image(&jpeg_compatible(image), &path, ImageFormat::Jpeg)?;
        Ok(path)
    }

    /// Write an enrollment sample: `user_<id>_<YYYYmmdd_HHMMSS>_<uuid>.png`.
    pub fn save_sample_image(&self, image: &DynamicImage, user_id: i64) -> Result<PathBuf, StoreError> {
        let file = format!("user_{user_id}_{}.png", unique_suffix());
        let path = self.data_dir.join(SAMPLES_DIR).join(file);
        write_image(image, &path, ImageFormat::Png)?;
        Ok(path)
    }

    pub fn load(&self, path: &Path) -> Result<DynamicImage, StoreError> {
        Ok(image::open(path)?)
    }
}

impl ImageCodec for FsImageCodec {
    fn decode(&self, image: &ImageRef) -> Result<DynamicImage, PortError> {
        self.load(Path::new(&image.0))
            .map_err(|e| PortError::new("decode", e))
    }

    fn encode(&self, image: &DynamicImage, hint: &str) -> Result<ImageRef, PortError> {
        let path = self
            .save_event_image(image, hint)
            .map_err(|e| PortError::new("encode", e))?;
        Ok(ImageRef(path.to_string_lossy().into_owned()))
    }
}

fn write_image(image: &DynamicImage, path: &Path, format: ImageFormat) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save_with_format(path, format)?;
    tracing::debug!(path = %path.display(), "image written");
    Ok(())
}

/// JPEG has no alpha channel and no 16-bit depth.
fn jpeg_compatible(image: &DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => image.clone(),
        DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLumaA16(_) => {
            DynamicImage::ImageLuma8(image.to_luma8())
        }
        _ => DynamicImage::ImageRgb8(image.to_rgb8()),
    }
}

fn unique_suffix() -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &short[..8])
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
