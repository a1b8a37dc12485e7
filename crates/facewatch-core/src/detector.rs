//! Two-stage face region verification.
//!
//! A frontal-face cascade proposes candidate boxes; each candidate is kept
//! only if an eye cascade finds at least one eye inside it.

use crate::cascade::{CascadeError, HaarCascade, ScanParams};
use crate::types::Region;
use image::{DynamicImage, GrayImage};
use std::path::Path;

pub const FACE_CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
pub const EYE_CASCADE_FILE: &str = "haarcascade_eye.xml";

/// Coarse face scan: scale 1.1, 5 neighbours, at least 30×30.
pub const DEFAULT_FACE_SCAN: ScanParams = ScanParams {
    scale_factor: 1.1,
    min_neighbors: 5,
    min_size: (30, 30),
    max_size: (0, 0),
};

/// Eye scan inside a face candidate, with `detectMultiScale` defaults.
pub const DEFAULT_EYE_SCAN: ScanParams = ScanParams {
    scale_factor: 1.1,
    min_neighbors: 3,
    min_size: (0, 0),
    max_size: (0, 0),
};

/// Anything that can find confirmed face regions in a frame.
pub trait FaceLocator {
    fn locate(&self, frame: &DynamicImage) -> Vec<Region>;
}

/// Face cascade + eye cascade verifier.
pub struct RegionVerifier {
    face: HaarCascade,
    eye: HaarCascade,
    face_scan: ScanParams,
    eye_scan: ScanParams,
}

impl RegionVerifier {
    pub fn new(face: HaarCascade, eye: HaarCascade) -> Self {
        Self {
            face,
            eye,
            face_scan: DEFAULT_FACE_SCAN,
            eye_scan: DEFAULT_EYE_SCAN,
        }
    }

    /// Load the stock OpenCV face and eye cascades from `cascade_dir`.
    pub fn load(cascade_dir: &Path) -> Result<Self, CascadeError> {
        let face = HaarCascade::load(&cascade_dir.join(FACE_CASCADE_FILE))?;
        let eye = HaarCascade::load(&cascade_dir.join(EYE_CASCADE_FILE))?;
        Ok(Self::new(face, eye))
    }

    pub fn with_scan_params(mut self, face_scan: ScanParams, eye_scan: ScanParams) -> Self {
        self.face_scan = face_scan;
        self.eye_scan = eye_scan;
        self
    }

    /// Confirmed face regions in a grayscale frame. An empty frame yields no regions.
    pub fn verify(&self, gray: &GrayImage) -> Vec<Region> {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let candidates = self.face.detect_multi_scale(gray, &self.face_scan);
        let proposed = candidates.len();

        let verified: Vec<Region> = candidates
            .into_iter()
            .filter_map(|candidate| candidate.clamp_to(width, height))
            .filter(|candidate| self.has_eye(gray, candidate))
            .collect();

        tracing::debug!(proposed, verified = verified.len(), "face regions verified");
        verified
    }

    fn has_eye(&self, gray: &GrayImage, face: &Region) -> bool {
        let crop = image::imageops::crop_imm(gray, face.x, face.y, face.width, face.height).to_image();
        !self.eye.detect_multi_scale(&crop, &self.eye_scan).is_empty()
    }
}

impl FaceLocator for RegionVerifier {
    fn locate(&self, frame: &DynamicImage) -> Vec<Region> {
        self.verify(&frame.to_luma8())
    }
}
