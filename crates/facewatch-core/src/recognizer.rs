//! Local binary pattern histogram (LBPH) face recognizer.
//!
//! Each canonical sample is turned into a grid of per-cell LBP code
//! histograms; prediction is nearest neighbour under the alternative
//! chi-square distance. The model is always rebuilt from the whole corpus.

use crate::preprocess::CanonicalSample;
use crate::types::Identity;
use image::GrayImage;
use serde::Deserialize;
use std::cmp::Ordering;
use thiserror::Error;

pub const DEFAULT_RADIUS: u32 = 2;
pub const DEFAULT_NEIGHBORS: u32 = 12;
pub const DEFAULT_GRID: u32 = 10;

const MAX_NEIGHBORS: u32 = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("no model available: nothing has been enrolled yet")]
    NotTrained,
    #[error("sample is {got:?}, model expects {expected:?}")]
    SizeMismatch { expected: (u32, u32), got: (u32, u32) },
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
}

/// LBPH operator and grid parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: DEFAULT_RADIUS,
            neighbors: DEFAULT_NEIGHBORS,
            grid_x: DEFAULT_GRID,
            grid_y: DEFAULT_GRID,
        }
    }
}

impl LbphParams {
    fn validate(&self, size: (u32, u32)) -> Result<(), ModelError> {
        if self.radius == 0 || self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(ModelError::InvalidParams(format!(
                "radius {} / neighbors {} (neighbors must be 1..={MAX_NEIGHBORS})",
                self.radius, self.neighbors
            )));
        }
        let inner_w = size.0.saturating_sub(2 * self.radius);
        let inner_h = size.1.saturating_sub(2 * self.radius);
        if self.grid_x == 0 || self.grid_y == 0 || inner_w < self.grid_x || inner_h < self.grid_y {
            return Err(ModelError::InvalidParams(format!(
                "{}x{} grid does not fit a {}x{} sample",
                self.grid_x, self.grid_y, size.0, size.1
            )));
        }
        Ok(())
    }
}

/// Dense internal label; only meaningful within one training pass.
pub type Label = usize;

/// What a label stands for in the pass that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelInfo {
    pub identity: Identity,
    pub sample_count: usize,
}

/// Preprocessed enrollment samples with their dense labels.
#[derive(Debug, Default, Clone)]
pub struct TrainingCorpus {
    labels: Vec<LabelInfo>,
    samples: Vec<(CanonicalSample, Label)>,
}

impl TrainingCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity and return its label (assigned in call order).
    pub fn add_identity(&mut self, identity: Identity) -> Label {
        self.labels.push(LabelInfo { identity, sample_count: 0 });
        self.labels.len() - 1
    }

    /// Attach a sample to a registered label. Unknown labels are ignored.
    pub fn add_sample(&mut self, label: Label, sample: CanonicalSample) {
        if let Some(info) = self.labels.get_mut(label) {
            info.sample_count += 1;
            self.samples.push((sample, label));
        }
    }

    pub fn labels(&self) -> &[LabelInfo] {
        &self.labels
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Nearest training sample for a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: Label,
    pub identity: Identity,
    /// Enrollment samples behind this label.
    pub sample_count: usize,
    /// Chi-square distance to the nearest sample; >= 0, smaller is closer.
    pub distance: f64,
}

/// Strategy for identifying a canonical face sample.
pub trait Classifier {
    fn predict(&self, sample: &CanonicalSample) -> Result<Prediction, ModelError>;
}

/// Sparse spatial histogram: (global bin, normalised count), sorted by bin.
type Histogram = Vec<(u32, f32)>;

struct TrainedModel {
    sample_size: (u32, u32),
    labels: Vec<LabelInfo>,
    histograms: Vec<(Label, Histogram)>,
}

/// LBPH appearance model. Untrained until a non-empty corpus is supplied.
pub struct AppearanceModel {
    params: LbphParams,
    trained: Option<TrainedModel>,
}

impl Default for AppearanceModel {
    fn default() -> Self {
        Self::new(LbphParams::default())
    }
}

impl AppearanceModel {
    pub fn new(params: LbphParams) -> Self {
        Self { params, trained: None }
    }

    /// Build a model from `corpus`.
    pub fn trained(params: LbphParams, corpus: &TrainingCorpus) -> Result<Self, ModelError> {
        let mut model = Self::new(params);
        model.train(corpus)?;
        Ok(model)
    }

    /// Rebuild from scratch on the full corpus and swap the result in.
    ///
    /// An empty corpus leaves the model untrained. On error the previous
    /// model is kept.
    pub fn train(&mut self, corpus: &TrainingCorpus) -> Result<(), ModelError> {
        let Some((first, _)) = corpus.samples.first() else {
            tracing::info!(identities = corpus.labels.len(), "no enrollment samples; model left untrained");
            self.trained = None;
            return Ok(());
        };

        let sample_size = first.image().dimensions();
        self.params.validate(sample_size)?;

        let mut histograms = Vec::with_capacity(corpus.samples.len());
        for (sample, label) in &corpus.samples {
            let got = sample.image().dimensions();
            if got != sample_size {
                return Err(ModelError::SizeMismatch { expected: sample_size, got });
            }
            histograms.push((*label, spatial_histogram(sample.image(), &self.params)));
        }

        tracing::info!(
            samples = histograms.len(),
            identities = corpus.labels.len(),
            radius = self.params.radius,
            neighbors = self.params.neighbors,
            grid = ?(self.params.grid_x, self.params.grid_y),
            "trained appearance model"
        );

        self.trained = Some(TrainedModel {
            sample_size,
            labels: corpus.labels.clone(),
            histograms,
        });
        Ok(())
    }

    pub fn is_trained(&self) -> bool {
        self.trained.is_some()
    }

    /// Label map of the current model (empty when untrained).
    pub fn labels(&self) -> &[LabelInfo] {
        self.trained.as_ref().map(|m| m.labels.as_slice()).unwrap_or(&[])
    }
}

impl Classifier for AppearanceModel {
    fn predict(&self, sample: &CanonicalSample) -> Result<Prediction, ModelError> {
        let model = self.trained.as_ref().ok_or(ModelError::NotTrained)?;
        let got = sample.image().dimensions();
        if got != model.sample_size {
            return Err(ModelError::SizeMismatch { expected: model.sample_size, got });
        }

        let query = spatial_histogram(sample.image(), &self.params);

        let mut best: Option<(Label, f64)> = None;
        for (label, hist) in &model.histograms {
            let d = chi_square_alt(hist, &query);
            let closer = match best {
                None => true,
                Some((_, best_d)) => d.partial_cmp(&best_d) == Some(Ordering::Less),
            };
            if closer {
                best = Some((*label, d));
            }
        }

        let (label, distance) = best.ok_or(ModelError::NotTrained)?;
        let info = &model.labels[label];
        Ok(Prediction {
            label,
            identity: info.identity.clone(),
            sample_count: info.sample_count,
            distance,
        })
    }
}

/// Circular LBP codes with bilinear sampling over the interior of `img`.
///
/// Returns the code image, `(w - 2r) x (h - 2r)`, row-major.
fn lbp_codes(img: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, u32, u32) {
    let (w, h) = img.dimensions();
    let r = radius as i64;
    let out_w = w - 2 * radius;
    let out_h = h - 2 * radius;
    let mut codes = vec![0u32; (out_w * out_h) as usize];
    let px = |x: i64, y: i64| img.get_pixel(x as u32, y as u32).0[0] as f32;

    for n in 0..neighbors {
        let angle = 2.0 * std::f32::consts::PI * n as f32 / neighbors as f32;
        let x = radius as f32 * angle.cos();
        let y = -(radius as f32 * angle.sin());

        let (fx, fy) = (x.floor() as i64, y.floor() as i64);
        let (cx, cy) = (x.ceil() as i64, y.ceil() as i64);
        let tx = x - fx as f32;
        let ty = y - fy as f32;
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..(h as i64 - r) {
            for j in r..(w as i64 - r) {
                let t = w1 * px(j + fx, i + fy)
                    + w2 * px(j + cx, i + fy)
                    + w3 * px(j + fx, i + cy)
                    + w4 * px(j + cx, i + cy);
                let c = px(j, i);
                if t > c || (t - c).abs() < f32::EPSILON {
                    let idx = ((i - r) as u32 * out_w + (j - r) as u32) as usize;
                    codes[idx] |= 1 << n;
                }
            }
        }
    }

    (codes, out_w, out_h)
}

/// Concatenated per-cell code histograms, each normalised to sum to 1.
fn spatial_histogram(img: &GrayImage, params: &LbphParams) -> Histogram {
    let (codes, w, h) = lbp_codes(img, params.radius, params.neighbors);
    let bins = 1u32 << params.neighbors;
    let cell_w = w / params.grid_x;
    let cell_h = h / params.grid_y;
    let cell_pixels = (cell_w * cell_h) as f32;

    let mut out = Histogram::new();
    let mut cell = vec![0u32; bins as usize];
    for gy in 0..params.grid_y {
        for gx in 0..params.grid_x {
            cell.iter_mut().for_each(|c| *c = 0);
            for y in gy * cell_h..(gy + 1) * cell_h {
                let row = (y * w) as usize;
                for x in gx * cell_w..(gx + 1) * cell_w {
                    cell[codes[row + x as usize] as usize] += 1;
                }
            }
            let base = (gy * params.grid_x + gx) * bins;
            out.extend(
                cell.iter()
                    .enumerate()
                    .filter(|&(_, &count)| count > 0)
                    .map(|(code, &count)| (base + code as u32, count as f32 / cell_pixels)),
            );
        }
    }
    out
}

/// `2 * sum((a - b)^2 / (a + b))` over two sparse histograms.
fn chi_square_alt(a: &Histogram, b: &Histogram) -> f64 {
    let mut sum = 0.0f64;
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        let (va, vb) = match (a.get(i), b.get(j)) {
            (Some(&(ba, va)), Some(&(bb, vb))) => match ba.cmp(&bb) {
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                    (va, vb)
                }
                Ordering::Less => {
                    i += 1;
                    (va, 0.0)
                }
                Ordering::Greater => {
                    j += 1;
                    (0.0, vb)
                }
            },
            (Some(&(_, va)), None) => {
                i += 1;
                (va, 0.0)
            }
            (None, Some(&(_, vb))) => {
                j += 1;
                (0.0, vb)
            }
            (None, None) => break,
        };
        let (va, vb) = (va as f64, vb as f64);
        let denom = va + vb;
        if denom.abs() > f64::EPSILON {
            sum += (va - vb) * (va - vb) / denom;
        }
    }
    2.0 * sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::Preprocessor;
    use crate::types::IdentityId;
    use image::{DynamicImage, Luma};

    fn identity(id: i64, name: &str) -> Identity {
        Identity { id: IdentityId(id), name: name.into() }
    }

    fn texture(seed: u32, w: u32, h: u32) -> CanonicalSample {
        let mut state = seed.wrapping_mul(2_654_435_761).max(1);
        let img = GrayImage::from_fn(w, h, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            Luma([(state & 0xff) as u8])
        });
        Preprocessor::new(w).preprocess(&DynamicImage::ImageLuma8(img)).unwrap()
    }

    /// `sample` with a small block overwritten.
    fn blemished(sample: CanonicalSample) -> CanonicalSample {
        let mut img = sample.into_image();
        for y in 10..14 {
            for x in 10..14 {
                img.put_pixel(x, y, Luma([128]));
            }
        }
        CanonicalSample::from_raw_gray(img)
    }

    #[test]
    fn test_untrained_model_reports_no_model() {
        let model = AppearanceModel::default();
        assert!(!model.is_trained());
        assert_eq!(model.predict(&texture(1, 64, 64)), Err(ModelError::NotTrained));
    }

    #[test]
    fn test_empty_corpus_leaves_model_untrained() {
        let mut corpus = TrainingCorpus::new();
        corpus.add_identity(identity(1, "Alice"));
        let model = AppearanceModel::trained(LbphParams::default(), &corpus).unwrap();
        assert!(!model.is_trained());
        assert_eq!(model.predict(&texture(1, 64, 64)), Err(ModelError::NotTrained));
    }

    #[test]
    fn test_exact_sample_has_zero_distance() {
        let mut corpus = TrainingCorpus::new();
        let alice = corpus.add_identity(identity(1, "Alice"));
        let bob = corpus.add_identity(identity(2, "Bob"));
        corpus.add_sample(alice, texture(1, 64, 64));
        corpus.add_sample(bob, texture(2, 64, 64));
        corpus.add_sample(bob, texture(3, 64, 64));

        let model = AppearanceModel::trained(LbphParams::default(), &corpus).unwrap();
        let p = model.predict(&texture(3, 64, 64)).unwrap();
        assert_eq!(p.label, bob);
        assert_eq!(p.identity.name, "Bob");
        assert_eq!(p.sample_count, 2);
        assert!(p.distance.abs() < 1e-9, "distance {}", p.distance);
    }

    #[test]
    fn test_nearest_identity_wins() {
        let mut corpus = TrainingCorpus::new();
        let alice = corpus.add_identity(identity(1, "Alice"));
        let bob = corpus.add_identity(identity(2, "Bob"));
        corpus.add_sample(alice, texture(11, 64, 64));
        corpus.add_sample(bob, texture(12, 64, 64));

        let model = AppearanceModel::trained(LbphParams::default(), &corpus).unwrap();
        let near_alice = model.predict(&blemished(texture(11, 64, 64))).unwrap();
        assert_eq!(near_alice.label, alice);
        assert!(near_alice.distance > 0.0);
        assert_eq!(model.predict(&blemished(texture(12, 64, 64))).unwrap().label, bob);
    }

    #[test]
    fn test_equal_distance_prefers_earliest_sample() {
        let mut corpus = TrainingCorpus::new();
        let first = corpus.add_identity(identity(1, "first"));
        let second = corpus.add_identity(identity(2, "second"));
        corpus.add_sample(first, texture(5, 64, 64));
        corpus.add_sample(second, texture(5, 64, 64));

        let model = AppearanceModel::trained(LbphParams::default(), &corpus).unwrap();
        assert_eq!(model.predict(&texture(5, 64, 64)).unwrap().label, first);
    }

    #[test]
    fn test_retrain_replaces_label_map() {
        let mut first = TrainingCorpus::new();
        let a = first.add_identity(identity(1, "Alice"));
        first.add_sample(a, texture(1, 64, 64));
        let mut model = AppearanceModel::trained(LbphParams::default(), &first).unwrap();
        assert_eq!(model.predict(&texture(1, 64, 64)).unwrap().identity.name, "Alice");

        let mut second = TrainingCorpus::new();
        let c = second.add_identity(identity(3, "Carol"));
        second.add_sample(c, texture(1, 64, 64));
        model.train(&second).unwrap();

        let p = model.predict(&texture(1, 64, 64)).unwrap();
        assert_eq!(p.label, 0);
        assert_eq!(p.identity.name, "Carol");
        assert_eq!(model.labels().len(), 1);
    }

    #[test]
    fn test_size_mismatch_is_reported() {
        let mut corpus = TrainingCorpus::new();
        let a = corpus.add_identity(identity(1, "Alice"));
        corpus.add_sample(a, texture(1, 64, 64));
        let model = AppearanceModel::trained(LbphParams::default(), &corpus).unwrap();
        assert_eq!(
            model.predict(&texture(1, 48, 48)),
            Err(ModelError::SizeMismatch { expected: (64, 64), got: (48, 48) })
        );
    }

    #[test]
    fn test_failed_retrain_keeps_previous_model() {
        let mut good = TrainingCorpus::new();
        let a = good.add_identity(identity(1, "Alice"));
        good.add_sample(a, texture(1, 64, 64));
        let mut model = AppearanceModel::trained(LbphParams::default(), &good).unwrap();

        let mut mixed = TrainingCorpus::new();
        let b = mixed.add_identity(identity(2, "Bob"));
        mixed.add_sample(b, texture(2, 64, 64));
        mixed.add_sample(b, texture(3, 32, 32));
        assert!(matches!(model.train(&mixed), Err(ModelError::SizeMismatch { .. })));
        assert_eq!(model.predict(&texture(1, 64, 64)).unwrap().identity.name, "Alice");
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut corpus = TrainingCorpus::new();
        let a = corpus.add_identity(identity(1, "Alice"));
        corpus.add_sample(a, texture(1, 16, 16));
        let params = LbphParams { grid_x: 20, grid_y: 20, ..LbphParams::default() };
        assert!(matches!(
            AppearanceModel::trained(params, &corpus),
            Err(ModelError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_histogram_cells_are_normalised() {
        let params = LbphParams::default();
        let sample = texture(7, 64, 64);
        let hist = spatial_histogram(sample.image(), &params);
        let total: f64 = hist.iter().map(|&(_, v)| v as f64).sum();
        let cells = (params.grid_x * params.grid_y) as f64;
        assert!((total - cells).abs() < 1e-3, "total {total}");
        assert!(hist.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_flat_image_codes_are_all_ones() {
        let img = GrayImage::from_pixel(10, 10, Luma([90]));
        let (codes, w, h) = lbp_codes(&img, 2, 12);
        assert_eq!((w, h), (6, 6));
        assert!(codes.iter().all(|&c| c == (1 << 12) - 1));
    }

    #[test]
    fn test_chi_square_disjoint_and_identical() {
        let a: Histogram = vec![(0, 1.0)];
        let b: Histogram = vec![(1, 1.0)];
        assert!((chi_square_alt(&a, &a)).abs() < 1e-12);
        assert!((chi_square_alt(&a, &b) - 4.0).abs() < 1e-9);
        assert!((chi_square_alt(&a, &b) - chi_square_alt(&b, &a)).abs() < 1e-12);
    }
}
