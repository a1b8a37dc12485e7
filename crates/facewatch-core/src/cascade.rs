//! Haar cascade object detection (Viola–Jones) over OpenCV cascade files.
//!
//! Reads the "new" OpenCV XML format (`haarcascade_frontalface_default.xml`,
//! `haarcascade_eye.xml`) and scans an image pyramid with variance-normalised
//! Haar features, then groups neighbouring hits the way
//! `CascadeClassifier::detectMultiScale` does.

use crate::types::Region;
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Grouping tolerance for neighbouring hits, relative to rectangle size.
const GROUP_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}; install OpenCV's haarcascades or set FACEWATCH_CASCADE_DIR")]
    NotFound(String),
    #[error("failed to read cascade file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

/// Multi-scale scan parameters, mirroring `detectMultiScale`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScanParams {
    /// Pyramid step between scales; must be > 1.
    pub scale_factor: f64,
    /// A group needs more than this many raw hits to be reported. 0 disables grouping.
    pub min_neighbors: u32,
    /// Smallest reported object size (width, height); (0, 0) means no limit.
    pub min_size: (u32, u32),
    /// Largest reported object size; (0, 0) means the image size.
    pub max_size: (u32, u32),
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 3,
            min_size: (0, 0),
            max_size: (0, 0),
        }
    }
}

/// One weighted rectangle of a Haar feature, in base-window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

/// Internal node of a boosted decision tree.
///
/// `left`/`right` > 0 index another node of the same tree; values <= 0 are
/// leaves, `leaves[-idx]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeNode {
    pub left: i32,
    pub right: i32,
    pub feature: usize,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// A loaded boosted Haar cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct HaarCascade {
    window: (u32, u32),
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Build a cascade from parts, validating feature indices and rectangle bounds.
    pub fn new(
        window: (u32, u32),
        stages: Vec<Stage>,
        features: Vec<HaarFeature>,
    ) -> Result<Self, CascadeError> {
        if window.0 < 3 || window.1 < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {}x{} is too small",
                window.0, window.1
            )));
        }

        for (i, feature) in features.iter().enumerate() {
            for r in &feature.rects {
                if r.x + r.width > window.0 || r.y + r.height > window.1 {
                    return Err(CascadeError::Invalid(format!(
                        "feature {i} rectangle exceeds the {}x{} window",
                        window.0, window.1
                    )));
                }
            }
        }

        for (si, stage) in stages.iter().enumerate() {
            for weak in &stage.classifiers {
                if weak.nodes.is_empty() {
                    return Err(CascadeError::Invalid(format!("stage {si} has an empty tree")));
                }
                for node in &weak.nodes {
                    if node.feature >= features.len() {
                        return Err(CascadeError::Invalid(format!(
                            "stage {si} references feature {} of {}",
                            node.feature,
                            features.len()
                        )));
                    }
                    for child in [node.left, node.right] {
                        let ok = if child > 0 {
                            (child as usize) < weak.nodes.len()
                        } else {
                            ((-child) as usize) < weak.leaves.len()
                        };
                        if !ok {
                            return Err(CascadeError::Invalid(format!(
                                "stage {si} tree child {child} out of range"
                            )));
                        }
                    }
                }
            }
        }

        Ok(Self { window, stages, features })
    }

    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window,
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse the OpenCV "new format" cascade XML.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc.root_element();
        let cascade = root
            .children()
            .find(|n| n.is_element() && child(*n, "stages").is_some())
            .ok_or_else(|| {
                CascadeError::Unsupported(
                    "no <stages> element; only the new OpenCV cascade format is supported".into(),
                )
            })?;

        let feature_type = child(cascade, "featureType").map(text).unwrap_or_default();
        if !feature_type.eq_ignore_ascii_case("HAAR") {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type:?}")));
        }

        let width: u32 = parse_child(cascade, "width")?;
        let height: u32 = parse_child(cascade, "height")?;

        let mut stages = Vec::new();
        for stage_node in items(child_req(cascade, "stages")?) {
            let threshold: f32 = parse_child(stage_node, "stageThreshold")?;
            let mut classifiers = Vec::new();
            for weak_node in items(child_req(stage_node, "weakClassifiers")?) {
                classifiers.push(parse_weak(weak_node)?);
            }
            stages.push(Stage { threshold, classifiers });
        }

        let mut features = Vec::new();
        for feature_node in items(child_req(cascade, "features")?) {
            if let Some(tilted) = child(feature_node, "tilted") {
                if text(tilted) != "0" {
                    return Err(CascadeError::Unsupported("tilted Haar features".into()));
                }
            }
            let mut rects = Vec::new();
            for rect_node in items(child_req(feature_node, "rects")?) {
                let values = numbers::<f32>(rect_node)?;
                let &[x, y, w, h, weight] = values.as_slice() else {
                    return Err(CascadeError::Invalid(format!(
                        "feature rectangle needs 5 values, got {}",
                        values.len()
                    )));
                };
                if x < 0.0 || y < 0.0 || w < 0.0 || h < 0.0 {
                    return Err(CascadeError::Invalid("negative feature rectangle".into()));
                }
                rects.push(WeightedRect {
                    x: x as u32,
                    y: y as u32,
                    width: w as u32,
                    height: h as u32,
                    weight,
                });
            }
            features.push(HaarFeature { rects });
        }

        Self::new((width, height), stages, features)
    }

    /// Base detection window (width, height).
    pub fn window(&self) -> (u32, u32) {
        self.window
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Scan `image` at every pyramid scale and return grouped detections.
    pub fn detect_multi_scale(&self, image: &GrayImage, params: &ScanParams) -> Vec<Region> {
        let raw = self.scan(image, params);
        group_rectangles(raw, params.min_neighbors, GROUP_EPS)
    }

    /// Raw window hits before grouping, in original image coordinates.
    fn scan(&self, image: &GrayImage, params: &ScanParams) -> Vec<Region> {
        let (img_w, img_h) = image.dimensions();
        if img_w == 0 || img_h == 0 || params.scale_factor <= 1.0 {
            return Vec::new();
        }

        let (max_w, max_h) = match params.max_size {
            (0, 0) => (img_w, img_h),
            size => size,
        };
        let (win_w, win_h) = self.window;

        let mut hits = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let window_w = (win_w as f64 * factor).round() as u32;
            let window_h = (win_h as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;

            if scaled_w <= win_w || scaled_h <= win_h {
                break;
            }
            if window_w > max_w || window_h > max_h {
                break;
            }
            if window_w < params.min_size.0 || window_h < params.min_size.1 {
                factor *= params.scale_factor;
                continue;
            }

            let scaled = if scaled_w == img_w && scaled_h == img_h {
                image.clone()
            } else {
                imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle)
            };
            let integral = IntegralImage::new(&scaled);
            let step = if factor > 2.0 { 1 } else { 2 };

            for y in (0..scaled_h - win_h).step_by(step) {
                for x in (0..scaled_w - win_w).step_by(step) {
                    if self.evaluate_window(&integral, x, y) {
                        hits.push(Region::new(
                            (x as f64 * factor).round() as u32,
                            (y as f64 * factor).round() as u32,
                            window_w,
                            window_h,
                        ));
                    }
                }
            }

            factor *= params.scale_factor;
        }

        tracing::trace!(hits = hits.len(), "cascade raw hits");
        hits
    }

    fn evaluate_window(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        let inv_norm = self.variance_norm(integral, x, y);

        for stage in &self.stages {
            let mut stage_sum = 0.0f64;
            for weak in &stage.classifiers {
                stage_sum += self.evaluate_tree(weak, integral, x, y, inv_norm) as f64;
            }
            if stage_sum < stage.threshold as f64 {
                return false;
            }
        }
        true
    }

    /// Reciprocal of `area * stddev` over the window inset by one pixel.
    /// A flat window normalises by 1 and is left to the stage thresholds.
    fn variance_norm(&self, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        let (w, h) = (self.window.0 - 2, self.window.1 - 2);
        let area = (w * h) as f64;
        let sum = integral.sum(x + 1, y + 1, w, h) as f64;
        let sq_sum = integral.sq_sum(x + 1, y + 1, w, h) as f64;

        // area * stddev
        let nf = area * sq_sum - sum * sum;
        if nf > 0.0 {
            1.0 / nf.sqrt()
        } else {
            1.0
        }
    }

    fn evaluate_tree(
        &self,
        weak: &WeakClassifier,
        integral: &IntegralImage,
        x: u32,
        y: u32,
        inv_norm: f64,
    ) -> f32 {
        let mut idx = 0i32;
        loop {
            let node = &weak.nodes[idx as usize];
            let value = self.feature_value(node.feature, integral, x, y) * inv_norm;
            idx = if value < node.threshold as f64 { node.left } else { node.right };
            if idx <= 0 {
                return weak.leaves[(-idx) as usize];
            }
        }
    }

    fn feature_value(&self, feature: usize, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| integral.sum(x + r.x, y + r.y, r.width, r.height) as f64 * r.weight as f64)
            .sum()
    }
}

fn parse_weak(node: roxmltree::Node) -> Result<WeakClassifier, CascadeError> {
    let raw_nodes = numbers::<f64>(child_req(node, "internalNodes")?)?;
    if raw_nodes.is_empty() || raw_nodes.len() % 4 != 0 {
        return Err(CascadeError::Unsupported(format!(
            "internalNodes with {} values (categorical features are not supported)",
            raw_nodes.len()
        )));
    }
    let nodes = raw_nodes
        .chunks_exact(4)
        .map(|c| TreeNode {
            left: c[0] as i32,
            right: c[1] as i32,
            feature: c[2] as usize,
            threshold: c[3] as f32,
        })
        .collect();
    let leaves = numbers::<f32>(child_req(node, "leafValues")?)?;
    Ok(WeakClassifier { nodes, leaves })
}

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn child_req<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Result<roxmltree::Node<'a, 'input>, CascadeError> {
    child(node, name).ok_or_else(|| CascadeError::Invalid(format!("missing <{name}>")))
}

/// Sequence items are `<_>` children in OpenCV's FileStorage XML.
fn items<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    node.children().filter(|n| n.has_tag_name("_"))
}

fn text<'a>(node: roxmltree::Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn parse_child<T: std::str::FromStr>(node: roxmltree::Node, name: &str) -> Result<T, CascadeError> {
    let value = text(child_req(node, name)?);
    value
        .parse()
        .map_err(|_| CascadeError::Invalid(format!("<{name}> is not a number: {value:?}")))
}

fn numbers<T: std::str::FromStr>(node: roxmltree::Node) -> Result<Vec<T>, CascadeError> {
    let joined: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<Vec<_>>()
        .join(" ");
    joined
        .split_whitespace()
        .map(|tok| {
            tok.parse()
                .map_err(|_| CascadeError::Invalid(format!("not a number: {tok:?}")))
        })
        .collect()
}

/// Summed-area tables of pixel values and squared pixel values.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        let raw = image.as_raw();

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sq_sum }
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0]
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sq_sum, self.stride, x, y, w, h)
    }
}

fn similar(a: &Region, b: &Region, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster similar rectangles and keep clusters with more than `min_neighbors`
/// members, reported as the member average. Clusters nested inside a stronger
/// cluster are dropped. `min_neighbors == 0` returns the input unchanged.
pub fn group_rectangles(rects: Vec<Region>, min_neighbors: u32, eps: f64) -> Vec<Region> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    // Cluster ids in order of first appearance.
    let mut cluster_of_root = vec![usize::MAX; n];
    let mut sums: Vec<[u64; 4]> = Vec::new();
    let mut counts: Vec<u32> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find(&mut parent, i);
        if cluster_of_root[root] == usize::MAX {
            cluster_of_root[root] = sums.len();
            sums.push([0; 4]);
            counts.push(0);
        }
        let c = cluster_of_root[root];
        sums[c][0] += r.x as u64;
        sums[c][1] += r.y as u64;
        sums[c][2] += r.width as u64;
        sums[c][3] += r.height as u64;
        counts[c] += 1;
    }

    let averaged: Vec<Region> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &c)| {
            let avg = |v: u64| (v as f64 / c as f64).round() as u32;
            Region::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3]))
        })
        .collect();

    let mut out = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }
        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
            let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            out.push(*r1);
        }
    }
    out
}
