//! Per-frame recognition orchestration.
//!
//! verify regions → crop → preprocess → predict → score/threshold → smooth
//! → record. One frame is fully processed before the next one is pulled.

use crate::config::PipelineConfig;
use crate::confidence::ConfidenceConfig;
use crate::detector::FaceLocator;
use crate::enrollment::build_corpus;
use crate::ports::{Datastore, EventSink, FrameSource, ImageCodec, PortError};
use crate::preprocess::{CanonicalSample, Preprocessor};
use crate::recognizer::{AppearanceModel, Classifier, LbphParams, ModelError};
use crate::smoother::{Decision, TemporalSmoother};
use crate::types::{Identity, IdentityId, Observation, Region};
use image::DynamicImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetrainError {
    #[error("could not rebuild enrollment corpus: {0}")]
    Corpus(#[from] PortError),
    #[error("could not train appearance model: {0}")]
    Model(#[from] ModelError),
}

/// What the orchestrator does with each confirmed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Locate and verify faces only.
    Detect,
    /// Locate faces and return canonical samples for enrollment.
    Capture,
    /// Full recognition with smoothing and event recording.
    Recognize,
}

/// Result for one confirmed region.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Detected,
    Captured(CanonicalSample),
    Recognized {
        /// Thresholded single-frame observation.
        raw: Observation,
        /// What the smoother made of it.
        decision: Decision,
        /// Whether an event was handed to the sink for this decision.
        recorded: bool,
    },
    /// Nobody is enrolled yet.
    NoModel,
    /// The crop could not be turned into a sample.
    Unusable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceReport {
    pub region: Region,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub faces: Vec<FaceReport>,
}

impl FrameReport {
    pub fn events_recorded(&self) -> usize {
        self.faces
            .iter()
            .filter(|f| matches!(f.outcome, Outcome::Recognized { recorded: true, .. }))
            .count()
    }
}

/// Totals for one [`Orchestrator::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: usize,
    pub missing_frames: usize,
    pub faces: usize,
    pub events: usize,
}

pub struct Orchestrator<'s, L, C> {
    locator: L,
    classifier: C,
    preprocessor: Preprocessor,
    confidence: ConfidenceConfig,
    smoother: TemporalSmoother,
    lbph: LbphParams,
    sink: Option<Box<dyn EventSink + 's>>,
    min_event_interval: Duration,
    last_event: HashMap<IdentityId, Instant>,
}

impl<'s, L: FaceLocator, C: Classifier> Orchestrator<'s, L, C> {
    pub fn new(locator: L, classifier: C, config: &PipelineConfig) -> Self {
        Self {
            locator,
            classifier,
            preprocessor: Preprocessor::new(config.canonical_size),
            confidence: config.confidence,
            smoother: TemporalSmoother::new(config.smoothing),
            lbph: config.lbph,
            sink: None,
            min_event_interval: Duration::from_secs(config.min_event_interval_secs),
            last_event: HashMap::new(),
        }
    }

    /// Deliver stable recognitions to `sink`.
    pub fn with_sink(mut self, sink: impl EventSink + 's) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn smoother(&self) -> &TemporalSmoother {
        &self.smoother
    }

    /// Swap in a new classifier. The smoothing window is kept: observations
    /// carry identities, not labels.
    pub fn replace_classifier(&mut self, classifier: C) {
        self.classifier = classifier;
    }

    /// Process one frame. A missing or empty frame yields an empty report.
    pub fn process_frame(&mut self, frame: Option<&DynamicImage>, mode: Mode) -> FrameReport {
        let Some(frame) = frame else {
            return FrameReport::default();
        };
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            return FrameReport::default();
        }

        let regions = self.locator.locate(frame);
        let mut report = FrameReport { faces: Vec::with_capacity(regions.len()) };

        for region in regions.into_iter().filter_map(|r| r.clamp_to(width, height)) {
            let outcome = match mode {
                Mode::Detect => Outcome::Detected,
                Mode::Capture => self.capture(frame, &region),
                Mode::Recognize => self.recognize(frame, &region),
            };
            report.faces.push(FaceReport { region, outcome });
        }
        report
    }

    /// Pull frames until the source is exhausted or `stop` is raised.
    ///
    /// Missing frames are skipped. A failing source ends the run with its error.
    pub fn run<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        mode: Mode,
        stop: &AtomicBool,
        mut on_report: impl FnMut(&FrameReport),
    ) -> Result<RunSummary, PortError> {
        let mut summary = RunSummary::default();
        while !stop.load(Ordering::Relaxed) && !source.is_exhausted() {
            let Some(frame) = source.next_frame()? else {
                summary.missing_frames += 1;
                continue;
            };
            let report = self.process_frame(Some(&frame), mode);
            summary.frames += 1;
            summary.faces += report.faces.len();
            summary.events += report.events_recorded();
            on_report(&report);
        }
        tracing::debug!(?summary, "frame loop finished");
        Ok(summary)
    }

    fn crop(frame: &DynamicImage, region: &Region) -> DynamicImage {
        frame.crop_imm(region.x, region.y, region.width, region.height)
    }

    fn capture(&self, frame: &DynamicImage, region: &Region) -> Outcome {
        match self.preprocessor.preprocess(&Self::crop(frame, region)) {
            Ok(sample) => Outcome::Captured(sample),
            Err(e) => {
                tracing::debug!(error = %e, "capture crop unusable");
                Outcome::Unusable
            }
        }
    }

    fn recognize(&mut self, frame: &DynamicImage, region: &Region) -> Outcome {
        let crop = Self::crop(frame, region);
        let sample = match self.preprocessor.preprocess(&crop) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::debug!(error = %e, "recognition crop unusable");
                return Outcome::Unusable;
            }
        };

        let prediction = match self.classifier.predict(&sample) {
            Ok(p) => p,
            Err(ModelError::NotTrained) => return Outcome::NoModel,
            Err(e) => {
                tracing::warn!(error = %e, "prediction failed");
                return Outcome::Unusable;
            }
        };

        let confidence = self.confidence.score(prediction.distance);
        let threshold = self.confidence.threshold(prediction.sample_count);
        let raw = if self.confidence.accepts(confidence, prediction.sample_count) {
            Observation::known(prediction.identity, confidence)
        } else {
            Observation::unknown(confidence)
        };
        tracing::debug!(
            claim = %raw.claim,
            distance = prediction.distance,
            confidence,
            threshold,
            "face scored"
        );

        let decision = self.smoother.observe(raw.clone());
        let recorded = match &decision {
            Decision::Stable(obs) => match obs.claim.identity() {
                Some(identity) => self.maybe_record(identity, &crop, obs.confidence),
                None => false,
            },
            Decision::PassThrough(_) => false,
        };

        Outcome::Recognized { raw, decision, recorded }
    }

    fn maybe_record(&mut self, identity: &Identity, crop: &DynamicImage, confidence: f32) -> bool {
        let Some(sink) = self.sink.as_ref() else {
            return false;
        };

        let now = Instant::now();
        if let Some(last) = self.last_event.get(&identity.id) {
            if now.duration_since(*last) < self.min_event_interval {
                return false;
            }
        }

        match sink.record(identity, crop, confidence) {
            Ok(()) => {
                tracing::info!(identity = %identity.name, confidence, "recognition recorded");
                self.last_event.insert(identity.id, now);
                true
            }
            Err(e) => {
                tracing::warn!(identity = %identity.name, error = %e, "failed to record recognition");
                false
            }
        }
    }
}

impl<'s, L: FaceLocator> Orchestrator<'s, L, AppearanceModel> {
    /// Rebuild the corpus from the datastore, train a fresh model and swap
    /// it in. On failure the current model stays in place.
    pub fn retrain(&mut self, datastore: &dyn Datastore, codec: &dyn ImageCodec) -> Result<(), RetrainError> {
        let corpus = build_corpus(datastore, codec, &self.preprocessor)?;
        let model = AppearanceModel::trained(self.lbph, &corpus)?;
        self.replace_classifier(model);
        Ok(())
    }
}
