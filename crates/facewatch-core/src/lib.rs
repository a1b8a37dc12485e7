//! facewatch-core: Face verification and recognition engine.
//!
//! Haar cascades (face, then eye) propose and confirm face regions; an LBPH
//! model identifies them; a confidence threshold that grows with enrollment
//! evidence and a majority-vote window stabilise the per-frame decisions.

pub mod cascade;
pub mod confidence;
pub mod config;
pub mod detector;
pub mod enrollment;
pub mod pipeline;
pub mod ports;
pub mod preprocess;
pub mod recognizer;
pub mod smoother;
pub mod types;

pub use config::{Config, ConfigError, PipelineConfig};
pub use detector::{FaceLocator, RegionVerifier};
pub use pipeline::{FrameReport, Mode, Orchestrator, Outcome, RetrainError};
pub use ports::{Datastore, EventSink, FrameSource, ImageCodec, PortError};
pub use preprocess::{CanonicalSample, Preprocessor};
pub use recognizer::{AppearanceModel, Classifier, ModelError};
pub use types::{Claim, Identity, IdentityId, ImageRef, Observation, RecognitionEvent, Region};
