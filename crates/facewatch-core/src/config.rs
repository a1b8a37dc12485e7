use crate::cascade::ScanParams;
use crate::confidence::ConfidenceConfig;
use crate::detector::{DEFAULT_EYE_SCAN, DEFAULT_FACE_SCAN};
use crate::preprocess::DEFAULT_CANONICAL_SIZE;
use crate::recognizer::LbphParams;
use crate::smoother::SmootherConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CASCADE_DIR: &str = "/usr/share/opencv4/haarcascades";
pub const DEFAULT_PLACE: &str = "Default Location";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Every tunable of the recognition pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub face_scan: ScanParams,
    pub eye_scan: ScanParams,
    pub canonical_size: u32,
    pub lbph: LbphParams,
    pub confidence: ConfidenceConfig,
    pub smoothing: SmootherConfig,
    /// Minimum seconds between two recorded events for the same identity.
    /// 0 records every stable recognition.
    pub min_event_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            face_scan: DEFAULT_FACE_SCAN,
            eye_scan: DEFAULT_EYE_SCAN,
            canonical_size: DEFAULT_CANONICAL_SIZE,
            lbph: LbphParams::default(),
            confidence: ConfidenceConfig::default(),
            smoothing: SmootherConfig::default(),
            min_event_interval_secs: 0,
        }
    }
}

/// Deployment configuration: the pipeline plus where things live.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory for the database and stored images.
    pub data_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory holding the OpenCV Haar cascade XML files.
    pub cascade_dir: PathBuf,
    /// Name of the place recognition events are recorded at.
    pub place: String,
    /// Frames to discard after opening the camera (AGC/AE settling).
    pub warmup_frames: usize,
    pub pipeline: PipelineConfig,
}

/// On-disk layout of `FACEWATCH_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    camera_device: Option<String>,
    data_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    cascade_dir: Option<PathBuf>,
    place: Option<String>,
    warmup_frames: Option<usize>,
    pipeline: PipelineConfig,
}

impl Config {
    /// Load from the optional TOML file named by `FACEWATCH_CONFIG`, then
    /// apply `FACEWATCH_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("FACEWATCH_CONFIG") {
            Some(path) => Some(read_file(Path::new(&path))?),
            None => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build from TOML text (if any) and an environment lookup.
    pub fn from_sources(
        toml_text: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = match toml_text {
            Some(text) => toml::from_str(text)?,
            None => FileConfig::default(),
        };

        let data_dir = env("FACEWATCH_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));
        let db_path = env("FACEWATCH_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("facewatch.db"));

        let mut pipeline = file.pipeline;
        let confidence = &mut pipeline.confidence;
        confidence.base_threshold = parse_or(&env, "FACEWATCH_BASE_THRESHOLD", confidence.base_threshold);
        confidence.threshold_cap = parse_or(&env, "FACEWATCH_THRESHOLD_CAP", confidence.threshold_cap);
        confidence.max_distance = parse_or(&env, "FACEWATCH_MAX_DISTANCE", confidence.max_distance);
        pipeline.smoothing.majority_share =
            parse_or(&env, "FACEWATCH_MAJORITY_SHARE", pipeline.smoothing.majority_share);
        pipeline.min_event_interval_secs =
            parse_or(&env, "FACEWATCH_EVENT_INTERVAL_SECS", pipeline.min_event_interval_secs);

        Ok(Self {
            camera_device: env("FACEWATCH_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            data_dir,
            db_path,
            cascade_dir: env("FACEWATCH_CASCADE_DIR")
                .map(PathBuf::from)
                .or(file.cascade_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CASCADE_DIR)),
            place: env("FACEWATCH_PLACE")
                .or(file.place)
                .unwrap_or_else(|| DEFAULT_PLACE.to_string()),
            warmup_frames: parse_or(&env, "FACEWATCH_WARMUP_FRAMES", file.warmup_frames.unwrap_or(4)),
            pipeline,
        })
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
}

fn parse_or<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_sources(None, env_of(&[("HOME", "/home/ana")])).unwrap();
        assert_eq!(cfg.camera_device, "/dev/video0");
        assert_eq!(cfg.data_dir, PathBuf::from("/home/ana/.local/share/facewatch"));
        assert_eq!(cfg.db_path, cfg.data_dir.join("facewatch.db"));
        assert_eq!(cfg.cascade_dir, PathBuf::from(DEFAULT_CASCADE_DIR));
        assert_eq!(cfg.place, DEFAULT_PLACE);
        assert_eq!(cfg.pipeline, PipelineConfig::default());
        assert_eq!(cfg.pipeline.face_scan.min_neighbors, 5);
        assert_eq!(cfg.pipeline.smoothing.window_capacity, 10);
    }

    #[test]
    fn test_xdg_data_home() {
        let cfg = Config::from_sources(None, env_of(&[("XDG_DATA_HOME", "/srv/data")])).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/data/facewatch"));
    }

    #[test]
    fn test_toml_file_then_env_override() {
        let text = r#"
            camera_device = "/dev/video4"
            place = "Lobby"

            [pipeline]
            min_event_interval_secs = 30

            [pipeline.confidence]
            base_threshold = 60.0

            [pipeline.smoothing]
            window_capacity = 12
        "#;
        let env = env_of(&[
            ("FACEWATCH_PLACE", "Front door"),
            ("FACEWATCH_THRESHOLD_CAP", "75"),
            ("FACEWATCH_MAJORITY_SHARE", "not-a-number"),
        ]);
        let cfg = Config::from_sources(Some(text), env).unwrap();

        assert_eq!(cfg.camera_device, "/dev/video4");
        assert_eq!(cfg.place, "Front door");
        assert_eq!(cfg.pipeline.min_event_interval_secs, 30);
        assert_eq!(cfg.pipeline.confidence.base_threshold, 60.0);
        assert_eq!(cfg.pipeline.confidence.threshold_cap, 75.0);
        assert_eq!(cfg.pipeline.confidence.per_sample_increment, 2.0);
        assert_eq!(cfg.pipeline.smoothing.window_capacity, 12);
        assert_eq!(cfg.pipeline.smoothing.min_observations, 5);
        assert!((cfg.pipeline.smoothing.majority_share - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_toml() {
        let err = Config::from_sources(Some("pipeline = 3"), env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = read_file(Path::new("/nonexistent/facewatch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
