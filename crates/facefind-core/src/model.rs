//! Detector tiers and the inference capability behind them.
//!
//! A [`FaceEngine`] is one detector/embedder pair. Engines are immutable once
//! loaded and are shared across requests behind an `Arc`.

use crate::config::TierSettings;
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Speed/accuracy configuration of the detection stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Low latency, lower accuracy. Used for face-presence previews only.
    Fast,
    /// Higher accuracy. Used for every embedding that is indexed or searched.
    Precise,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Fast, Tier::Precise];
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Fast => "fast",
            Tier::Precise => "precise",
        })
    }
}

/// Failure to bring a tier up. Cloned to every caller waiting on the same load.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("{tier} tier: model artifact not found: {path}")]
    ArtifactMissing { tier: Tier, path: String },
    #[error("{tier} tier: backend initialization failed: {reason}")]
    Backend { tier: Tier, reason: String },
    #[error("{tier} tier: load timed out after {after:?}")]
    Timeout { tier: Tier, after: Duration },
    #[error("{tier} tier: load was abandoned before completing")]
    Abandoned { tier: Tier },
}

impl ModelError {
    /// Timeouts and abandoned loads may succeed on a later attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ModelError::Timeout { .. } | ModelError::Abandoned { .. })
    }
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("inference session poisoned by an earlier panic")]
    Poisoned,
}

/// A loaded detector/embedder pair.
pub trait FaceEngine: Send + Sync {
    /// Tag stamped on every embedding this engine produces.
    fn model_version(&self) -> &str;

    /// Detect faces above `min_confidence`, sorted by descending confidence,
    /// in the pixel space of `image`.
    fn detect(&self, image: &RgbImage, min_confidence: f32) -> Result<Vec<BoundingBox>, InferenceError>;

    /// Embed one face previously returned by [`detect`](Self::detect) on the same image.
    fn embed(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, InferenceError>;
}

/// Blocking constructor for tier engines. Called on the blocking pool.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, tier: Tier) -> Result<Arc<dyn FaceEngine>, ModelError>;
}

/// SCRFD + ArcFace over ONNX Runtime.
///
/// `ort` sessions need exclusive access to run, so each one sits behind its
/// own mutex; detection and embedding of different requests can still overlap.
pub struct OnnxFaceEngine {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
    model_version: String,
}

impl OnnxFaceEngine {
    pub fn load(model_dir: &Path, tier: Tier, settings: &TierSettings) -> Result<Self, ModelError> {
        let detector_path = model_dir.join(&settings.detector_file);
        let embedder_path = model_dir.join(&settings.embedder_file);
        for path in [&detector_path, &embedder_path] {
            if !path.exists() {
                return Err(ModelError::ArtifactMissing {
                    tier,
                    path: path.display().to_string(),
                });
            }
        }

        let backend = |reason: String| ModelError::Backend { tier, reason };
        let detector = FaceDetector::load(&detector_path, settings.input_size as usize)
            .map_err(|e| backend(e.to_string()))?;
        let recognizer = FaceRecognizer::load(&embedder_path).map_err(|e| backend(e.to_string()))?;

        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
            model_version: settings.model_version.clone(),
        })
    }
}

impl FaceEngine for OnnxFaceEngine {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn detect(&self, image: &RgbImage, min_confidence: f32) -> Result<Vec<BoundingBox>, InferenceError> {
        let mut detector = self.detector.lock().map_err(|_| InferenceError::Poisoned)?;
        Ok(detector.detect(image, min_confidence)?)
    }

    fn embed(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, InferenceError> {
        let mut recognizer = self.recognizer.lock().map_err(|_| InferenceError::Poisoned)?;
        Ok(recognizer.extract(image, face, &self.model_version)?)
    }
}

/// Loads tier engines from ONNX files in a model directory.
pub struct OnnxModelLoader {
    model_dir: PathBuf,
    fast: TierSettings,
    precise: TierSettings,
}

impl OnnxModelLoader {
    pub fn new(model_dir: impl Into<PathBuf>, fast: TierSettings, precise: TierSettings) -> Self {
        Self {
            model_dir: model_dir.into(),
            fast,
            precise,
        }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, tier: Tier) -> Result<Arc<dyn FaceEngine>, ModelError> {
        let settings = match tier {
            Tier::Fast => &self.fast,
            Tier::Precise => &self.precise,
        };
        tracing::info!(%tier, dir = %self.model_dir.display(), version = %settings.model_version, "loading tier");
        let engine = OnnxFaceEngine::load(&self.model_dir, tier, settings)?;
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_artifacts_fail_before_backend() {
        let loader = OnnxModelLoader::new(
            "/nonexistent/facefind-models",
            TierSettings::fast(),
            TierSettings::precise(),
        );
        match loader.load(Tier::Precise) {
            Err(ModelError::ArtifactMissing { tier, path }) => {
                assert_eq!(tier, Tier::Precise);
                assert!(path.ends_with("det_10g.onnx"), "{path}");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("load must fail without artifacts"),
        }
    }

    #[test]
    fn test_tier_display_and_serde() {
        #[derive(Serialize, Deserialize)]
        struct Doc {
            tier: Tier,
        }
        assert_eq!(Tier::Fast.to_string(), "fast");
        let doc = toml::to_string(&Doc { tier: Tier::Precise }).unwrap();
        assert_eq!(doc.trim(), r#"tier = "precise""#);
        let back: Doc = toml::from_str(r#"tier = "fast""#).unwrap();
        assert_eq!(back.tier, Tier::Fast);
    }

    #[test]
    fn test_retriable_errors() {
        assert!(ModelError::Timeout { tier: Tier::Fast, after: Duration::from_secs(1) }.is_retriable());
        assert!(!ModelError::ArtifactMissing { tier: Tier::Fast, path: "x".into() }.is_retriable());
    }
}
