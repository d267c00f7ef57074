//! Query pipeline: one end-user photo → one query embedding.
//!
//! Queries always run on the precise tier so they live in the same embedding
//! space as the index. The fast tier only answers "is there a face here?"
//! previews and never produces an embedding.

use crate::cascade::{self, ConfidenceLadder};
use crate::extractor::{self, ExtractError, ExtractMode};
use crate::model::{InferenceError, ModelError, Tier};
use crate::registry::ModelRegistry;
use crate::types::{DetectedFace, Embedding, PixelRect};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("model load failed: {0}")]
    Model(#[from] ModelError),
    #[error("no face in query image")]
    NoFaceInQuery,
    #[error("query image: {0}")]
    Decode(#[from] ExtractError),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl QueryError {
    /// The query photo itself is the problem; a different photo is needed.
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, QueryError::NoFaceInQuery | QueryError::Decode(_))
    }
}

/// Coarse, human-readable progress of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadingModels,
    AnalyzingFace,
    Searching,
    Filtering,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::LoadingModels => "loading models",
            Stage::AnalyzingFace => "analyzing face",
            Stage::Searching => "searching library",
            Stage::Filtering => "filtering matches",
        })
    }
}

/// Optional progress channel. Emitting never blocks and ignores a gone receiver.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink(Option<mpsc::UnboundedSender<Stage>>);

impl ProgressSink {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Stage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    pub fn emit(&self, stage: Stage) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(stage);
        }
    }
}

/// The face chosen from a query photo.
#[derive(Debug, Clone)]
pub struct QueryFace {
    pub embedding: Embedding,
    pub bounding_box: PixelRect,
    pub quality_score: f32,
}

#[derive(Clone)]
pub struct QueryPipeline {
    registry: ModelRegistry,
    ladder: ConfidenceLadder,
    precise_max_dimension: u32,
    fast_max_dimension: u32,
}

impl QueryPipeline {
    pub fn new(
        registry: ModelRegistry,
        ladder: ConfidenceLadder,
        precise_max_dimension: u32,
        fast_max_dimension: u32,
    ) -> Self {
        Self {
            registry,
            ladder,
            precise_max_dimension,
            fast_max_dimension,
        }
    }

    /// Extract the single best face of a query photo on the precise tier.
    pub async fn embed(&self, bytes: Vec<u8>, progress: &ProgressSink) -> Result<QueryFace, QueryError> {
        if !self.registry.is_loaded(Tier::Precise) {
            progress.emit(Stage::LoadingModels);
        }
        let engine = self.registry.ensure_loaded(Tier::Precise).await?;

        progress.emit(Stage::AnalyzingFace);
        let ladder = self.ladder.clone();
        let max_dimension = self.precise_max_dimension;
        let outcome = tokio::task::spawn_blocking(move || -> Result<_, QueryError> {
            let prepared = extractor::prepare(extractor::decode(&bytes)?, max_dimension);
            Ok(cascade::detect(engine.as_ref(), &prepared, &ladder, ExtractMode::Best)?)
        })
        .await??;

        let face: DetectedFace = outcome
            .and_then(|o| o.found.faces.into_iter().next())
            .ok_or(QueryError::NoFaceInQuery)?;

        tracing::debug!(quality = face.quality_score, "query face selected");

        Ok(QueryFace {
            embedding: face.embedding,
            bounding_box: face.bounding_box,
            quality_score: face.quality_score,
        })
    }

    /// Fast-tier face presence check. Returns detected boxes in source pixels.
    pub async fn preview(&self, bytes: Vec<u8>) -> Result<Vec<PixelRect>, QueryError> {
        let engine = self.registry.ensure_loaded(Tier::Fast).await?;
        let max_dimension = self.fast_max_dimension;

        tokio::task::spawn_blocking(move || -> Result<_, QueryError> {
            let prepared = extractor::prepare(extractor::decode(&bytes)?, max_dimension);
            let boxes = engine.detect(&prepared.image, crate::detector::DEFAULT_CONFIDENCE)?;
            Ok(boxes
                .iter()
                .map(|b| PixelRect::from_scaled(b, prepared.scale, prepared.source_width, prepared.source_height))
                .collect())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{png_bytes, FakeEngine, FakeLoader};
    use std::sync::Arc;
    use std::time::Duration;

    fn pipeline(loader: Arc<FakeLoader>) -> QueryPipeline {
        let registry = ModelRegistry::new(loader, Duration::from_secs(5), false);
        QueryPipeline::new(registry, ConfidenceLadder::query_default(), 1600, 640)
    }

    #[tokio::test]
    async fn test_embed_uses_best_precise_face() {
        let loader = Arc::new(
            FakeLoader::new()
                .serving(FakeEngine::new("precise").with_face(0.6).with_face(0.95))
                .serving_fast(FakeEngine::new("fast").with_face(0.99)),
        );
        let (sink, mut rx) = ProgressSink::channel();

        let face = pipeline(loader).embed(png_bytes(200, 200), &sink).await.unwrap();
        assert_eq!(face.embedding.model_version, "precise");
        assert_eq!(face.quality_score, 0.95);
        assert_eq!(face.embedding.values, FakeEngine::identity(1));

        assert_eq!(rx.recv().await, Some(Stage::LoadingModels));
        assert_eq!(rx.recv().await, Some(Stage::AnalyzingFace));
    }

    #[tokio::test]
    async fn test_no_face_is_distinct_error() {
        let loader = Arc::new(FakeLoader::new().serving(FakeEngine::new("precise")));
        let err = pipeline(loader).embed(png_bytes(200, 200), &ProgressSink::none()).await.unwrap_err();
        assert!(matches!(err, QueryError::NoFaceInQuery));
        assert!(err.is_user_correctable());
        assert_eq!(err.to_string(), "no face in query image");
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let loader = Arc::new(FakeLoader::new().failing_first(1));
        let err = pipeline(loader).embed(png_bytes(32, 32), &ProgressSink::none()).await.unwrap_err();
        assert!(matches!(err, QueryError::Model(_)));
        assert!(!err.is_user_correctable());
    }

    #[tokio::test]
    async fn test_preview_uses_fast_tier_only() {
        let loader = Arc::new(
            FakeLoader::new()
                .serving(FakeEngine::new("precise").with_face(0.9))
                .serving_fast(FakeEngine::new("fast").with_face(0.9).with_face(0.8)),
        );
        let pipeline = pipeline(loader.clone());

        let boxes = pipeline.preview(png_bytes(200, 200)).await.unwrap();
        assert_eq!(boxes.len(), 2);
        assert!(pipeline.registry.is_loaded(Tier::Fast));
        assert!(!pipeline.registry.is_loaded(Tier::Precise));
    }

    #[test]
    fn test_progress_without_receiver_is_silent() {
        let (sink, rx) = ProgressSink::channel();
        drop(rx);
        sink.emit(Stage::Searching);
        ProgressSink::none().emit(Stage::Filtering);
        assert_eq!(Stage::Searching.to_string(), "searching library");
    }
}
