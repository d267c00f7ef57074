//! Indexer: photo bytes → persisted face encodings.
//!
//! Every encoding of a photo comes from one precise-tier run and carries that
//! run's model version. Re-indexing replaces a photo's encodings in a single
//! store transaction; the catalog stamp is written only after that succeeds.

use crate::cascade::{self, ConfidenceLadder};
use crate::extractor::{self, ExtractError, ExtractMode};
use crate::model::{InferenceError, ModelError, Tier};
use crate::registry::ModelRegistry;
use crate::store::{EncodingStore, IndexStamp, PhotoCatalog, StoreError};
use crate::types::{DetectionResult, FaceEncoding, PhotoId};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("model load failed: {0}")]
    Model(#[from] ModelError),
    #[error("no face detected in photo {photo_id}")]
    NoFaceDetected { photo_id: PhotoId },
    #[error("photo {photo_id}: {source}")]
    Decode { photo_id: PhotoId, source: ExtractError },
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("persisting encodings for {photo_id} failed: {source}")]
    Persistence { photo_id: PhotoId, source: StoreError },
    #[error("catalog: {0}")]
    Catalog(StoreError),
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl IndexError {
    /// The input itself is the problem; retrying with the same bytes will not help.
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, IndexError::NoFaceDetected { .. } | IndexError::Decode { .. })
    }
}

/// Outcome of one indexing call.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexReport {
    pub photo_id: PhotoId,
    pub faces: u32,
    pub model_version: String,
    /// Threshold of the ladder rung that found the faces; `None` when skipped.
    pub threshold: Option<f32>,
    /// Bytes and model matched the existing stamp; nothing was re-run.
    pub unchanged: bool,
}

/// Produces and persists face encodings on the precise tier.
#[derive(Clone)]
pub struct Indexer {
    registry: ModelRegistry,
    store: Arc<dyn EncodingStore>,
    catalog: Arc<dyn PhotoCatalog>,
    ladder: ConfidenceLadder,
    max_dimension: u32,
    model_version: String,
}

impl Indexer {
    pub fn new(
        registry: ModelRegistry,
        store: Arc<dyn EncodingStore>,
        catalog: Arc<dyn PhotoCatalog>,
        ladder: ConfidenceLadder,
        max_dimension: u32,
        model_version: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            catalog,
            ladder,
            max_dimension,
            model_version: model_version.into(),
        }
    }

    /// Index one photo, replacing any encodings it already has.
    ///
    /// With `force == false`, a photo whose bytes and model version match its
    /// current stamp is left alone.
    pub async fn index_photo(&self, photo_id: &str, bytes: Vec<u8>, force: bool) -> Result<IndexReport, IndexError> {
        let digest = content_digest(&bytes);

        if !force {
            if let Some(stamp) = self.catalog.index_stamp(photo_id).await.map_err(IndexError::Catalog)? {
                if stamp.content_digest == digest && stamp.model_version == self.model_version {
                    tracing::debug!(photo_id, "photo unchanged since last index");
                    return Ok(IndexReport {
                        photo_id: photo_id.to_string(),
                        faces: stamp.face_count,
                        model_version: stamp.model_version,
                        threshold: None,
                        unchanged: true,
                    });
                }
            }
        }

        let engine = self.registry.ensure_loaded(Tier::Precise).await?;
        let ladder = self.ladder.clone();
        let max_dimension = self.max_dimension;

        let detection = tokio::task::spawn_blocking(move || {
            let image = extractor::decode(&bytes).map_err(Detect::Decode)?;
            let prepared = extractor::prepare(image, max_dimension);
            cascade::detect(engine.as_ref(), &prepared, &ladder, ExtractMode::All)
                .map_err(Detect::Inference)
                .map(|outcome| (outcome, engine.model_version().to_string()))
        })
        .await?;

        let (outcome, model_version) = match detection {
            Ok(found) => found,
            Err(Detect::Decode(source)) => {
                return Err(IndexError::Decode { photo_id: photo_id.to_string(), source })
            }
            Err(Detect::Inference(err)) => return Err(err.into()),
        };

        let Some(outcome) = outcome else {
            // Encodings from earlier bytes no longer describe this photo.
            let removed = self
                .store
                .delete_encodings(photo_id)
                .await
                .map_err(|source| IndexError::Persistence { photo_id: photo_id.to_string(), source })?;
            self.catalog.clear_indexed(photo_id).await.map_err(IndexError::Catalog)?;
            tracing::info!(photo_id, removed, "no face detected after full ladder");
            return Err(IndexError::NoFaceDetected { photo_id: photo_id.to_string() });
        };

        let encodings = to_encodings(photo_id, &outcome.found, &model_version);
        self.store
            .replace_encodings(photo_id, &encodings)
            .await
            .map_err(|source| IndexError::Persistence { photo_id: photo_id.to_string(), source })?;

        let stamp = IndexStamp {
            model_version: model_version.clone(),
            content_digest: digest,
            face_count: encodings.len() as u32,
            indexed_at: Utc::now(),
        };
        self.catalog.mark_indexed(photo_id, &stamp).await.map_err(IndexError::Catalog)?;

        tracing::info!(
            photo_id,
            faces = encodings.len(),
            threshold = outcome.threshold,
            version = %model_version,
            "photo indexed"
        );

        Ok(IndexReport {
            photo_id: photo_id.to_string(),
            faces: stamp.face_count,
            model_version,
            threshold: Some(outcome.threshold),
            unchanged: false,
        })
    }

    /// Remove a deleted photo's encodings and indexed stamp.
    pub async fn forget(&self, photo_id: &str) -> Result<usize, IndexError> {
        let removed = self
            .store
            .delete_encodings(photo_id)
            .await
            .map_err(|source| IndexError::Persistence { photo_id: photo_id.to_string(), source })?;
        self.catalog.clear_indexed(photo_id).await.map_err(IndexError::Catalog)?;
        tracing::info!(photo_id, removed, "photo forgotten");
        Ok(removed)
    }

    /// Photos indexed under a model version other than the current one.
    pub async fn stale_photos(&self) -> Result<Vec<PhotoId>, IndexError> {
        self.catalog
            .stale_photos(&self.model_version)
            .await
            .map_err(IndexError::Catalog)
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }
}

/// Failures from the blocking detection job, split so decode errors keep the photo id.
enum Detect {
    Decode(ExtractError),
    Inference(InferenceError),
}

fn to_encodings(photo_id: &str, result: &DetectionResult, model_version: &str) -> Vec<FaceEncoding> {
    result
        .faces
        .iter()
        .enumerate()
        .map(|(i, face)| FaceEncoding {
            photo_id: photo_id.to_string(),
            face_index: i as u32,
            embedding: face.embedding.values.clone(),
            bounding_box: face.bounding_box,
            quality_score: face.quality_score,
            model_version: model_version.to_string(),
        })
        .collect()
}

fn content_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}
