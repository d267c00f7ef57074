//! Persistence and vector-search seams.
//!
//! The pipelines only see these traits. `facefind-store` provides the SQLite
//! implementation; [`MemoryStore`] backs tests and in-process embedding.

use crate::types::{cosine_distance, FaceEncoding, MatchCandidate, PhotoId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store refused the write (constraint violation, bad data).
    #[error("store rejected write: {0}")]
    Rejected(String),
    /// The store could not be reached or failed mid-operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Stored data could not be read back.
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

/// Record that a photo was fully indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStamp {
    pub model_version: String,
    /// Hex SHA-256 of the indexed image bytes.
    pub content_digest: String,
    pub face_count: u32,
    pub indexed_at: DateTime<Utc>,
}

/// Nearest-neighbour request. Only encodings of `model_version` are compared.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub embedding: Vec<f32>,
    pub model_version: String,
    pub max_distance: f32,
    pub limit: usize,
}

/// Table of face encodings keyed by `(photo_id, face_index)`.
#[async_trait]
pub trait EncodingStore: Send + Sync {
    /// Atomically replace every encoding of `photo_id` with `encodings`.
    /// On error nothing has changed.
    async fn replace_encodings(&self, photo_id: &str, encodings: &[FaceEncoding]) -> Result<(), StoreError>;

    /// Delete every encoding of `photo_id`, returning how many were removed.
    async fn delete_encodings(&self, photo_id: &str) -> Result<usize, StoreError>;

    async fn count_encodings(&self, photo_id: &str) -> Result<usize, StoreError>;
}

/// The "indexed" flag on photo records, with the stamp that justifies it.
#[async_trait]
pub trait PhotoCatalog: Send + Sync {
    async fn index_stamp(&self, photo_id: &str) -> Result<Option<IndexStamp>, StoreError>;

    async fn mark_indexed(&self, photo_id: &str, stamp: &IndexStamp) -> Result<(), StoreError>;

    async fn clear_indexed(&self, photo_id: &str) -> Result<(), StoreError>;

    /// Indexed photos whose stamp names a different model version.
    async fn stale_photos(&self, model_version: &str) -> Result<Vec<PhotoId>, StoreError>;
}

/// Candidate generation over stored encodings, ascending by distance.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn nearest(&self, query: &VectorQuery) -> Result<Vec<MatchCandidate>, StoreError>;
}

/// Exact top-k over `(photo_id, embedding)` rows: cosine distance, ceiling, sort, truncate.
pub fn exact_nearest<'a>(
    rows: impl IntoIterator<Item = (&'a str, &'a [f32])>,
    query: &VectorQuery,
) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = rows
        .into_iter()
        .map(|(photo_id, embedding)| MatchCandidate::new(photo_id, cosine_distance(&query.embedding, embedding)))
        .filter(|c| c.distance <= query.max_distance)
        .collect();
    candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    candidates.truncate(query.limit);
    candidates
}

#[derive(Default)]
struct MemoryState {
    encodings: HashMap<PhotoId, Vec<FaceEncoding>>,
    stamps: HashMap<PhotoId, IndexStamp>,
}

/// In-process store implementing all three seams.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored encodings for one photo, in face order.
    pub fn encodings(&self, photo_id: &str) -> Vec<FaceEncoding> {
        self.state().encodings.get(photo_id).cloned().unwrap_or_default()
    }

    /// Total encodings across all photos.
    pub fn total_encodings(&self) -> usize {
        self.state().encodings.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EncodingStore for MemoryStore {
    async fn replace_encodings(&self, photo_id: &str, encodings: &[FaceEncoding]) -> Result<(), StoreError> {
        if let Some(stray) = encodings.iter().find(|e| e.photo_id != photo_id) {
            return Err(StoreError::Rejected(format!(
                "encoding for {} in batch for {photo_id}",
                stray.photo_id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = encodings.iter().find(|e| !seen.insert(e.face_index)) {
            return Err(StoreError::Rejected(format!(
                "duplicate face_index {} for {photo_id}",
                dup.face_index
            )));
        }

        let mut state = self.state();
        if encodings.is_empty() {
            state.encodings.remove(photo_id);
        } else {
            state.encodings.insert(photo_id.to_string(), encodings.to_vec());
        }
        Ok(())
    }

    async fn delete_encodings(&self, photo_id: &str) -> Result<usize, StoreError> {
        Ok(self.state().encodings.remove(photo_id).map_or(0, |v| v.len()))
    }

    async fn count_encodings(&self, photo_id: &str) -> Result<usize, StoreError> {
        Ok(self.state().encodings.get(photo_id).map_or(0, Vec::len))
    }
}

#[async_trait]
impl PhotoCatalog for MemoryStore {
    async fn index_stamp(&self, photo_id: &str) -> Result<Option<IndexStamp>, StoreError> {
        Ok(self.state().stamps.get(photo_id).cloned())
    }

    async fn mark_indexed(&self, photo_id: &str, stamp: &IndexStamp) -> Result<(), StoreError> {
        self.state().stamps.insert(photo_id.to_string(), stamp.clone());
        Ok(())
    }

    async fn clear_indexed(&self, photo_id: &str) -> Result<(), StoreError> {
        self.state().stamps.remove(photo_id);
        Ok(())
    }

    async fn stale_photos(&self, model_version: &str) -> Result<Vec<PhotoId>, StoreError> {
        let mut stale: Vec<PhotoId> = self
            .state()
            .stamps
            .iter()
            .filter(|(_, stamp)| stamp.model_version != model_version)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        Ok(stale)
    }
}

#[async_trait]
impl VectorSearch for MemoryStore {
    async fn nearest(&self, query: &VectorQuery) -> Result<Vec<MatchCandidate>, StoreError> {
        let state = self.state();
        let rows = state
            .encodings
            .values()
            .flatten()
            .filter(|e| e.model_version == query.model_version)
            .map(|e| (e.photo_id.as_str(), e.embedding.as_slice()));
        Ok(exact_nearest(rows, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelRect;

    fn encoding(photo: &str, index: u32, embedding: Vec<f32>, version: &str) -> FaceEncoding {
        FaceEncoding {
            photo_id: photo.into(),
            face_index: index,
            embedding,
            bounding_box: PixelRect { x: 0, y: 0, width: 10, height: 10 },
            quality_score: 0.9,
            model_version: version.into(),
        }
    }

    #[tokio::test]
    async fn test_replace_does_not_append() {
        let store = MemoryStore::new();
        let batch = vec![encoding("p1", 0, vec![1.0, 0.0], "v1"), encoding("p1", 1, vec![0.0, 1.0], "v1")];
        store.replace_encodings("p1", &batch).await.unwrap();
        store.replace_encodings("p1", &batch).await.unwrap();
        assert_eq!(store.count_encodings("p1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_replace_rejects_bad_batch_without_changes() {
        let store = MemoryStore::new();
        store.replace_encodings("p1", &[encoding("p1", 0, vec![1.0], "v1")]).await.unwrap();

        let dup = vec![encoding("p1", 0, vec![1.0], "v2"), encoding("p1", 0, vec![1.0], "v2")];
        assert!(matches!(store.replace_encodings("p1", &dup).await, Err(StoreError::Rejected(_))));

        let stray = vec![encoding("p2", 0, vec![1.0], "v2")];
        assert!(store.replace_encodings("p1", &stray).await.is_err());

        assert_eq!(store.count_encodings("p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nearest_filters_version_and_ceiling() {
        let store = MemoryStore::new();
        store.replace_encodings("near", &[encoding("near", 0, vec![1.0, 0.05], "v1")]).await.unwrap();
        store.replace_encodings("far", &[encoding("far", 0, vec![0.0, 1.0], "v1")]).await.unwrap();
        store.replace_encodings("old", &[encoding("old", 0, vec![1.0, 0.0], "v0")]).await.unwrap();

        let query = VectorQuery {
            embedding: vec![1.0, 0.0],
            model_version: "v1".into(),
            max_distance: 0.2,
            limit: 50,
        };
        let candidates = store.nearest(&query).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].photo_id, "near");
    }

    #[test]
    fn test_exact_nearest_sorts_and_truncates() {
        let rows = [
            ("a", vec![0.8f32, 0.6]),
            ("b", vec![1.0, 0.0]),
            ("c", vec![0.6, 0.8]),
        ];
        let query = VectorQuery {
            embedding: vec![1.0, 0.0],
            model_version: "v1".into(),
            max_distance: 1.0,
            limit: 2,
        };
        let out = exact_nearest(rows.iter().map(|(id, e)| (*id, e.as_slice())), &query);
        let ids: Vec<_> = out.iter().map(|c| c.photo_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_stale_photos() {
        let store = MemoryStore::new();
        let stamp = |v: &str| IndexStamp {
            model_version: v.into(),
            content_digest: "00".into(),
            face_count: 1,
            indexed_at: Utc::now(),
        };
        store.mark_indexed("a", &stamp("v1")).await.unwrap();
        store.mark_indexed("b", &stamp("v2")).await.unwrap();
        assert_eq!(store.stale_photos("v2").await.unwrap(), vec!["a".to_string()]);
    }
}
