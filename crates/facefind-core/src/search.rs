//! Face search: query embedding → vector search → match filter.

use crate::filter::MatchFilter;
use crate::query::{ProgressSink, QueryError, QueryPipeline, Stage};
use crate::store::{VectorQuery, VectorSearch};
use crate::types::{MatchCandidate, SearchResult};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("vector search unavailable after {attempts} attempt(s): {last_error}")]
    VectorSearchUnavailable { attempts: u32, last_error: String },
}

impl SearchError {
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, SearchError::Query(q) if q.is_user_correctable())
    }

    /// Transient failures worth retrying later with the same input.
    pub fn is_retriable(&self) -> bool {
        match self {
            SearchError::VectorSearchUnavailable { .. } => true,
            SearchError::Query(QueryError::Model(m)) => m.is_retriable(),
            SearchError::Query(_) => false,
        }
    }
}

/// Candidate generation and retry knobs for one search.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub candidate_limit: usize,
    pub candidate_ceiling: f32,
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            candidate_limit: 50,
            candidate_ceiling: 0.2,
            timeout: Duration::from_secs(5),
            retries: 2,
            backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Clone)]
pub struct FaceSearch {
    query: QueryPipeline,
    index: Arc<dyn VectorSearch>,
    filter: MatchFilter,
    settings: SearchSettings,
}

impl FaceSearch {
    pub fn new(
        query: QueryPipeline,
        index: Arc<dyn VectorSearch>,
        filter: MatchFilter,
        settings: SearchSettings,
    ) -> Self {
        Self { query, index, filter, settings }
    }

    /// Find every indexed photo showing the person in `bytes`.
    ///
    /// An empty result means "no matches"; a photo without a face is
    /// `QueryError::NoFaceInQuery`.
    pub async fn search(&self, bytes: Vec<u8>, progress: &ProgressSink) -> Result<SearchResult, SearchError> {
        let face = self.query.embed(bytes, progress).await?;

        progress.emit(Stage::Searching);
        let request = VectorQuery {
            embedding: face.embedding.values,
            model_version: face.embedding.model_version,
            max_distance: self.settings.candidate_ceiling,
            limit: self.settings.candidate_limit,
        };
        let candidates = self.nearest_with_retry(&request).await?;

        progress.emit(Stage::Filtering);
        let result = self.filter.apply(&candidates);
        tracing::info!(candidates = candidates.len(), matches = result.len(), "search complete");
        Ok(result)
    }

    pub fn query_pipeline(&self) -> &QueryPipeline {
        &self.query
    }

    async fn nearest_with_retry(&self, request: &VectorQuery) -> Result<Vec<MatchCandidate>, SearchError> {
        let attempts = self.settings.retries + 1;
        let mut backoff = self.settings.backoff;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.settings.timeout, self.index.nearest(request)).await {
                Ok(Ok(candidates)) => return Ok(candidates),
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = format!("timed out after {:?}", self.settings.timeout),
            }
            tracing::warn!(attempt, attempts, error = %last_error, "vector search attempt failed");
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        Err(SearchError::VectorSearchUnavailable { attempts, last_error })
    }
}
