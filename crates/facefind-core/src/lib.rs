//! facefind-core: face-based photo search.
//!
//! SCRFD detects faces and ArcFace embeds them, both on ONNX Runtime. Photos
//! are indexed on the precise tier; a query photo is embedded the same way,
//! matched against stored encodings by cosine distance, and filtered
//! relative to its best candidate.

pub mod alignment;
pub mod cascade;
pub mod config;
pub mod detector;
pub mod extractor;
pub mod filter;
pub mod indexer;
pub mod model;
pub mod pipelines;
pub mod query;
pub mod recognizer;
pub mod registry;
pub mod search;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use cascade::ConfidenceLadder;
pub use config::{ConfigError, PipelineConfig, TierSettings};
pub use filter::MatchFilter;
pub use indexer::{IndexError, IndexReport, Indexer};
pub use model::{FaceEngine, ModelError, ModelLoader, OnnxModelLoader, Tier};
pub use pipelines::FacePipelines;
pub use query::{ProgressSink, QueryError, QueryPipeline, Stage};
pub use registry::{ModelRegistry, TierState};
pub use search::{FaceSearch, SearchError, SearchSettings};
pub use store::{EncodingStore, IndexStamp, MemoryStore, PhotoCatalog, StoreError, VectorQuery, VectorSearch};
pub use types::{Embedding, FaceEncoding, MatchCandidate, PhotoId, PhotoMatch, PixelRect, SearchResult};
