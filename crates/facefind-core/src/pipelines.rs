//! Wiring of registry, indexer and search from one configuration.

use crate::config::PipelineConfig;
use crate::indexer::Indexer;
use crate::model::ModelLoader;
use crate::query::QueryPipeline;
use crate::registry::ModelRegistry;
use crate::search::FaceSearch;
use crate::store::{EncodingStore, PhotoCatalog, VectorSearch};
use std::sync::Arc;

/// Everything a host process needs to index and search.
#[derive(Clone)]
pub struct FacePipelines {
    pub registry: ModelRegistry,
    pub indexer: Indexer,
    pub search: FaceSearch,
}

impl FacePipelines {
    /// Build the pipelines over a store that backs all three storage seams.
    pub fn new<S>(config: &PipelineConfig, loader: Arc<dyn ModelLoader>, store: Arc<S>) -> Self
    where
        S: EncodingStore + PhotoCatalog + VectorSearch + 'static,
    {
        let registry = ModelRegistry::new(loader, config.load_timeout(), config.warmup);
        let indexer = Indexer::new(
            registry.clone(),
            store.clone(),
            store.clone(),
            config.index_ladder.clone(),
            config.precise.max_dimension,
            config.precise.model_version.clone(),
        );
        let query = QueryPipeline::new(
            registry.clone(),
            config.query_ladder.clone(),
            config.precise.max_dimension,
            config.fast.max_dimension,
        );
        let search = FaceSearch::new(query, store, config.match_filter(), config.search_settings());
        Self { registry, indexer, search }
    }
}
