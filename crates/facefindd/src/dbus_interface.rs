use crate::config::Config;
use facefind_core::{FacePipelines, IndexError, ProgressSink, QueryError, SearchError, Tier};
use std::path::PathBuf;
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

/// D-Bus interface for the facefind search daemon.
///
/// Bus name: org.facefind.Search1
/// Object path: /org/facefind/Search1
pub struct SearchService {
    pipelines: FacePipelines,
    db_path: PathBuf,
}

impl SearchService {
    pub fn new(pipelines: FacePipelines, config: &Config) -> Self {
        Self {
            pipelines,
            db_path: config.db_path.clone(),
        }
    }
}

#[interface(name = "org.facefind.Search1")]
impl SearchService {
    /// Index (or re-index) one photo. Returns the face count and whether the
    /// photo was skipped as unchanged.
    async fn index_photo(&self, photo_id: &str, path: &str, force: bool) -> fdo::Result<(u32, bool)> {
        tracing::info!(photo_id, path, force, "index requested");
        let bytes = read_photo(path).await?;
        let report = self
            .pipelines
            .indexer
            .index_photo(photo_id, bytes, force)
            .await
            .map_err(index_error)?;
        Ok((report.faces, report.unchanged))
    }

    /// Search the library for the person in the photo at `path`.
    ///
    /// Returns a JSON array of `{photo_id, distance}`, best match first. An
    /// empty array means no matches.
    async fn search(
        &self,
        path: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        tracing::info!(path, "search requested");
        let bytes = read_photo(path).await?;

        let (sink, mut stages) = ProgressSink::channel();
        let search = async move {
            let result = self.pipelines.search.search(bytes, &sink).await;
            drop(sink);
            result
        };
        let forward = async {
            while let Some(stage) = stages.recv().await {
                if let Err(err) = Self::progress(&emitter, &stage.to_string()).await {
                    tracing::debug!(error = %err, "progress signal not sent");
                }
            }
        };
        let (result, ()) = tokio::join!(search, forward);

        let result = result.map_err(search_error)?;
        serde_json::to_string(&result.matches).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Fast face-presence check. Returns how many faces were found.
    async fn preview(&self, path: &str) -> fdo::Result<u32> {
        let bytes = read_photo(path).await?;
        let faces = self
            .pipelines
            .search
            .query_pipeline()
            .preview(bytes)
            .await
            .map_err(query_error)?;
        Ok(faces.len() as u32)
    }

    /// Forget a photo deleted upstream. Returns how many encodings were removed.
    async fn remove_photo(&self, photo_id: &str) -> fdo::Result<u32> {
        tracing::info!(photo_id, "remove requested");
        let removed = self.pipelines.indexer.forget(photo_id).await.map_err(index_error)?;
        Ok(removed as u32)
    }

    /// Photos indexed with a different model version than the current one.
    async fn stale_photos(&self) -> fdo::Result<Vec<String>> {
        self.pipelines.indexer.stale_photos().await.map_err(index_error)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let registry = &self.pipelines.registry;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_version": self.pipelines.indexer.model_version(),
            "tiers": {
                "fast": registry.state(Tier::Fast),
                "precise": registry.state(Tier::Precise),
            },
            "db_path": self.db_path.display().to_string(),
        })
        .to_string())
    }

    /// Coarse progress of a running search.
    #[zbus(signal)]
    async fn progress(emitter: &SignalEmitter<'_>, stage: &str) -> zbus::Result<()>;
}

async fn read_photo(path: &str) -> fdo::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| fdo::Error::InvalidArgs(format!("cannot read {path}: {e}")))
}

/// The caller can fix these by sending a different photo.
fn reply_error(message: String, user_correctable: bool) -> fdo::Error {
    if user_correctable {
        fdo::Error::InvalidArgs(message)
    } else {
        tracing::error!(error = %message, "request failed");
        fdo::Error::Failed(message)
    }
}

fn index_error(err: IndexError) -> fdo::Error {
    reply_error(err.to_string(), err.is_user_correctable())
}

fn query_error(err: QueryError) -> fdo::Error {
    reply_error(err.to_string(), err.is_user_correctable())
}

fn search_error(err: SearchError) -> fdo::Error {
    reply_error(err.to_string(), err.is_user_correctable())
}
