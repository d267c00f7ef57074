use anyhow::{Context, Result};
use facefind_core::{FacePipelines, OnnxModelLoader, Tier};
use facefind_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::{BusKind, Config};
use dbus_interface::SearchService;

const BUS_NAME: &str = "org.facefind.Search1";
const OBJECT_PATH: &str = "/org/facefind/Search1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        bus = ?config.bus,
        "facefindd starting"
    );

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );
    let loader = Arc::new(OnnxModelLoader::new(
        config.model_dir.clone(),
        config.pipeline.fast.clone(),
        config.pipeline.precise.clone(),
    ));
    let pipelines = FacePipelines::new(&config.pipeline, loader, store);

    if config.preload {
        let registry = pipelines.registry.clone();
        tokio::spawn(async move {
            if let Err(err) = registry.ensure_loaded(Tier::Precise).await {
                tracing::warn!(error = %err, "preload failed; will retry on first request");
            }
        });
    }

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, SearchService::new(pipelines.clone(), &config))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "facefindd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facefindd shutting down");
    pipelines.registry.shutdown();

    Ok(())
}
