use anyhow::{Context, Result};
use facefind_core::PipelineConfig;
use std::path::PathBuf;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration: optional TOML pipeline tunables plus `FACEFIND_*` overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub bus: BusKind,
    /// Load the precise tier at startup instead of on first use.
    pub preload: bool,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Read `FACEFIND_CONFIG` (if set), apply environment overrides, validate.
    pub fn load() -> Result<Self> {
        let mut pipeline = match std::env::var("FACEFIND_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
                toml::from_str(&text).with_context(|| format!("parsing {path}"))?
            }
            Err(_) => PipelineConfig::default(),
        };

        pipeline.margin = env_f32("FACEFIND_MARGIN", pipeline.margin);
        pipeline.hard_cap = env_f32("FACEFIND_HARD_CAP", pipeline.hard_cap);
        pipeline.candidate_limit = env_usize("FACEFIND_CANDIDATE_LIMIT", pipeline.candidate_limit);
        pipeline.search_timeout_secs = env_u64("FACEFIND_SEARCH_TIMEOUT_SECS", pipeline.search_timeout_secs);
        pipeline.validate().context("invalid pipeline configuration")?;

        let data_dir = data_dir();
        let model_dir = std::env::var("FACEFIND_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));
        let db_path = std::env::var("FACEFIND_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces.db"));

        let bus = match std::env::var("FACEFIND_BUS").as_deref() {
            Ok("system") => BusKind::System,
            Ok("session") | Err(_) => BusKind::Session,
            Ok(other) => anyhow::bail!("FACEFIND_BUS must be `session` or `system`, got `{other}`"),
        };

        Ok(Self {
            model_dir,
            db_path,
            bus,
            preload: std::env::var("FACEFIND_PRELOAD").map(|v| v != "0").unwrap_or(false),
            pipeline,
        })
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facefind")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
