//! Pipeline configuration.
//!
//! Every field has a default, so a partial TOML document only overrides what
//! it names. Distance thresholds are tied to the embedding model in use and
//! must be re-tuned when the precise tier changes.

use crate::cascade::ConfidenceLadder;
use crate::filter::MatchFilter;
use crate::model::Tier;
use crate::search::SearchSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("margin must be finite and non-negative, got {0}")]
    InvalidMargin(f32),
    #[error("hard cap must be finite and positive, got {0}")]
    InvalidHardCap(f32),
    #[error("candidate ceiling must be finite and positive, got {0}")]
    InvalidCeiling(f32),
    #[error("candidate limit must be at least 1")]
    ZeroCandidateLimit,
    #[error("{tier} tier: {reason}")]
    InvalidTier { tier: Tier, reason: String },
}

/// Model artifacts and image limits for one detector tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSettings {
    /// SCRFD detector file, relative to the model directory.
    pub detector_file: String,
    /// ArcFace embedder file, relative to the model directory.
    pub embedder_file: String,
    /// Square detector input size; a multiple of 32.
    pub input_size: u32,
    /// Images whose longest side exceeds this are downscaled before detection.
    pub max_dimension: u32,
    /// Tag stamped on every encoding this tier produces.
    pub model_version: String,
}

impl TierSettings {
    pub fn fast() -> Self {
        Self {
            detector_file: "det_500m.onnx".into(),
            embedder_file: "w600k_mbf.onnx".into(),
            input_size: 320,
            max_dimension: 640,
            model_version: "scrfd_500m+w600k_mbf".into(),
        }
    }

    pub fn precise() -> Self {
        Self {
            detector_file: "det_10g.onnx".into(),
            embedder_file: "w600k_r50.onnx".into(),
            input_size: 640,
            max_dimension: 1600,
            model_version: "scrfd_10g+w600k_r50".into(),
        }
    }

    fn validate(&self, tier: Tier) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::InvalidTier { tier, reason });
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return invalid(format!("input_size {} is not a positive multiple of 32", self.input_size));
        }
        if self.max_dimension == 0 {
            return invalid("max_dimension must be positive".into());
        }
        if self.model_version.trim().is_empty() {
            return invalid("model_version must not be empty".into());
        }
        Ok(())
    }
}

/// Tunables for indexing and searching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub fast: TierSettings,
    pub precise: TierSettings,
    /// Confidence thresholds tried in order while indexing.
    pub index_ladder: ConfidenceLadder,
    /// Confidence thresholds tried in order for query images.
    pub query_ladder: ConfidenceLadder,
    /// Top-K requested from vector search.
    pub candidate_limit: usize,
    /// Absolute distance ceiling handed to vector search.
    pub candidate_ceiling: f32,
    /// Accept window above the best candidate distance.
    pub margin: f32,
    /// Candidates at or above this distance are always rejected.
    pub hard_cap: f32,
    pub load_timeout_secs: u64,
    pub search_timeout_secs: u64,
    pub search_retries: u32,
    pub search_backoff_ms: u64,
    /// Run one dummy inference after the precise tier loads.
    pub warmup: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fast: TierSettings::fast(),
            precise: TierSettings::precise(),
            index_ladder: ConfidenceLadder::default(),
            query_ladder: ConfidenceLadder::query_default(),
            candidate_limit: 50,
            candidate_ceiling: 0.2,
            margin: 0.08,
            hard_cap: 0.25,
            load_timeout_secs: 60,
            search_timeout_secs: 5,
            search_retries: 2,
            search_backoff_ms: 200,
            warmup: true,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.margin.is_finite() || self.margin < 0.0 {
            return Err(ConfigError::InvalidMargin(self.margin));
        }
        if !self.hard_cap.is_finite() || self.hard_cap <= 0.0 {
            return Err(ConfigError::InvalidHardCap(self.hard_cap));
        }
        if !self.candidate_ceiling.is_finite() || self.candidate_ceiling <= 0.0 {
            return Err(ConfigError::InvalidCeiling(self.candidate_ceiling));
        }
        if self.candidate_limit == 0 {
            return Err(ConfigError::ZeroCandidateLimit);
        }
        self.fast.validate(Tier::Fast)?;
        self.precise.validate(Tier::Precise)?;
        Ok(())
    }

    pub fn tier(&self, tier: Tier) -> &TierSettings {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Precise => &self.precise,
        }
    }

    pub fn match_filter(&self) -> MatchFilter {
        MatchFilter::new(self.margin, self.hard_cap)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn search_backoff(&self) -> Duration {
        Duration::from_millis(self.search_backoff_ms)
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            candidate_limit: self.candidate_limit,
            candidate_ceiling: self.candidate_ceiling,
            timeout: self.search_timeout(),
            retries: self.search_retries,
            backoff: self.search_backoff(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
            margin = 0.05
            index_ladder = [0.6, 0.4]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.margin, 0.05);
        assert_eq!(cfg.index_ladder.steps(), &[0.6, 0.4]);
        assert_eq!(cfg.hard_cap, 0.25);
        assert_eq!(cfg.precise, TierSettings::precise());
    }

    #[test]
    fn test_toml_rejects_increasing_ladder() {
        let parsed: Result<PipelineConfig, _> = toml::from_str("index_ladder = [0.3, 0.5]");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_rejects_negative_margin() {
        let cfg = PipelineConfig { margin: -0.1, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidMargin(_))));
    }

    #[test]
    fn test_validate_rejects_bad_input_size() {
        let mut cfg = PipelineConfig::default();
        cfg.fast.input_size = 300;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidTier { tier: Tier::Fast, .. })
        ));
    }
}
