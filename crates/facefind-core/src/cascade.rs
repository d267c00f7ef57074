//! Detection cascade.
//!
//! Detection first runs at the detector's default confidence and only steps
//! down the ladder when nothing was found, so easy photos stay cheap and
//! hard ones (dim light, small faces) still get a second look.

use crate::extractor::{self, ExtractMode, PreparedImage};
use crate::model::{FaceEngine, InferenceError};
use crate::types::DetectionResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LadderError {
    #[error("confidence ladder must have at least one step")]
    Empty,
    #[error("confidence {0} is outside (0, 1]")]
    OutOfRange(f32),
    #[error("confidence ladder must be strictly decreasing ({prev} then {next})")]
    NotDecreasing { prev: f32, next: f32 },
}

/// Ordered, strictly decreasing detector confidence thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct ConfidenceLadder(Vec<f32>);

impl ConfidenceLadder {
    pub fn new(steps: Vec<f32>) -> Result<Self, LadderError> {
        if steps.is_empty() {
            return Err(LadderError::Empty);
        }
        if let Some(&bad) = steps.iter().find(|&&t| !(t > 0.0 && t <= 1.0)) {
            return Err(LadderError::OutOfRange(bad));
        }
        if let Some(w) = steps.windows(2).find(|w| w[1] >= w[0]) {
            return Err(LadderError::NotDecreasing { prev: w[0], next: w[1] });
        }
        Ok(Self(steps))
    }

    /// Ladder used for query images: default confidence, then one relaxed retry.
    pub fn query_default() -> Self {
        Self(vec![crate::detector::DEFAULT_CONFIDENCE, 0.3])
    }

    pub fn steps(&self) -> &[f32] {
        &self.0
    }
}

impl Default for ConfidenceLadder {
    fn default() -> Self {
        Self(vec![crate::detector::DEFAULT_CONFIDENCE, 0.3, 0.1])
    }
}

impl TryFrom<Vec<f32>> for ConfidenceLadder {
    type Error = LadderError;

    fn try_from(steps: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(steps)
    }
}

impl From<ConfidenceLadder> for Vec<f32> {
    fn from(ladder: ConfidenceLadder) -> Self {
        ladder.0
    }
}

/// First successful rung of a ladder.
#[derive(Debug, Clone)]
pub struct LadderOutcome<T> {
    pub found: T,
    /// Threshold that produced `found`.
    pub threshold: f32,
    /// Number of attempts made, including the successful one.
    pub attempts: usize,
}

/// Try each threshold in order until `attempt` yields a non-empty result.
///
/// Returns `Ok(None)` when every rung came back empty. Errors stop the descent.
pub fn descend<T, E>(
    ladder: &ConfidenceLadder,
    mut attempt: impl FnMut(f32) -> Result<Vec<T>, E>,
) -> Result<Option<LadderOutcome<Vec<T>>>, E> {
    for (i, &threshold) in ladder.steps().iter().enumerate() {
        let found = attempt(threshold)?;
        if !found.is_empty() {
            return Ok(Some(LadderOutcome { found, threshold, attempts: i + 1 }));
        }
        tracing::debug!(threshold, attempt = i + 1, "no face at threshold");
    }
    Ok(None)
}

/// Run the extractor down the ladder on an already-prepared image.
pub fn detect(
    engine: &dyn FaceEngine,
    image: &PreparedImage,
    ladder: &ConfidenceLadder,
    mode: ExtractMode,
) -> Result<Option<LadderOutcome<DetectionResult>>, InferenceError> {
    let outcome = descend(ladder, |threshold| {
        extractor::extract(engine, image, threshold, mode).map(|r| r.faces)
    })?;

    Ok(outcome.map(|o| {
        if o.attempts > 1 {
            tracing::info!(
                threshold = o.threshold,
                attempts = o.attempts,
                faces = o.found.len(),
                "face recovered at relaxed confidence"
            );
        }
        LadderOutcome {
            found: DetectionResult { faces: o.found },
            threshold: o.threshold,
            attempts: o.attempts,
        }
    }))
}
