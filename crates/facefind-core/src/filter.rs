//! Match filter: relative-distance thresholding over vector-search candidates.
//!
//! A fixed global cutoff either drops real matches under hard lighting or
//! admits lookalikes in easy conditions. The accept window is instead
//! anchored to the best distance seen for this query (`best + margin`),
//! while `hard_cap` keeps a query with no real match from accepting its
//! least-bad neighbours.

use crate::types::{MatchCandidate, PhotoMatch, SearchResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchFilter {
    pub margin: f32,
    pub hard_cap: f32,
}

impl Default for MatchFilter {
    fn default() -> Self {
        Self { margin: 0.08, hard_cap: 0.25 }
    }
}

impl MatchFilter {
    pub fn new(margin: f32, hard_cap: f32) -> Self {
        Self { margin, hard_cap }
    }

    /// Keep candidates with `distance <= best + margin` and `distance < hard_cap`,
    /// one entry per photo at its minimum distance, sorted ascending.
    ///
    /// `best` is the minimum over the input, so a candidate at or beyond the
    /// hard cap never changes the output wherever it appears in the list.
    /// Non-finite distances are ignored.
    pub fn apply(&self, candidates: &[MatchCandidate]) -> SearchResult {
        let admissible = || {
            candidates
                .iter()
                .filter(|c| c.distance.is_finite() && c.distance < self.hard_cap)
        };

        let Some(best) = admissible().map(|c| c.distance).min_by(f32::total_cmp) else {
            return SearchResult::default();
        };
        let relative_limit = best + self.margin;

        let mut per_photo: HashMap<&str, f32> = HashMap::new();
        for c in admissible().filter(|c| c.distance <= relative_limit) {
            per_photo
                .entry(c.photo_id.as_str())
                .and_modify(|d| *d = d.min(c.distance))
                .or_insert(c.distance);
        }

        let mut matches: Vec<PhotoMatch> = per_photo
            .into_iter()
            .map(|(photo_id, distance)| PhotoMatch { photo_id: photo_id.to_string(), distance })
            .collect();
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.photo_id.cmp(&b.photo_id)));

        tracing::debug!(
            candidates = candidates.len(),
            best,
            relative_limit,
            kept = matches.len(),
            "match filter applied"
        );

        SearchResult { matches }
    }
}
