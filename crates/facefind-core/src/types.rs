use serde::{Deserialize, Serialize};

/// Identifier of a photo owned by the surrounding catalog.
pub type PhotoId = String;

/// Detector-space bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Integer rectangle in source-image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    /// Scale a detector box back to source pixels and clip it to the source bounds.
    pub fn from_scaled(bbox: &BoundingBox, scale: f32, source_width: u32, source_height: u32) -> Self {
        let clip = |v: f32, max: u32| (v * scale).round().clamp(0.0, max as f32) as u32;
        let x1 = clip(bbox.x, source_width);
        let y1 = clip(bbox.y, source_height);
        let x2 = clip(bbox.x + bbox.width, source_width);
        let y2 = clip(bbox.y + bbox.height, source_height);
        Self {
            x: x1,
            y: y1,
            width: x2.saturating_sub(x1),
            height: y2.saturating_sub(y1),
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Detector/embedder pair that produced this embedding (e.g., "scrfd_10g+w600k_r50").
    pub model_version: String,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    /// Cosine distance `1 - similarity`, in [0, 2]. 0 = identical direction.
    pub fn distance(&self, other: &Embedding) -> f32 {
        cosine_distance(&self.values, &other.values)
    }
}

/// Cosine similarity over raw vectors. Zero vectors compare as 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

/// Cosine distance over raw vectors, clamped to be non-negative.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - cosine_similarity(a, b)).max(0.0)
}

/// One face found by a single extractor call.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bounding_box: PixelRect,
    /// Detector confidence in [0, 1].
    pub quality_score: f32,
    pub embedding: Embedding,
}

/// Output of one extractor call, ordered by descending confidence. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    pub faces: Vec<DetectedFace>,
}

impl DetectionResult {
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }
}

/// A persisted face descriptor. One row per detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEncoding {
    pub photo_id: PhotoId,
    /// 0-based position among the faces of `photo_id`.
    pub face_index: u32,
    pub embedding: Vec<f32>,
    pub bounding_box: PixelRect,
    pub quality_score: f32,
    pub model_version: String,
}

/// A raw `(photo, distance)` pair from vector search, before filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub photo_id: PhotoId,
    pub distance: f32,
}

impl MatchCandidate {
    pub fn new(photo_id: impl Into<PhotoId>, distance: f32) -> Self {
        Self { photo_id: photo_id.into(), distance }
    }
}

/// A photo that survived match filtering, with its best distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoMatch {
    pub photo_id: PhotoId,
    pub distance: f32,
}

/// Unique photo matches ordered by ascending distance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub matches: Vec<PhotoMatch>,
}

impl SearchResult {
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn photo_ids(&self) -> impl Iterator<Item = &str> {
        self.matches.iter().map(|m| m.photo_id.as_str())
    }
}
