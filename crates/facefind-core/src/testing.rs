//! Deterministic stand-ins for the ONNX engine, shared by unit tests.

use crate::model::{FaceEngine, InferenceError, ModelError, ModelLoader, Tier};
use crate::types::{BoundingBox, Embedding};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine with a fixed set of faces. Face `i` sits at [`FakeEngine::box_for`]
/// and embeds to the one-hot [`FakeEngine::identity`] vector.
pub struct FakeEngine {
    version: String,
    confidences: Vec<f32>,
    min_width: u32,
    detects: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub const DIM: usize = 8;

    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            confidences: Vec::new(),
            min_width: 0,
            detects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_face(mut self, confidence: f32) -> Self {
        self.confidences.push(confidence);
        self
    }

    /// Report no faces in images narrower than `width`.
    pub fn faces_from_width(mut self, width: u32) -> Self {
        self.min_width = width;
        self
    }

    pub fn box_for(slot: usize) -> BoundingBox {
        let x = 10.0 + 50.0 * slot as f32;
        BoundingBox {
            x,
            y: 10.0,
            width: 40.0,
            height: 40.0,
            confidence: 0.0,
            landmarks: Some([
                (x + 12.0, 22.0),
                (x + 28.0, 22.0),
                (x + 20.0, 30.0),
                (x + 14.0, 38.0),
                (x + 26.0, 38.0),
            ]),
        }
    }

    pub fn identity(slot: usize) -> Vec<f32> {
        let mut v = vec![0.0; Self::DIM];
        v[slot % Self::DIM] = 1.0;
        v
    }
}

impl FaceEngine for FakeEngine {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn detect(&self, image: &RgbImage, min_confidence: f32) -> Result<Vec<BoundingBox>, InferenceError> {
        self.detects.fetch_add(1, Ordering::SeqCst);
        if image.width() < self.min_width {
            return Ok(Vec::new());
        }
        let mut boxes: Vec<BoundingBox> = self
            .confidences
            .iter()
            .enumerate()
            .filter(|(_, &c)| c >= min_confidence)
            .map(|(slot, &confidence)| BoundingBox { confidence, ..Self::box_for(slot) })
            .collect();
        boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(boxes)
    }

    fn embed(&self, _image: &RgbImage, face: &BoundingBox) -> Result<Embedding, InferenceError> {
        let slot = ((face.x - 10.0) / 50.0).round().max(0.0) as usize;
        Ok(Embedding {
            values: Self::identity(slot),
            model_version: self.version.clone(),
        })
    }
}

/// Loader that hands out shared fake engines and counts its loads.
pub struct FakeLoader {
    fast: Arc<FakeEngine>,
    precise: Arc<FakeEngine>,
    delay: Duration,
    fail_first: usize,
    pub loads: AtomicUsize,
}

impl FakeLoader {
    pub fn new() -> Self {
        let precise = FakeEngine::new("precise");
        // Both tiers report into one counter.
        let fast = FakeEngine { detects: Arc::clone(&precise.detects), ..FakeEngine::new("fast") };
        Self {
            fast: Arc::new(fast),
            precise: Arc::new(precise),
            delay: Duration::ZERO,
            fail_first: 0,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The first `n` loads fail with a missing artifact.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn serving(mut self, engine: FakeEngine) -> Self {
        self.precise = Arc::new(self.share_counter(engine));
        self
    }

    pub fn serving_fast(mut self, engine: FakeEngine) -> Self {
        self.fast = Arc::new(self.share_counter(engine));
        self
    }

    /// Detections run on any engine this loader handed out, warm-up included.
    pub fn engine_detects(&self) -> usize {
        self.precise.detects.load(Ordering::SeqCst)
    }

    fn share_counter(&self, engine: FakeEngine) -> FakeEngine {
        FakeEngine { detects: Arc::clone(&self.precise.detects), ..engine }
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self, tier: Tier) -> Result<Arc<dyn FaceEngine>, ModelError> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if attempt < self.fail_first {
            return Err(ModelError::ArtifactMissing {
                tier,
                path: format!("/nonexistent/{tier}.onnx"),
            });
        }
        let engine: Arc<dyn FaceEngine> = match tier {
            Tier::Fast => self.fast.clone(),
            Tier::Precise => self.precise.clone(),
        };
        Ok(engine)
    }
}

/// PNG-encoded grey image. Different sizes give different bytes.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode test png");
    bytes
}
