//! Descriptor extraction: image → zero or more (box, score, embedding).
//!
//! Extraction is deterministic for a given engine and input. "No face" is an
//! empty result, never an error; retry policy belongs to the cascade.

use crate::model::{FaceEngine, InferenceError};
use crate::types::{DetectedFace, DetectionResult, PixelRect};
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image is empty")]
    Empty,
}

/// Which faces an extraction keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Every face above the threshold (indexing).
    All,
    /// Only the highest-confidence face (queries).
    Best,
}

/// An image downscaled for one tier, with the factor back to source pixels.
pub struct PreparedImage {
    pub image: RgbImage,
    /// Source pixels per prepared pixel (≥ 1).
    pub scale: f32,
    pub source_width: u32,
    pub source_height: u32,
}

/// Decode an encoded photo (JPEG, PNG, WebP, ...) to RGB.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, ExtractError> {
    let image = image::load_from_memory(bytes)?.to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(ExtractError::Empty);
    }
    Ok(image)
}

/// Downscale so the longest side is at most `max_dimension`, keeping aspect ratio.
///
/// The triangle filter widens with the reduction ratio, so each output pixel
/// averages its whole source footprint instead of point-sampling it.
pub fn prepare(image: RgbImage, max_dimension: u32) -> PreparedImage {
    let (source_width, source_height) = image.dimensions();
    let longest = source_width.max(source_height);

    if longest <= max_dimension || max_dimension == 0 {
        return PreparedImage { image, scale: 1.0, source_width, source_height };
    }

    let ratio = max_dimension as f32 / longest as f32;
    let width = ((source_width as f32 * ratio).round() as u32).max(1);
    let height = ((source_height as f32 * ratio).round() as u32).max(1);
    let resized = imageops::resize(&image, width, height, FilterType::Triangle);

    tracing::debug!(source_width, source_height, width, height, "downscaled for detection");

    PreparedImage {
        image: resized,
        scale: source_width as f32 / width as f32,
        source_width,
        source_height,
    }
}

/// Detect and embed faces above `min_confidence`.
pub fn extract(
    engine: &dyn FaceEngine,
    prepared: &PreparedImage,
    min_confidence: f32,
    mode: ExtractMode,
) -> Result<DetectionResult, InferenceError> {
    let mut boxes = engine.detect(&prepared.image, min_confidence)?;
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    if mode == ExtractMode::Best {
        boxes.truncate(1);
    }

    let faces = boxes
        .iter()
        .map(|bbox| {
            let embedding = engine.embed(&prepared.image, bbox)?;
            Ok(DetectedFace {
                bounding_box: PixelRect::from_scaled(
                    bbox,
                    prepared.scale,
                    prepared.source_width,
                    prepared.source_height,
                ),
                quality_score: bbox.confidence.clamp(0.0, 1.0),
                embedding,
            })
        })
        .collect::<Result<Vec<_>, InferenceError>>()?;

    Ok(DetectionResult { faces })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    #[test]
    fn test_prepare_keeps_small_images() {
        let prepared = prepare(RgbImage::new(800, 600), 1600);
        assert_eq!(prepared.image.dimensions(), (800, 600));
        assert_eq!(prepared.scale, 1.0);
    }

    #[test]
    fn test_prepare_downscales_preserving_aspect() {
        let prepared = prepare(RgbImage::new(4000, 3000), 1600);
        assert_eq!(prepared.image.dimensions(), (1600, 1200));
        assert!((prepared.scale - 2.5).abs() < 1e-6);
        assert_eq!((prepared.source_width, prepared.source_height), (4000, 3000));
    }

    #[test]
    fn test_prepare_averages_instead_of_aliasing() {
        // 1px checkerboard must collapse to mid-grey, not to one of the two colours.
        let checker = RgbImage::from_fn(400, 400, |x, y| {
            if (x + y) % 2 == 0 { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) }
        });
        let prepared = prepare(checker, 100);
        let p = prepared.image.get_pixel(50, 50);
        assert!((100..=155).contains(&p[0]), "got {}", p[0]);
    }

    #[test]
    fn test_decode_png() {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(8, 4, Rgb([10, 20, 30]))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        let image = decode(&bytes).unwrap();
        assert_eq!(image.dimensions(), (8, 4));
        assert_eq!(image.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode(b"not an image"), Err(ExtractError::Decode(_))));
    }

    #[test]
    fn test_extract_all_and_best() {
        let engine = FakeEngine::new("v1").with_face(0.6).with_face(0.9).with_face(0.2);
        let prepared = prepare(RgbImage::new(200, 200), 1600);

        let all = extract(&engine, &prepared, 0.5, ExtractMode::All).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.faces[0].quality_score, 0.9);

        let best = extract(&engine, &prepared, 0.1, ExtractMode::Best).unwrap();
        assert_eq!(best.len(), 1);
        assert_eq!(best.faces[0].quality_score, 0.9);
    }

    #[test]
    fn test_extract_no_face_is_empty_not_error() {
        let engine = FakeEngine::new("v1");
        let prepared = prepare(RgbImage::new(200, 200), 1600);
        assert!(extract(&engine, &prepared, 0.5, ExtractMode::All).unwrap().is_empty());
    }

    #[test]
    fn test_extract_maps_boxes_to_source_pixels() {
        let engine = FakeEngine::new("v1").with_face(0.9);
        let prepared = prepare(RgbImage::new(3200, 1600), 1600);
        let result = extract(&engine, &prepared, 0.5, ExtractMode::All).unwrap();
        let fake_box = FakeEngine::box_for(0);
        let rect = result.faces[0].bounding_box;
        assert_eq!(rect.x, (fake_box.x * 2.0) as u32);
        assert_eq!(rect.width, (fake_box.width * 2.0) as u32);
    }

    #[test]
    fn test_extract_is_deterministic() {
        let engine = FakeEngine::new("v1").with_face(0.8).with_face(0.7);
        let prepared = prepare(RgbImage::new(300, 300), 1600);
        let a = extract(&engine, &prepared, 0.5, ExtractMode::All).unwrap();
        let b = extract(&engine, &prepared, 0.5, ExtractMode::All).unwrap();
        let embeddings = |r: &DetectionResult| r.faces.iter().map(|f| f.embedding.clone()).collect::<Vec<_>>();
        assert_eq!(embeddings(&a), embeddings(&b));
    }
}
