//! Signature extraction: image in, zero-or-one face signature out.

use crate::detector::{DetectorError, FaceDetector};
use crate::input::{decode_image, DecodeError, ImageKind};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_SIGNATURE_DIM};
use crate::types::{BoundingBox, FaceSignature};
use image::DynamicImage;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Result of running an extractor over a decoded image.
///
/// An image without a detectable face is a legitimate, empty result.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Signature(FaceSignature),
    NoFaceFound,
}

/// Maps a decoded image to at most one face signature.
///
/// Implementations must be deterministic for a fixed model and must always
/// produce signatures of [`dimension`](Self::dimension) components.
pub trait SignatureExtractor: Send {
    fn dimension(&self) -> usize;

    fn extract(&mut self, image: &DynamicImage) -> Result<Extraction, ExtractError>;

    /// Decode raw bytes of the asserted kind, then extract.
    fn extract_bytes(&mut self, bytes: &[u8], kind: ImageKind) -> Result<Extraction, ExtractError> {
        let image = decode_image(bytes, kind)?;
        self.extract(&image)
    }
}

/// Pick the face to use when a detector reports several.
///
/// The largest bounding box wins; equal areas fall back to the higher
/// detector confidence, then to the earliest detection.
pub fn select_primary_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().reduce(|best, face| {
        let by_area = face.area().partial_cmp(&best.area()).unwrap_or(Ordering::Equal);
        let by_confidence = face
            .confidence
            .partial_cmp(&best.confidence)
            .unwrap_or(Ordering::Equal);
        match by_area.then(by_confidence) {
            Ordering::Greater => face,
            _ => best,
        }
    })
}

/// SCRFD detection followed by ArcFace recognition.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self {
            detector,
            recognizer,
        }
    }

    /// Load both models from a model directory.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let detector_path = model_dir.join(crate::DETECTOR_MODEL_FILE);
        let recognizer_path = model_dir.join(crate::RECOGNIZER_MODEL_FILE);
        let detector = FaceDetector::load(&detector_path.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&recognizer_path.to_string_lossy())?;
        Ok(Self::new(detector, recognizer))
    }
}

impl SignatureExtractor for OnnxExtractor {
    fn dimension(&self) -> usize {
        ARCFACE_SIGNATURE_DIM
    }

    fn extract(&mut self, image: &DynamicImage) -> Result<Extraction, ExtractError> {
        let rgb = image.to_rgb8();
        let faces = self.detector.detect(&rgb)?;

        let Some(face) = select_primary_face(&faces) else {
            tracing::debug!("no face detected");
            return Ok(Extraction::NoFaceFound);
        };

        if faces.len() > 1 {
            tracing::info!(
                detected = faces.len(),
                area = face.area(),
                confidence = face.confidence,
                "multiple faces detected, using the largest"
            );
        }

        let signature = self.recognizer.signature(&rgb, face)?;
        Ok(Extraction::Signature(signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(width: f32, height: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x: 0.0, y: 0.0, width, height, confidence, landmarks: None }
    }

    #[test]
    fn test_select_primary_empty() {
        assert!(select_primary_face(&[]).is_none());
    }

    #[test]
    fn test_select_primary_prefers_largest() {
        let faces = vec![face(10.0, 10.0, 0.99), face(40.0, 40.0, 0.6), face(20.0, 20.0, 0.9)];
        let chosen = select_primary_face(&faces).unwrap();
        assert_eq!(chosen.width, 40.0);
    }

    #[test]
    fn test_select_primary_equal_area_uses_confidence() {
        let faces = vec![face(20.0, 20.0, 0.7), face(10.0, 40.0, 0.8)];
        let chosen = select_primary_face(&faces).unwrap();
        assert_eq!(chosen.confidence, 0.8);
    }

    #[test]
    fn test_select_primary_full_tie_keeps_first() {
        let faces = vec![
            BoundingBox { x: 1.0, ..face(20.0, 20.0, 0.7) },
            BoundingBox { x: 2.0, ..face(20.0, 20.0, 0.7) },
        ];
        assert_eq!(select_primary_face(&faces).unwrap().x, 1.0);
    }

    struct Fixed(Extraction);

    impl SignatureExtractor for Fixed {
        fn dimension(&self) -> usize {
            2
        }
        fn extract(&mut self, _image: &DynamicImage) -> Result<Extraction, ExtractError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_extract_bytes_reports_decode_error() {
        let mut extractor = Fixed(Extraction::NoFaceFound);
        let err = extractor.extract_bytes(b"\x89PNG broken", ImageKind::Png).unwrap_err();
        assert!(matches!(err, ExtractError::Decode(_)));
    }
}
