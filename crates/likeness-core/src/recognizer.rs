//! ArcFace face recognizer via ONNX Runtime.
//!
//! Turns an aligned 112×112 RGB face crop into an L2-normalized
//! 512-dimensional signature using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, FaceSignature};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // ArcFace uses symmetric normalization, unlike SCRFD
pub const ARCFACE_SIGNATURE_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based signature generator.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Compute the signature of a detected face.
    pub fn signature(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<FaceSignature, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(image, landmarks);
        let input = preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_SIGNATURE_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_SIGNATURE_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(FaceSignature::new(
            l2_normalize(raw),
            Some(ARCFACE_MODEL_VERSION.to_string()),
        ))
    }
}

/// Aligned RGB crop to a normalized NCHW tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let side = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
