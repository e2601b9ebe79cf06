//! likeness-core: Face signature extraction and matching.
//!
//! Uses SCRFD for face detection and ArcFace for face signatures, both
//! running via ONNX Runtime on the CPU, and a linear-scan Euclidean matcher.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod input;
pub mod matcher;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use detector::FaceDetector;
pub use extractor::{select_primary_face, ExtractError, Extraction, OnnxExtractor, SignatureExtractor};
pub use input::{decode_image, DecodeError, ImageKind};
pub use matcher::{BestMatch, Candidate, EuclideanMatcher, MatchDecision, DEFAULT_MATCH_THRESHOLD};
pub use recognizer::{FaceRecognizer, ARCFACE_SIGNATURE_DIM};
pub use types::{BoundingBox, FaceSignature, IdentityId, SignatureId};

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";

/// ArcFace recognition model file name inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/var/lib/likeness/models")
}
