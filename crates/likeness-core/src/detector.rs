//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB image into the 640×640 network input, decodes the three
//! anchor-free stride heads and suppresses overlapping boxes.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting the image into the network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let side = SCRFD_INPUT_SIZE as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let (new_w, new_h) = scaled_size(width, height, scale);
        Self {
            scale,
            pad_x: ((SCRFD_INPUT_SIZE - new_w) / 2) as f32,
            pad_y: ((SCRFD_INPUT_SIZE - new_h) / 2) as f32,
        }
    }

    /// Map a point from network input space back to source image space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

fn scaled_size(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    (w, h)
}

/// Output tensor positions for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [HeadOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let heads = map_head_outputs(&output_names);
        tracing::info!(path = model_path, outputs = ?output_names, ?heads, "loaded SCRFD model");

        Ok(Self { session, heads })
    }

    /// Detect faces in an RGB image, returning boxes sorted by confidence.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in self.heads.iter().zip(SCRFD_STRIDES.iter()) {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let head_output = HeadOutput {
                scores: tensor(head.score, "scores")?,
                bboxes: tensor(head.bbox, "bboxes")?,
                kps: tensor(head.kps, "kps")?,
            };
            candidates.extend(head_output.decode(stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let faces = suppress_overlaps(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(count = faces.len(), "SCRFD detections after NMS");
        Ok(faces)
    }
}

/// Letterbox the image into a normalized 1×3×640×640 tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height());
    let (new_w, new_h) = scaled_size(image.width(), image.height(), letterbox.scale);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding is the mean rounded to 128, which normalizes to 1/256.
    let pad = SCRFD_MEAN.round() as u8;
    let mut canvas = RgbImage::from_pixel(SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE, Rgb([pad; 3]));
    imageops::overlay(
        &mut canvas,
        &resized,
        letterbox.pad_x as i64,
        letterbox.pad_y as i64,
    );

    let side = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Locate each stride's score/bbox/kps outputs.
///
/// Exports that name their tensors `score_8`, `bbox_16`, `kps_32`, ... are
/// mapped by name in any order; anything else uses the reference export's
/// positional layout (scores 0–2, boxes 3–5, keypoints 6–8).
fn map_head_outputs(names: &[String]) -> [HeadOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<HeadOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(HeadOutputs {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match by_name {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            std::array::from_fn(|i| HeadOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Raw outputs of one stride head.
struct HeadOutput<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl HeadOutput<'_> {
    fn decode(&self, stride: usize, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let grid_w = SCRFD_INPUT_SIZE as usize / stride;
        let grid_h = SCRFD_INPUT_SIZE as usize / stride;
        let step = stride as f32;

        (0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL)
            .filter_map(|idx| {
                let score = *self.scores.get(idx)?;
                if score <= threshold {
                    return None;
                }
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let cx = (cell % grid_w) as f32 * step;
                let cy = (cell / grid_w) as f32 * step;

                let d = self.bboxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
                let (x2, y2) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

                let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| {
                        letterbox.unmap(cx + k[i * 2] * step, cy + k[i * 2 + 1] * step)
                    })
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

fn by_confidence_desc(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn suppress_overlaps(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(by_confidence_desc);

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
