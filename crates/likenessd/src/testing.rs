//! Fixtures shared by the daemon's unit tests.

use crate::archive::ImageArchive;
use crate::workflow::Pipeline;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use likeness_core::{EuclideanMatcher, ExtractError, Extraction, FaceSignature, SignatureExtractor};
use likeness_store::SignatureStore;
use std::io::Cursor;
use tempfile::TempDir;

/// Deterministic stand-in for the ONNX models.
///
/// Near-black images contain "no face"; anything else maps to its mean
/// colour scaled to [0, 1], so differently coloured images are different
/// people and identical images are the same person at distance zero.
pub struct ColourExtractor;

impl SignatureExtractor for ColourExtractor {
    fn dimension(&self) -> usize {
        3
    }

    fn extract(&mut self, image: &DynamicImage) -> Result<Extraction, ExtractError> {
        let rgb = image.to_rgb8();
        if rgb.pixels().all(|p| p.0.iter().all(|&c| c < 16)) {
            return Ok(Extraction::NoFaceFound);
        }
        let n = (rgb.width() * rgb.height()) as f32;
        let mut sum = [0.0f32; 3];
        for p in rgb.pixels() {
            for c in 0..3 {
                sum[c] += p[c] as f32;
            }
        }
        let values = sum.iter().map(|s| s / n / 255.0).collect();
        Ok(Extraction::Signature(FaceSignature::new(values, Some("colour".into()))))
    }
}

/// A solid-colour PNG.
pub fn png(colour: [u8; 3]) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb(colour)));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub const RED: [u8; 3] = [200, 20, 20];
pub const BLUE: [u8; 3] = [20, 20, 200];
pub const BLACK: [u8; 3] = [0, 0, 0];

/// A pipeline over an in-memory store and a temporary archive.
pub fn pipeline(threshold: f32) -> (Pipeline<ColourExtractor>, TempDir) {
    let tmp = TempDir::new().unwrap();
    let pipeline = Pipeline::new(
        ColourExtractor,
        SignatureStore::open_in_memory(3).unwrap(),
        ImageArchive::new(tmp.path()),
        EuclideanMatcher::new(threshold),
        true,
    )
    .unwrap();
    (pipeline, tmp)
}
