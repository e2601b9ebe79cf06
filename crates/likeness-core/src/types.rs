use serde::{Deserialize, Serialize};

/// Identifier of an enrolled identity.
pub type IdentityId = i64;

/// Identifier of a persisted signature record.
pub type SignatureId = i64;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Area of the box in pixels. Degenerate boxes report zero.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Fixed-length face descriptor produced by a signature extractor.
///
/// Signatures are immutable once produced; re-enrollment creates a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceSignature {
    values: Vec<f32>,
    /// Model version that produced this signature (e.g., "w600k_r50").
    model_version: Option<String>,
}

impl FaceSignature {
    pub fn new(values: Vec<f32>, model_version: Option<String>) -> Self {
        Self {
            values,
            model_version,
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Number of components in the descriptor.
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to another signature.
    ///
    /// Returns `None` when the dimensionalities differ: such signatures live in
    /// different spaces and are never comparable.
    pub fn distance(&self, other: &FaceSignature) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(values: &[f32]) -> FaceSignature {
        FaceSignature::new(values.to_vec(), None)
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = sig(&[0.3, -0.2, 0.9]);
        assert_eq!(a.distance(&a.clone()), Some(0.0));
    }

    #[test]
    fn test_distance_three_four_five() {
        let a = sig(&[0.0, 0.0]);
        let b = sig(&[3.0, 4.0]);
        let d = a.distance(&b).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let a = sig(&[1.0, 0.0]);
        let b = sig(&[1.0, 0.0, 0.0]);
        assert_eq!(a.distance(&b), None);
    }

    #[test]
    fn test_bbox_area_clamps_negative() {
        let b = BoundingBox {
            x: 0.0, y: 0.0, width: -4.0, height: 10.0,
            confidence: 0.9, landmarks: None,
        };
        assert_eq!(b.area(), 0.0);
    }
}
