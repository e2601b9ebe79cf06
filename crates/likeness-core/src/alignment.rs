//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face onto the five InsightFace reference landmarks of a
//! 112×112 crop, which is the layout ArcFace was trained on.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
pub(crate) const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub(crate) const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit from `src` to `dst`.
    ///
    /// Closed form on centred point sets; degenerate input (all source points
    /// coincident) yields the identity.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut energy = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            energy += sx * sx + sy * sy;
        }

        if energy < 1e-12 {
            return Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };
        }

        let a = dot / energy;
        let b = cross / energy;
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    /// Map a destination point back into the source image.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Bilinear sample; pixels outside the image read as black.
fn sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let at = |px: f32, py: f32| -> [f32; 3] {
        if px < 0.0 || py < 0.0 || px >= image.width() as f32 || py >= image.height() as f32 {
            return [0.0; 3];
        }
        let p = image.get_pixel(px as u32, py as u32);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };

    let (tl, tr) = (at(x0, y0), at(x0 + 1.0, y0));
    let (bl, br) = (at(x0, y0 + 1.0), at(x0 + 1.0, y0 + 1.0));

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Align a detected face to a canonical 112×112 RGB crop.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        match transform.invert_point(ox as f32, oy as f32) {
            Some((sx, sy)) => sample(image, sx, sy),
            None => Rgb([0, 0, 0]),
        }
    })
}
