//! BRIEF binary descriptors for place recognition.

use image::GrayImage;
use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::map::Descriptor;

/// Half-width of the sampling window around a keypoint.
const PATCH_RADIUS: i64 = 15;

/// Fixed seed so every extractor draws the same comparison pattern.
const PATTERN_SEED: u64 = 42;

/// Computes 256-bit BRIEF descriptors from grayscale intensity comparisons
/// on a fixed random pattern.
pub struct BriefExtractor {
    pairs: Vec<((i64, i64), (i64, i64))>,
}

impl BriefExtractor {
    pub fn new() -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut offset = move || {
            (
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
            )
        };
        let pairs = (0..256).map(|_| (offset(), offset())).collect();
        Self { pairs }
    }

    /// Describe the given keypoints, returning `(pixel, descriptor)` rows.
    ///
    /// Keypoints whose sampling window leaves the image are dropped, so the
    /// output may have fewer rows than the input; callers must match rows
    /// back by pixel rather than by index.
    pub fn extract(
        &self,
        image: &GrayImage,
        keypoints: &[Vector2<f64>],
    ) -> Vec<(Vector2<f64>, Descriptor)> {
        keypoints
            .iter()
            .filter_map(|pixel| self.describe(image, pixel).map(|d| (*pixel, d)))
            .collect()
    }

    fn describe(&self, image: &GrayImage, center: &Vector2<f64>) -> Option<Descriptor> {
        let cx = center.x.round() as i64;
        let cy = center.y.round() as i64;
        let fits = cx >= PATCH_RADIUS
            && cy >= PATCH_RADIUS
            && cx + PATCH_RADIUS < i64::from(image.width())
            && cy + PATCH_RADIUS < i64::from(image.height());
        if !fits {
            return None;
        }
        let sample = |dx: i64, dy: i64| {
            image.get_pixel((cx + dx) as u32, (cy + dy) as u32).0[0]
        };
        let mut bytes = [0u8; 32];
        for (bit, &((ax, ay), (bx, by))) in self.pairs.iter().enumerate() {
            if sample(ax, ay) < sample(bx, by) {
                bytes[bit / 8] |= 1 << (bit % 8);
            }
        }
        Some(Descriptor(bytes))
    }
}

impl Default for BriefExtractor {
    fn default() -> Self {
        Self::new()
    }
}
