//! Random augmentations producing the two views of a cloud.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Augmentation strengths. Each view draws its own parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewSampler {
    /// Per-axis scale drawn from `[scale_low, scale_high)`.
    pub scale_low: f32,
    pub scale_high: f32,
    /// Std-dev of the small per-axis rotation angles (radians).
    pub angle_sigma: f32,
    pub angle_clip: f32,
    /// Per-axis shift drawn from `[-translate, translate)`.
    pub translate: f32,
    /// Per-point Gaussian noise.
    pub jitter_sigma: f32,
    pub jitter_clip: f32,
}

impl Default for ViewSampler {
    fn default() -> Self {
        Self {
            scale_low: 2.0 / 3.0,
            scale_high: 1.5,
            angle_sigma: 0.06,
            angle_clip: 0.18,
            translate: 0.2,
            jitter_sigma: 0.01,
            jitter_clip: 0.05,
        }
    }
}

impl ViewSampler {
    /// Scale, rotate, translate, then jitter every point.
    pub fn augment<R: Rng + ?Sized>(&self, cloud: &[[f32; 3]], rng: &mut R) -> Vec<[f32; 3]> {
        let scale: [f32; 3] = std::array::from_fn(|_| self.draw_scale(rng));
        let shift: [f32; 3] = std::array::from_fn(|_| self.draw_shift(rng));
        let angles: [f32; 3] =
            std::array::from_fn(|_| clipped_normal(rng, self.angle_sigma, self.angle_clip));
        let rot = rotation(angles);

        cloud
            .iter()
            .map(|p| {
                let s = [p[0] * scale[0], p[1] * scale[1], p[2] * scale[2]];
                std::array::from_fn(|r| {
                    let rotated = rot[r][0] * s[0] + rot[r][1] * s[1] + rot[r][2] * s[2];
                    rotated + shift[r] + clipped_normal(rng, self.jitter_sigma, self.jitter_clip)
                })
            })
            .collect()
    }

    /// Two independently augmented views of the same cloud.
    pub fn two_views<R: Rng + ?Sized>(
        &self,
        cloud: &[[f32; 3]],
        rng: &mut R,
    ) -> (Vec<[f32; 3]>, Vec<[f32; 3]>) {
        (self.augment(cloud, rng), self.augment(cloud, rng))
    }

    fn draw_scale<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        if self.scale_high > self.scale_low {
            rng.gen_range(self.scale_low..self.scale_high)
        } else {
            self.scale_low
        }
    }

    fn draw_shift<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        if self.translate > 0.0 {
            rng.gen_range(-self.translate..self.translate)
        } else {
            0.0
        }
    }
}

fn clipped_normal<R: Rng + ?Sized>(rng: &mut R, sigma: f32, clip: f32) -> f32 {
    match Normal::new(0.0f32, sigma) {
        Ok(normal) if sigma > 0.0 => normal.sample(rng).clamp(-clip, clip),
        _ => 0.0,
    }
}

/// `Rz * Ry * Rx` for the given angles.
fn rotation([ax, ay, az]: [f32; 3]) -> [[f32; 3]; 3] {
    let (sx, cx) = ax.sin_cos();
    let (sy, cy) = ay.sin_cos();
    let (sz, cz) = az.sin_cos();
    [
        [cz * cy, cz * sy * sx - sz * cx, cz * sy * cx + sz * sx],
        [sz * cy, sz * sy * sx + cz * cx, sz * sy * cx - cz * sx],
        [-sy, cy * sx, cy * cx],
    ]
}
