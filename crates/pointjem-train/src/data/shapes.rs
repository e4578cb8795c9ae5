//! Point-cloud dataset trait and a synthetic primitive-shape dataset.

use std::f32::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A dataset returns one cloud of xyz points per index.
pub trait PointCloudDataset {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn num_points(&self) -> usize;
    fn get_item(&self, idx: usize) -> Vec<[f32; 3]>;
}

/// Primitive surfaces the synthetic dataset samples from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Sphere,
    Cube,
    Torus,
    Cylinder,
}

impl ShapeKind {
    pub const ALL: [ShapeKind; 4] = [
        ShapeKind::Sphere,
        ShapeKind::Cube,
        ShapeKind::Torus,
        ShapeKind::Cylinder,
    ];

    /// One point on the unit-sized surface.
    fn sample(self, rng: &mut StdRng) -> [f32; 3] {
        match self {
            ShapeKind::Sphere => {
                let z: f32 = rng.gen_range(-1.0..1.0);
                let phi = rng.gen_range(0.0..2.0 * PI);
                let r = (1.0 - z * z).sqrt();
                [r * phi.cos(), r * phi.sin(), z]
            }
            ShapeKind::Cube => {
                let face = rng.gen_range(0..6usize);
                let u: f32 = rng.gen_range(-1.0..1.0);
                let v: f32 = rng.gen_range(-1.0..1.0);
                let side = if face % 2 == 0 { 1.0 } else { -1.0 };
                match face / 2 {
                    0 => [side, u, v],
                    1 => [u, side, v],
                    _ => [u, v, side],
                }
            }
            ShapeKind::Torus => {
                let (major, minor) = (0.7f32, 0.3f32);
                let theta = rng.gen_range(0.0..2.0 * PI);
                let phi = rng.gen_range(0.0..2.0 * PI);
                let ring = major + minor * phi.cos();
                [ring * theta.cos(), ring * theta.sin(), minor * phi.sin()]
            }
            ShapeKind::Cylinder => {
                let theta = rng.gen_range(0.0..2.0 * PI);
                let z: f32 = rng.gen_range(-1.0..1.0);
                [theta.cos(), theta.sin(), z]
            }
        }
    }
}

/// Deterministic seeded clouds cycling through [`ShapeKind::ALL`], each with
/// its own random scale in `[0.5, 1.0)`.
pub struct SyntheticShapes {
    clouds: Vec<Vec<[f32; 3]>>,
    num_points: usize,
}

impl SyntheticShapes {
    pub fn new(num_samples: usize, num_points: usize, seed: u64) -> Self {
        assert!(num_points > 0, "num_points must be > 0");
        let mut rng = StdRng::seed_from_u64(seed);
        let clouds = (0..num_samples)
            .map(|i| {
                let kind = ShapeKind::ALL[i % ShapeKind::ALL.len()];
                let scale: f32 = rng.gen_range(0.5..1.0);
                (0..num_points)
                    .map(|_| kind.sample(&mut rng).map(|c| c * scale))
                    .collect()
            })
            .collect();
        Self { clouds, num_points }
    }

    pub fn kind_of(&self, idx: usize) -> ShapeKind {
        ShapeKind::ALL[idx % ShapeKind::ALL.len()]
    }
}

impl PointCloudDataset for SyntheticShapes {
    fn len(&self) -> usize {
        self.clouds.len()
    }

    fn num_points(&self) -> usize {
        self.num_points
    }

    fn get_item(&self, idx: usize) -> Vec<[f32; 3]> {
        self.clouds[idx].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(p: &[f32; 3]) -> f32 {
        (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt()
    }

    #[test]
    fn test_synthetic_shapes_deterministic() {
        let a = SyntheticShapes::new(8, 32, 7);
        let b = SyntheticShapes::new(8, 32, 7);
        assert_eq!(a.len(), 8);
        for i in 0..a.len() {
            assert_eq!(a.get_item(i), b.get_item(i));
            assert_eq!(a.get_item(i).len(), 32);
        }
    }

    #[test]
    fn test_shapes_lie_on_scaled_surfaces() {
        let ds = SyntheticShapes::new(8, 64, 3);
        for i in 0..ds.len() {
            let cloud = ds.get_item(i);
            let radii: Vec<f32> = cloud.iter().map(norm).collect();
            let max = radii.iter().cloned().fold(0.0f32, f32::max);
            match ds.kind_of(i) {
                ShapeKind::Sphere => {
                    let min = radii.iter().cloned().fold(f32::MAX, f32::min);
                    assert!((max - min).abs() < 1e-4, "sphere radii vary");
                }
                ShapeKind::Cube => {
                    for p in &cloud {
                        let inf = p.iter().fold(0.0f32, |m, c| m.max(c.abs()));
                        assert!((inf - cloud_scale_inf(&cloud)).abs() < 1e-4);
                    }
                }
                _ => assert!(max <= 2.0),
            }
        }
    }

    fn cloud_scale_inf(cloud: &[[f32; 3]]) -> f32 {
        cloud
            .iter()
            .map(|p| p.iter().fold(0.0f32, |m, c| m.max(c.abs())))
            .fold(0.0f32, f32::max)
    }
}
