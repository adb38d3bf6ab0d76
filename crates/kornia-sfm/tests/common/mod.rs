//! Synthetic scenes shared by the integration tests.
#![allow(dead_code)]

use glam::{DVec2, DVec3};
use kornia_sfm::camera::{CameraPose, PinholeCamera};
use kornia_sfm::features::{Descriptors, Features, View};
use kornia_sfm::linalg::exp_so3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Descriptor flavour used when rendering a scene.
#[derive(Clone, Copy, Debug)]
pub enum DescriptorFlavor {
    Float,
    Binary,
}

/// Options of the rendered observations.
#[derive(Clone, Copy, Debug)]
pub struct RenderOptions {
    /// Uniform keypoint noise amplitude in pixels.
    pub pixel_noise: f64,
    /// Fraction of keypoints per image whose descriptors are swapped with another keypoint.
    pub mismatch_ratio: f64,
    pub flavor: DescriptorFlavor,
    pub seed: u64,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            pixel_noise: 0.5,
            mismatch_ratio: 0.02,
            flavor: DescriptorFlavor::Float,
            seed: 42,
        }
    }
}

/// Points on the surface of a cube seen by cameras on an arc.
pub struct CubeScene {
    pub camera: PinholeCamera,
    pub poses: Vec<CameraPose>,
    pub points: Vec<DVec3>,
}

impl CubeScene {
    /// A cube of side 2 centered 6 units in front of the middle camera.
    pub fn new(num_cameras: usize, num_points: usize, seed: u64) -> Self {
        let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let center = DVec3::new(0.0, 0.0, 6.0);
        let mut rng = StdRng::seed_from_u64(seed);

        let points = (0..num_points)
            .map(|_| {
                let face = rng.random_range(0..6);
                let (u, v): (f64, f64) = (rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0));
                let sign = if face % 2 == 0 { 1.0 } else { -1.0 };
                let local = match face / 2 {
                    0 => DVec3::new(sign, u, v),
                    1 => DVec3::new(u, sign, v),
                    _ => DVec3::new(u, v, sign),
                };
                center + local
            })
            .collect();

        let half = (num_cameras as f64 - 1.0) / 2.0;
        let poses = (0..num_cameras)
            .map(|i| {
                let theta = (i as f64 - half) * 10f64.to_radians();
                let c = center + DVec3::new(theta.sin(), 0.0, -theta.cos()) * 6.0;
                // optical axis towards the cube center
                let r = exp_so3(DVec3::new(0.0, theta, 0.0));
                CameraPose::new(r, -(r * c))
            })
            .collect();

        Self {
            camera,
            poses,
            points,
        }
    }

    /// Render one view per camera with noisy keypoints in shuffled order.
    pub fn render(&self, options: &RenderOptions) -> Vec<View> {
        let mut rng = StdRng::seed_from_u64(options.seed);
        let signatures: Vec<Vec<f32>> = (0..self.points.len())
            .map(|_| (0..16).map(|_| rng.random::<f32>()).collect())
            .collect();

        self.poses
            .iter()
            .enumerate()
            .map(|(i, pose)| {
                let mut order: Vec<usize> = (0..self.points.len()).collect();
                order.shuffle(&mut rng);

                let keypoints: Vec<DVec2> = order
                    .iter()
                    .map(|&p| {
                        let noise = DVec2::new(
                            rng.random_range(-options.pixel_noise..=options.pixel_noise),
                            rng.random_range(-options.pixel_noise..=options.pixel_noise),
                        );
                        let uv = pose.project(&self.camera, self.points[p]);
                        uv.unwrap_or(DVec2::ZERO) + noise
                    })
                    .collect();

                let mut signature_of = order.clone();
                let swaps = (options.mismatch_ratio * order.len() as f64).round() as usize;
                for _ in 0..swaps {
                    let a = rng.random_range(0..order.len());
                    let b = rng.random_range(0..order.len());
                    signature_of.swap(a, b);
                }

                let descriptors = match options.flavor {
                    DescriptorFlavor::Float => {
                        let mut data = Vec::with_capacity(16 * order.len());
                        for &p in &signature_of {
                            for v in &signatures[p] {
                                data.push(v + rng.random_range(-0.01f32..0.01));
                            }
                        }
                        Descriptors::Float { dim: 16, data }
                    }
                    DescriptorFlavor::Binary => Descriptors::Binary {
                        bytes: 16,
                        data: signature_of
                            .iter()
                            .flat_map(|&p| signatures[p].iter().map(|v| (v * 255.0) as u8))
                            .collect(),
                    },
                };
                let colors = signature_of
                    .iter()
                    .map(|&p| [(p % 256) as u8, 128, 64])
                    .collect();

                let features = Features {
                    keypoints,
                    descriptors,
                    colors: Some(colors),
                };
                View::new(format!("cube_{i:02}"), self.camera, features).unwrap()
            })
            .collect()
    }

    /// Ground truth in the frame of camera `first` with the `first`-`second` baseline as unit.
    pub fn normalized(&self, first: usize, second: usize) -> (Vec<DVec3>, Vec<DVec3>) {
        let reference = self.poses[first];
        let baseline = (self.poses[second].center() - reference.center()).length();
        let points = self
            .points
            .iter()
            .map(|p| reference.transform_point(*p) / baseline)
            .collect();
        let centers = self
            .poses
            .iter()
            .map(|p| reference.transform_point(p.center()) / baseline)
            .collect();
        (points, centers)
    }
}

/// Centroid and RMS distance to the centroid.
pub fn centroid_and_spread(points: &[DVec3]) -> (DVec3, f64) {
    let n = points.len().max(1) as f64;
    let centroid = points.iter().copied().sum::<DVec3>() / n;
    let sq: f64 = points.iter().map(|p| p.distance_squared(centroid)).sum();
    let spread = (sq / n).sqrt();
    (centroid, spread)
}
