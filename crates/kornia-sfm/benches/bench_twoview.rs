use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use glam::{DVec2, DVec3};
use kornia_sfm::camera::{CameraPose, PinholeCamera};
use kornia_sfm::linalg::exp_so3;
use kornia_sfm::pose::{estimate_relative_pose, MinimalSolver, TwoViewConfig};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn generate_pair(num_points: usize, outlier_ratio: f64, seed: u64) -> (Vec<DVec2>, Vec<DVec2>) {
    let camera = PinholeCamera::new(800.0, 800.0, 640.0, 480.0, 1280, 960);
    let motion = CameraPose::new(
        exp_so3(DVec3::new(0.02, -0.1, 0.01)),
        DVec3::new(-1.0, 0.05, 0.1),
    );
    let mut rng = StdRng::seed_from_u64(seed);

    let mut x1 = Vec::with_capacity(num_points);
    let mut x2 = Vec::with_capacity(num_points);
    while x1.len() < num_points {
        let p = DVec3::new(
            rng.random_range(-2.0..2.0),
            rng.random_range(-1.5..1.5),
            rng.random_range(5.0..9.0),
        );
        let (Some(a), Some(b)) = (camera.project(p), motion.project(&camera, p)) else {
            continue;
        };
        let noise = DVec2::new(rng.random_range(-0.5..0.5), rng.random_range(-0.5..0.5));
        x1.push(a);
        if rng.random_bool(outlier_ratio) {
            x2.push(DVec2::new(
                rng.random_range(0.0..1280.0),
                rng.random_range(0.0..960.0),
            ));
        } else {
            x2.push(b + noise);
        }
    }
    (x1, x2)
}

fn bench_relative_pose(c: &mut Criterion) {
    let camera = PinholeCamera::new(800.0, 800.0, 640.0, 480.0, 1280, 960);
    for solver in [MinimalSolver::FivePoint, MinimalSolver::EightPoint] {
        let mut group = c.benchmark_group(format!("relative_pose_{solver:?}"));
        let config = TwoViewConfig {
            solver,
            ..Default::default()
        };
        for &n in &[100usize, 500, 2000] {
            let (x1, x2) = generate_pair(n, 0.3, 42);
            group.throughput(Throughput::Elements(n as u64));
            group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
                b.iter(|| {
                    let res = estimate_relative_pose(&x1, &x2, &camera, &camera, &config);
                    std::hint::black_box(res.is_ok());
                });
            });
        }
        group.finish();
    }
}

criterion_group!(benches, bench_relative_pose);
criterion_main!(benches);
