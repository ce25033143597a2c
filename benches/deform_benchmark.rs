use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use subdeform::codec::write_matrix;
use subdeform::deformer::{DeformMode, DeformParams, SubspaceDeformer};
use subdeform::geometry::{PointSet, REST_ATTRIBUTE};
use subdeform::pca::orthonormalize_columns;

const COMPONENTS: usize = 16;

fn random_points(count: usize, rng: &mut StdRng) -> Vec<[f64; 3]> {
    (0..count)
        .map(|_| {
            [
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            ]
        })
        .collect()
}

fn random_basis(points: usize, rng: &mut StdRng) -> Array2<f64> {
    let mut basis = Array2::from_shape_fn((3 * points, COMPONENTS), |_| rng.gen_range(-1.0..1.0));
    orthonormalize_columns(&mut basis, 0);
    basis
}

fn frame(points: usize, rng: &mut StdRng) -> PointSet {
    let rest = random_points(points, rng);
    let live: Vec<[f64; 3]> = rest
        .iter()
        .map(|p| [p[0] + 0.1, p[1] - 0.05, p[2] + rng.gen_range(-0.1..0.1)])
        .collect();
    PointSet::from_points(&live)
        .with_attribute(REST_ATTRIBUTE, &rest)
        .expect("rest attribute matches point count")
}

fn bench_mode(c: &mut Criterion, dir: &Path, mode: DeformMode) {
    let mut group = c.benchmark_group(format!("evaluate_{mode}"));
    for &points in &[1_000usize, 10_000] {
        let mut rng = StdRng::seed_from_u64(0x5EED + points as u64);
        let basis_path = dir.join(format!("basis_{points}.matrix"));
        write_matrix(&random_basis(points, &mut rng), &basis_path).expect("write basis");
        let template = frame(points, &mut rng);
        let params = DeformParams::new(&basis_path, mode, 0.5);

        // Warm the cache so the loop measures steady-state evaluation only.
        let mut deformer = SubspaceDeformer::new();
        deformer
            .evaluate(&mut template.clone(), &params, None)
            .expect("initial evaluation");

        group.throughput(Throughput::Elements(points as u64));
        group.bench_with_input(BenchmarkId::from_parameter(points), &template, |b, input| {
            b.iter(|| {
                let mut live = input.clone();
                let evaluation = deformer.evaluate(black_box(&mut live), &params, None);
                black_box(evaluation).expect("evaluation");
            });
        });
    }
    group.finish();
}

fn benchmark_deformer(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temporary directory");
    bench_mode(c, dir.path(), DeformMode::Orthogonal);
    bench_mode(c, dir.path(), DeformMode::Principal);
}

criterion_group!(deform_benchmark, benchmark_deformer);
criterion_main!(deform_benchmark);
