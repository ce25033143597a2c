//! Principal component reduction of a displacement matrix.
//!
//! The reduced basis keeps the left singular vectors that together capture a
//! requested fraction of the total variance, optionally re-orthonormalised with
//! Gram-Schmidt so the deformer can treat the columns as an orthonormal frame.

use crate::linalg::{FaerSvd, LinalgError};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use thiserror::Error;

/// Columns whose residual norm falls below this are zeroed during orthonormalisation.
pub const ORTHONORMAL_TOLERANCE: f64 = 1.0e-6;

#[derive(Debug, Error)]
pub enum PcaError {
    #[error("singular value decomposition failed: {0}")]
    Linalg(#[from] LinalgError),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PcaOptions {
    /// Target fraction of total variance in `(0, 1]`. Callers validate the range.
    pub variance_fraction: f64,
    /// Mean-centre rows and scale by `1/sqrt(cols - 1)` before decomposing.
    pub shift: bool,
    pub orthonormalize: bool,
}

impl Default for PcaOptions {
    fn default() -> Self {
        Self {
            variance_fraction: 1.0,
            shift: false,
            orthonormalize: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PcaBasis {
    /// `(rows x rank)` basis, columns ordered by descending eigenvalue.
    pub basis: Array2<f64>,
    /// Squared singular values of every candidate component, descending.
    pub eigenvalues: Array1<f64>,
    pub rank: usize,
}

impl PcaBasis {
    pub fn retained_eigenvalues(&self) -> ArrayView1<'_, f64> {
        self.eigenvalues.slice(s![..self.rank])
    }

    /// Fraction of the total variance captured by the retained components.
    pub fn captured_variance(&self) -> f64 {
        let total = self.eigenvalues.sum();
        if total <= 0.0 {
            return 1.0;
        }
        self.retained_eigenvalues().sum() / total
    }
}

/// Smallest prefix of `eigenvalues` whose cumulative sum reaches `fraction` of the total.
///
/// `eigenvalues` must already be in descending order. An empty spectrum selects
/// rank 0; otherwise at least one component is kept.
pub fn select_rank(eigenvalues: &Array1<f64>, fraction: f64) -> usize {
    let cutoff = fraction * eigenvalues.sum();
    let mut kept = 0.0;
    let mut rank = 0;
    for &value in eigenvalues.iter() {
        kept += value;
        rank += 1;
        if kept >= cutoff {
            break;
        }
    }
    rank
}

/// Gram-Schmidt over columns `start..`, treating columns before `start` as already orthonormal.
///
/// A column that is numerically dependent on its predecessors is set to zero
/// instead of being normalised.
pub fn orthonormalize_columns(matrix: &mut Array2<f64>, start: usize) {
    for x in start..matrix.ncols() {
        for y in 0..x {
            let previous = matrix.column(y).to_owned();
            let dot = previous.dot(&matrix.column(x));
            matrix.column_mut(x).scaled_add(-dot, &previous);
        }
        let norm = matrix.column(x).dot(&matrix.column(x)).sqrt();
        if norm >= ORTHONORMAL_TOLERANCE {
            matrix.column_mut(x).mapv_inplace(|v| v / norm);
        } else {
            matrix.column_mut(x).fill(0.0);
        }
    }
}

fn shift_rows(matrix: &mut Array2<f64>) {
    let cols = matrix.ncols();
    if cols == 0 {
        return;
    }
    if let Some(means) = matrix.mean_axis(Axis(1)) {
        for (mut row, mean) in matrix.rows_mut().into_iter().zip(means.iter()) {
            row.mapv_inplace(|v| v - mean);
        }
    }
    if cols > 1 {
        let scale = 1.0 / ((cols - 1) as f64).sqrt();
        matrix.mapv_inplace(|v| v * scale);
    } else {
        warn!("Only one example column; skipping the 1/sqrt(cols - 1) variance scaling");
    }
}

/// Reduces `matrix` to the principal components covering `options.variance_fraction`.
pub fn reduce(matrix: &Array2<f64>, options: &PcaOptions) -> Result<PcaBasis, PcaError> {
    let mut working = matrix.to_owned();
    if options.shift {
        shift_rows(&mut working);
    }

    let (vectors, singular_values) = working.thin_left_svd()?;
    let eigenvalues = singular_values.mapv(|v| v * v);
    let rank = select_rank(&eigenvalues, options.variance_fraction);
    debug!(
        "Eigenvalue spectrum over {} components: {:?}",
        eigenvalues.len(),
        eigenvalues
    );

    let mut basis = vectors.slice(s![.., ..rank]).to_owned();
    if options.orthonormalize {
        orthonormalize_columns(&mut basis, 0);
    }

    let reduced = PcaBasis {
        basis,
        eigenvalues,
        rank,
    };
    info!(
        "Kept {} of {} components ({:.2}% of variance, target {:.2}%)",
        rank,
        reduced.eigenvalues.len(),
        100.0 * reduced.captured_variance(),
        100.0 * options.variance_fraction
    );
    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    fn assert_orthonormal(matrix: &Array2<f64>) {
        let gram = matrix.t().dot(matrix);
        for i in 0..gram.nrows() {
            for j in 0..gram.ncols() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[(i, j)], expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn select_rank_takes_smallest_sufficient_prefix() {
        let eigenvalues = array![6.0, 3.0, 1.0];
        assert_eq!(select_rank(&eigenvalues, 0.5), 1);
        assert_eq!(select_rank(&eigenvalues, 0.6), 1);
        assert_eq!(select_rank(&eigenvalues, 0.61), 2);
        assert_eq!(select_rank(&eigenvalues, 0.9), 2);
        assert_eq!(select_rank(&eigenvalues, 1.0), 3);
        assert_eq!(select_rank(&Array1::zeros(0), 1.0), 0);
    }

    #[test]
    fn rank_is_monotonic_in_variance_fraction() {
        let matrix = random_matrix(30, 8, 3);
        let mut previous = 0;
        for step in 1..=20 {
            let fraction = step as f64 / 20.0;
            let options = PcaOptions {
                variance_fraction: fraction,
                shift: false,
                orthonormalize: false,
            };
            let rank = reduce(&matrix, &options).unwrap().rank;
            assert!(rank >= previous, "rank dropped at fraction {fraction}");
            previous = rank;
        }
    }

    #[test]
    fn full_variance_keeps_full_rank() {
        for (rows, cols) in [(12, 5), (4, 9)] {
            let matrix = random_matrix(rows, cols, 17);
            let reduced = reduce(&matrix, &PcaOptions::default()).unwrap();
            assert_eq!(reduced.rank, rows.min(cols));
            assert_eq!(reduced.basis.dim(), (rows, rows.min(cols)));
            assert_orthonormal(&reduced.basis);
            assert_abs_diff_eq!(reduced.captured_variance(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn dominant_direction_is_found_first() {
        // Every column is a multiple of the same direction plus tiny noise.
        let direction = array![1.0, 2.0, 2.0, 0.0, 0.0, 0.0];
        let mut matrix = Array2::zeros((6, 4));
        let noise = random_matrix(6, 4, 5);
        for (j, scale) in [1.0, -2.0, 3.0, 0.5].iter().enumerate() {
            let column = &direction * *scale + &(noise.column(j).to_owned() * 1e-6);
            matrix.column_mut(j).assign(&column);
        }
        let reduced = reduce(
            &matrix,
            &PcaOptions {
                variance_fraction: 0.99,
                shift: false,
                orthonormalize: true,
            },
        )
        .unwrap();
        assert_eq!(reduced.rank, 1);
        let alignment = reduced.basis.column(0).dot(&direction) / 3.0;
        assert_abs_diff_eq!(alignment.abs(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn shift_centres_rows_and_scales() {
        let mut matrix = array![[1.0, 3.0, 5.0], [2.0, 2.0, 2.0]];
        shift_rows(&mut matrix);
        let scale = 1.0 / 2.0_f64.sqrt();
        assert_abs_diff_eq!(matrix[(0, 0)], -2.0 * scale, epsilon = 1e-12);
        assert_abs_diff_eq!(matrix[(0, 1)], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(matrix[(0, 2)], 2.0 * scale, epsilon = 1e-12);
        assert!(matrix.row(1).iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn shifted_single_column_stays_finite() {
        let matrix = array![[1.0], [2.0], [3.0]];
        let reduced = reduce(
            &matrix,
            &PcaOptions {
                variance_fraction: 1.0,
                shift: true,
                orthonormalize: true,
            },
        )
        .unwrap();
        assert!(reduced.basis.iter().all(|v| v.is_finite()));
        assert_eq!(reduced.rank, 1);
    }

    #[test]
    fn orthonormalization_is_idempotent() {
        let mut once = random_matrix(15, 6, 23);
        orthonormalize_columns(&mut once, 0);
        assert_orthonormal(&once);

        let mut twice = once.clone();
        orthonormalize_columns(&mut twice, 0);
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
        }
    }

    #[test]
    fn dependent_columns_are_zeroed() {
        let mut matrix = array![[1.0, 2.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]];
        orthonormalize_columns(&mut matrix, 0);
        assert_eq!(matrix.column(0).to_vec(), vec![1.0, 0.0, 0.0]);
        assert!(matrix.column(1).iter().all(|&v| v == 0.0));
        assert_eq!(matrix.column(2).to_vec(), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn orthonormalization_can_start_mid_matrix() {
        let mut matrix = array![[1.0, 1.0], [0.0, 1.0]];
        orthonormalize_columns(&mut matrix, 1);
        assert_eq!(matrix.column(0).to_vec(), vec![1.0, 0.0]);
        assert_abs_diff_eq!(matrix[(0, 1)], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(matrix[(1, 1)], 1.0, epsilon = 1e-12);
    }
}
