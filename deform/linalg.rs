use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatRef, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerStorage<'a> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy faer view over an ndarray matrix when the memory layout allows it.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_row_major_slice(slice, array.nrows(), array.ncols()),
            ),
            Some(slice) if array.t().is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_column_major_slice(slice, array.nrows(), array.ncols()),
            ),
            _ => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub trait FaerSvd {
    /// Thin SVD returning `(U, singular_values)` with `U` of shape `rows x min(rows, cols)`.
    ///
    /// Singular values come back in descending order, with the columns of `U`
    /// permuted to match.
    fn thin_left_svd(&self) -> Result<(Array2<f64>, Array1<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> FaerSvd for ArrayBase<S, Ix2> {
    fn thin_left_svd(&self) -> Result<(Array2<f64>, Array1<f64>), LinalgError> {
        let (rows, cols) = self.dim();
        let size = rows.min(cols);
        if size == 0 {
            return Ok((Array2::zeros((rows, 0)), Array1::zeros(0)));
        }

        let faer_view = FaerArrayView::new(self);
        let mut singular = Diag::<f64>::zeros(size);
        let mut u_storage = Mat::<f64>::zeros(rows, size);

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::Thin,
            ComputeSvdVectors::No,
            par,
            Default::default(),
        ));
        let mut stack = MemStack::new(&mut mem);

        svd::svd(
            faer_view.as_ref(),
            singular.as_mut(),
            Some(u_storage.as_mut()),
            None,
            par,
            &mut stack,
            Default::default(),
        )
        .map_err(|_| LinalgError::SvdNoConvergence)?;

        let values = diag_to_array(singular.as_ref());
        let vectors = mat_to_array(u_storage.as_ref());

        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&i, &j| {
            values[j]
                .partial_cmp(&values[i])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let sorted_values = Array1::from_iter(order.iter().map(|&idx| values[idx]));
        let sorted_vectors = vectors.select(Axis(1), &order);
        Ok((sorted_vectors, sorted_values))
    }
}

pub trait FaerQr {
    /// Thin Householder QR with the sign convention `diag(R) >= 0`.
    ///
    /// `Q` has shape `rows x min(rows, cols)`, `R` has shape `min(rows, cols) x cols`.
    fn thin_qr(&self) -> (Array2<f64>, Array2<f64>);
}

impl<S: Data<Elem = f64>> FaerQr for ArrayBase<S, Ix2> {
    fn thin_qr(&self) -> (Array2<f64>, Array2<f64>) {
        let (rows, cols) = self.dim();
        let size = rows.min(cols);
        if size == 0 {
            return (Array2::zeros((rows, 0)), Array2::zeros((0, cols)));
        }

        let faer_view = FaerArrayView::new(self);
        let qr = faer_view.as_ref().qr();
        let mut q = mat_to_array(qr.compute_thin_Q().as_ref());
        let mut r = q.t().dot(self);

        // Householder reflections leave the sign of each column free; pin it so
        // projections onto Q are reproducible.
        for k in 0..size {
            if r[(k, k)] < 0.0 {
                q.column_mut(k).mapv_inplace(|v| -v);
                r.row_mut(k).mapv_inplace(|v| -v);
            }
        }
        (q, r)
    }
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

    #[test]
    fn thin_svd_reconstructs_gram_spectrum() {
        let matrix = random_matrix(9, 4, 7);
        let (u, singular) = matrix.thin_left_svd().unwrap();
        assert_eq!(u.dim(), (9, 4));
        assert_eq!(singular.len(), 4);
        for pair in singular.windows(2) {
            assert!(pair[0] >= pair[1]);
        }

        let utu = u.t().dot(&u);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(utu[(i, j)], expected, epsilon = 1e-10);
            }
        }

        // U^T A A^T U is diagonal with the squared singular values.
        let projected = u.t().dot(&matrix);
        let gram = projected.dot(&projected.t());
        for k in 0..4 {
            assert_abs_diff_eq!(gram[(k, k)], singular[k] * singular[k], epsilon = 1e-9);
        }
    }

    #[test]
    fn thin_svd_handles_empty_input() {
        let matrix = Array2::<f64>::zeros((6, 0));
        let (u, singular) = matrix.thin_left_svd().unwrap();
        assert_eq!(u.dim(), (6, 0));
        assert!(singular.is_empty());
    }

    #[test]
    fn thin_qr_has_non_negative_diagonal_and_reconstructs() {
        let matrix = random_matrix(12, 3, 11);
        let (q, r) = matrix.thin_qr();
        assert_eq!(q.dim(), (12, 3));
        assert_eq!(r.dim(), (3, 3));
        for k in 0..3 {
            assert!(r[(k, k)] >= 0.0);
        }
        let rebuilt = q.dot(&r);
        for (a, b) in rebuilt.iter().zip(matrix.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
    }

    #[test]
    fn thin_qr_of_unit_column_is_that_column() {
        let matrix = array![[0.0], [0.0], [1.0], [0.0]];
        let (q, r) = matrix.thin_qr();
        assert_abs_diff_eq!(q[(2, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r[(0, 0)], 1.0, epsilon = 1e-12);
    }
}
