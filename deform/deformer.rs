//! Runtime subspace deformation.
//!
//! A [`SubspaceDeformer`] owns a basis matrix loaded from disk together with the
//! values derived from it (its transpose and a lazily built QR factor). Each
//! evaluation measures the live geometry's displacement from its "rest"
//! attribute and pushes every point through one of two strategies:
//!
//! * [`DeformMode::Orthogonal`] projects the displacement onto the orthogonal
//!   factor of the basis and subtracts the resulting combination of basis
//!   columns, scaled by the strength.
//! * [`DeformMode::Principal`] filters the displacement through `B Bᵀ` and adds
//!   the reconstruction, scaled by the strength.
//!
//! The two sign conventions differ on purpose and are kept separate.

use crate::codec::{CodecError, read_matrix};
use crate::geometry::PointGeometry;
use crate::linalg::FaerQr;
use crate::sampler::{SampleError, position_delta};
use glam::DVec3;
use log::debug;
use ndarray::{Array1, Array2, s};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeformError {
    #[error("failed to load the basis matrix: {0}")]
    Codec(#[from] CodecError),
    #[error("can't compute the displacement: {0}")]
    Sample(#[from] SampleError),
    #[error("basis has {rows} rows but the geometry has {points} points ({expected} rows needed)")]
    DimensionMismatch {
        rows: usize,
        points: usize,
        expected: usize,
    },
    #[error("unknown deformation mode '{0}' (expected 0, 1, orthogonal or principal)")]
    InvalidMode(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeformMode {
    #[default]
    Orthogonal,
    Principal,
}

impl DeformMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orthogonal => "orthogonal",
            Self::Principal => "principal",
        }
    }
}

impl fmt::Display for DeformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeformMode {
    type Err = DeformError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "orthogonal" => Ok(Self::Orthogonal),
            "1" | "principal" => Ok(Self::Principal),
            _ => Err(DeformError::InvalidMode(value.to_string())),
        }
    }
}

impl TryFrom<i64> for DeformMode {
    type Error = DeformError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Orthogonal),
            1 => Ok(Self::Principal),
            other => Err(DeformError::InvalidMode(other.to_string())),
        }
    }
}

/// Per-evaluation parameters supplied by the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct DeformParams {
    pub basis_path: PathBuf,
    pub mode: DeformMode,
    pub strength: f64,
}

impl DeformParams {
    pub fn new<P: Into<PathBuf>>(basis_path: P, mode: DeformMode, strength: f64) -> Self {
        Self {
            basis_path: basis_path.into(),
            mode,
            strength,
        }
    }
}

/// Thin QR factor of the basis, with `diag(r) >= 0`.
#[derive(Clone, Debug)]
pub struct QrFactor {
    pub q: Array2<f64>,
    pub r: Array2<f64>,
}

impl QrFactor {
    pub fn of(basis: &Array2<f64>) -> Self {
        let (q, r) = basis.thin_qr();
        Self { q, r }
    }
}

/// Outcome of one successful evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub mode: DeformMode,
    /// Per-column weights (orthogonal) or reduced coefficients (principal).
    pub coefficients: Array1<f64>,
    /// Whether the geometry's position revision was bumped.
    pub bumped: bool,
}

#[derive(Debug)]
pub struct SubspaceDeformer {
    basis: Array2<f64>,
    transposed: Array2<f64>,
    basis_path: Option<PathBuf>,
    qr: Option<QrFactor>,
    needs_reload: bool,
}

impl Default for SubspaceDeformer {
    fn default() -> Self {
        Self::new()
    }
}

impl SubspaceDeformer {
    pub fn new() -> Self {
        Self {
            basis: Array2::zeros((0, 0)),
            transposed: Array2::zeros((0, 0)),
            basis_path: None,
            qr: None,
            needs_reload: true,
        }
    }

    pub fn basis(&self) -> &Array2<f64> {
        &self.basis
    }

    pub fn basis_path(&self) -> Option<&Path> {
        self.basis_path.as_deref()
    }

    pub fn has_qr_cache(&self) -> bool {
        self.qr.is_some()
    }

    /// Forces the basis to be re-read on the next evaluation.
    pub fn mark_dirty(&mut self) {
        self.needs_reload = true;
    }

    fn wants_reload(&self, path: &Path) -> bool {
        self.needs_reload || self.basis_path.as_deref() != Some(path)
    }

    fn commit_basis(&mut self, basis: Array2<f64>, path: &Path) {
        debug!(
            "Loaded {}x{} basis from {}",
            basis.nrows(),
            basis.ncols(),
            path.display()
        );
        self.transposed = basis.t().to_owned();
        self.basis = basis;
        self.basis_path = Some(path.to_path_buf());
        self.qr = None;
        self.needs_reload = false;
    }

    /// Re-reads the basis when `path` differs from the cached one or a reload was requested.
    ///
    /// Returns whether a reload happened. When reading fails the previous
    /// basis, path and QR cache are all kept.
    pub fn reload_if_needed(&mut self, path: &Path) -> Result<bool, DeformError> {
        if !self.wants_reload(path) {
            return Ok(false);
        }
        let basis = read_matrix(path)?;
        self.commit_basis(basis, path);
        Ok(true)
    }

    fn qr_factor(&mut self) -> &QrFactor {
        let basis = &self.basis;
        self.qr.get_or_insert_with(|| {
            debug!(
                "Building QR factor of the {}x{} basis",
                basis.nrows(),
                basis.ncols()
            );
            QrFactor::of(basis)
        })
    }

    /// Deforms every point of `geometry` in place.
    ///
    /// `selection` only decides whether the position revision is bumped: an
    /// explicit empty selection leaves it alone, anything else bumps it once.
    /// On error the geometry and all cached state are left as they were.
    pub fn evaluate<G: PointGeometry>(
        &mut self,
        geometry: &mut G,
        params: &DeformParams,
        selection: Option<&[usize]>,
    ) -> Result<Evaluation, DeformError> {
        let delta = position_delta(geometry)?;

        // A fresh basis is only committed once it fits this geometry.
        let staged = if self.wants_reload(&params.basis_path) {
            Some(read_matrix(&params.basis_path)?)
        } else {
            None
        };
        let rows = staged.as_ref().map_or(self.basis.nrows(), |basis| basis.nrows());
        if rows != delta.len() {
            return Err(DeformError::DimensionMismatch {
                rows,
                points: geometry.point_count(),
                expected: delta.len(),
            });
        }
        if let Some(basis) = staged {
            self.commit_basis(basis, &params.basis_path);
        }

        let coefficients = match params.mode {
            DeformMode::Orthogonal => self.apply_orthogonal(geometry, &delta, params.strength),
            DeformMode::Principal => self.apply_principal(geometry, &delta, params.strength),
        };

        let bumped = selection.is_none_or(|points| !points.is_empty());
        if bumped {
            geometry.bump_position_revision();
        }

        Ok(Evaluation {
            mode: params.mode,
            coefficients,
            bumped,
        })
    }

    fn apply_orthogonal<G: PointGeometry>(
        &mut self,
        geometry: &mut G,
        delta: &Array1<f64>,
        strength: f64,
    ) -> Array1<f64> {
        let projected = self.qr_factor().q.t().dot(delta);
        // Thin Q has min(rows, cols) columns; weights past its rank stay zero.
        let mut weights = Array1::zeros(self.basis.ncols());
        weights
            .slice_mut(s![..projected.len()])
            .assign(&projected);
        let displacement = self.basis.dot(&weights);
        offset_points(geometry, &displacement, -strength);
        weights
    }

    fn apply_principal<G: PointGeometry>(
        &self,
        geometry: &mut G,
        delta: &Array1<f64>,
        strength: f64,
    ) -> Array1<f64> {
        let reduced = self.transposed.dot(delta);
        let reconstructed = self.basis.dot(&reduced);
        offset_points(geometry, &reconstructed, strength);
        reduced
    }
}

fn offset_points<G: PointGeometry>(geometry: &mut G, offsets: &Array1<f64>, scale: f64) {
    for index in 0..geometry.point_count() {
        let offset = DVec3::new(
            offsets[3 * index],
            offsets[3 * index + 1],
            offsets[3 * index + 2],
        );
        let moved = geometry.position(index) + offset * scale;
        geometry.set_position(index, moved);
    }
}
