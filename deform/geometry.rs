//! Point geometry consumed by the sampler, builder and deformer.
//!
//! Only what the deformation engine needs is modelled here: a fixed number of
//! points addressed by a stable index, their positions, and named 3-component
//! vector attributes looked up by name. Correspondence between samples is
//! positional.

use ahash::AHashMap;
use glam::DVec3;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const REST_ATTRIBUTE: &str = "rest";
pub const TANGENT_U_ATTRIBUTE: &str = "tangentu";
pub const TANGENT_V_ATTRIBUTE: &str = "tangentv";

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("can't open geometry file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error on geometry file: {0}")]
    Io(#[from] io::Error),
    #[error("malformed geometry file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize geometry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("attribute '{name}' has {found} values but the geometry has {expected} points")]
    AttributeLength {
        name: String,
        expected: usize,
        found: usize,
    },
}

/// The contract the deformation engine relies on.
pub trait PointGeometry {
    fn point_count(&self) -> usize;

    fn position(&self, index: usize) -> DVec3;

    fn set_position(&mut self, index: usize, position: DVec3);

    /// An `(N, 3)` view of a named vector attribute, or `None` when absent.
    fn vector_attribute(&self, name: &str) -> Option<ArrayView2<'_, f64>>;

    /// Change-tracking marker for positions.
    fn position_revision(&self) -> u64;

    fn bump_position_revision(&mut self);
}

/// Loads geometry samples by path.
pub trait GeometryLoader {
    type Geometry: PointGeometry;

    fn load(&mut self, path: &Path) -> Result<Self::Geometry, GeometryError>;
}

/// Reads point sets from JSON files.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonPointSetLoader;

impl GeometryLoader for JsonPointSetLoader {
    type Geometry = PointSet;

    fn load(&mut self, path: &Path) -> Result<PointSet, GeometryError> {
        PointSet::load(path)
    }
}

/// A point set with positions and optional per-point vector attributes.
#[derive(Clone, Debug)]
pub struct PointSet {
    positions: Array2<f64>,
    attributes: AHashMap<String, Array2<f64>>,
    revision: u64,
}

#[derive(Serialize, Deserialize)]
struct PointSetFile {
    positions: Vec<[f64; 3]>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, Vec<[f64; 3]>>,
}

fn rows_to_array(rows: &[[f64; 3]]) -> Array2<f64> {
    Array2::from_shape_fn((rows.len(), 3), |(i, j)| rows[i][j])
}

fn array_to_rows(array: &Array2<f64>) -> Vec<[f64; 3]> {
    array
        .rows()
        .into_iter()
        .map(|row| [row[0], row[1], row[2]])
        .collect()
}

impl PointSet {
    /// Wraps an `(N, 3)` position array.
    ///
    /// # Panics
    /// Panics if `positions` does not have exactly three columns.
    pub fn new(positions: Array2<f64>) -> Self {
        assert_eq!(positions.ncols(), 3, "positions must be an (N, 3) array");
        Self {
            positions,
            attributes: AHashMap::new(),
            revision: 0,
        }
    }

    pub fn from_points(points: &[[f64; 3]]) -> Self {
        Self::new(rows_to_array(points))
    }

    pub fn len(&self) -> usize {
        self.positions.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.nrows() == 0
    }

    pub fn positions(&self) -> ArrayView2<'_, f64> {
        self.positions.view()
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn set_attribute(&mut self, name: &str, values: &[[f64; 3]]) -> Result<(), GeometryError> {
        if values.len() != self.len() {
            return Err(GeometryError::AttributeLength {
                name: name.to_string(),
                expected: self.len(),
                found: values.len(),
            });
        }
        self.attributes
            .insert(name.to_string(), rows_to_array(values));
        Ok(())
    }

    /// Builder-style [`PointSet::set_attribute`].
    pub fn with_attribute(mut self, name: &str, values: &[[f64; 3]]) -> Result<Self, GeometryError> {
        self.set_attribute(name, values)?;
        Ok(self)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, GeometryError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| GeometryError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: PointSetFile =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| {
                GeometryError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?;

        let mut points = PointSet::from_points(&parsed.positions);
        for (name, values) in &parsed.attributes {
            points.set_attribute(name, values)?;
        }
        Ok(points)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), GeometryError> {
        let attributes = self
            .attributes
            .iter()
            .map(|(name, values)| (name.clone(), array_to_rows(values)))
            .collect();
        let file = PointSetFile {
            positions: array_to_rows(&self.positions),
            attributes,
        };
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(&mut writer, &file)?;
        writer.flush()?;
        Ok(())
    }
}

impl PointGeometry for PointSet {
    fn point_count(&self) -> usize {
        self.len()
    }

    fn position(&self, index: usize) -> DVec3 {
        let row = self.positions.row(index);
        DVec3::new(row[0], row[1], row[2])
    }

    fn set_position(&mut self, index: usize, position: DVec3) {
        let mut row = self.positions.row_mut(index);
        row[0] = position.x;
        row[1] = position.y;
        row[2] = position.z;
    }

    fn vector_attribute(&self, name: &str) -> Option<ArrayView2<'_, f64>> {
        self.attributes.get(name).map(|values| values.view())
    }

    fn position_revision(&self) -> u64 {
        self.revision
    }

    fn bump_position_revision(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}

/// Reads row `index` of an `(N, 3)` attribute view as a vector.
pub fn attribute_vector(values: &ArrayView2<'_, f64>, index: usize) -> DVec3 {
    DVec3::new(values[(index, 0)], values[(index, 1)], values[(index, 2)])
}
