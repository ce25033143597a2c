use crate::geometry::{GeometryError, GeometryLoader, PointGeometry};
use crate::sampler::{DeltaMode, SampleError, sample_displacement};
use log::{info, warn};
use ndarray::{Array1, Array2};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no shape files were given")]
    NoShapes,
    #[error("{skins} skin files were given for {shapes} shape files; the counts must match")]
    SkinCountMismatch { shapes: usize, skins: usize },
}

/// Why an example column was left at zero.
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("can't load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: GeometryError,
    },
    #[error("{0}")]
    Sample(#[from] SampleError),
}

/// An example that did not contribute to the shape matrix.
#[derive(Debug)]
pub struct SkippedExample {
    pub column: usize,
    pub shape: PathBuf,
    pub reason: SkipReason,
}

/// Shape files with optional parallel skin files.
#[derive(Clone, Debug, Default)]
pub struct ExampleSet {
    shapes: Vec<PathBuf>,
    skins: Option<Vec<PathBuf>>,
}

impl ExampleSet {
    pub fn new(shapes: Vec<PathBuf>) -> Self {
        Self {
            shapes,
            skins: None,
        }
    }

    /// Pairs shapes with skins by position; the counts are checked when building.
    pub fn parallel(shapes: Vec<PathBuf>, skins: Vec<PathBuf>) -> Self {
        Self {
            shapes,
            skins: Some(skins),
        }
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn shapes(&self) -> &[PathBuf] {
        &self.shapes
    }

    pub fn skins(&self) -> Option<&[PathBuf]> {
        self.skins.as_deref()
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        if self.shapes.is_empty() {
            return Err(BuildError::NoShapes);
        }
        if let Some(skins) = &self.skins {
            if skins.len() != self.shapes.len() {
                return Err(BuildError::SkinCountMismatch {
                    shapes: self.shapes.len(),
                    skins: skins.len(),
                });
            }
        }
        Ok(())
    }
}

/// A `(3N x M)` displacement matrix, one column per requested example.
#[derive(Debug)]
pub struct ShapeMatrix {
    pub matrix: Array2<f64>,
    pub skipped: Vec<SkippedExample>,
}

impl ShapeMatrix {
    pub fn filled_columns(&self) -> usize {
        self.matrix.ncols() - self.skipped.len()
    }

    pub fn into_matrix(self) -> Array2<f64> {
        self.matrix
    }
}

/// Stages reported while building a shape matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildStage {
    Examples,
}

impl BuildStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Examples => "example sampling",
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress while examples are sampled.
pub trait BuildProgressObserver {
    fn on_stage_start(&mut self, stage: BuildStage, total_examples: usize) {
        let _ = (stage, total_examples);
    }
    fn on_example_done(&mut self, stage: BuildStage, processed: usize, path: &Path) {
        let _ = (stage, processed, path);
    }
    fn on_stage_finish(&mut self, stage: BuildStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopBuildProgress;

impl BuildProgressObserver for NoopBuildProgress {}

fn load_sample<L: GeometryLoader>(loader: &mut L, path: &Path) -> Result<L::Geometry, SkipReason> {
    loader.load(path).map_err(|source| SkipReason::Load {
        path: path.to_path_buf(),
        source,
    })
}

fn sample_example<L, R>(
    loader: &mut L,
    rest: &R,
    shape_path: &Path,
    skin_path: Option<&Path>,
    mode: DeltaMode,
) -> Result<Array1<f64>, SkipReason>
where
    L: GeometryLoader,
    R: PointGeometry,
{
    let shape = load_sample(loader, shape_path)?;
    let skin = match skin_path {
        Some(path) => Some(load_sample(loader, path)?),
        None => None,
    };
    Ok(sample_displacement(rest, &shape, skin.as_ref(), mode)?)
}

/// Assembles one displacement column per example.
///
/// The matrix is sized for every requested example up front. Examples that
/// can't be loaded or don't match the rest point count are logged and leave
/// their column at zero; column `j` always belongs to example `j`.
pub fn build_shape_matrix<L, R, P>(
    rest: &R,
    examples: &ExampleSet,
    mode: DeltaMode,
    loader: &mut L,
    progress: &mut P,
) -> Result<ShapeMatrix, BuildError>
where
    L: GeometryLoader,
    R: PointGeometry,
    P: BuildProgressObserver,
{
    examples.validate()?;

    let rows = 3 * rest.point_count();
    let mut matrix = Array2::zeros((rows, examples.len()));
    let mut skipped = Vec::new();

    info!(
        "Building {}x{} shape matrix from {} examples",
        rows,
        examples.len(),
        examples.len()
    );
    progress.on_stage_start(BuildStage::Examples, examples.len());

    for (column, shape_path) in examples.shapes().iter().enumerate() {
        let skin_path = examples.skins().map(|skins| skins[column].as_path());
        match sample_example(loader, rest, shape_path, skin_path, mode) {
            Ok(delta) => matrix.column_mut(column).assign(&delta),
            Err(reason) => {
                warn!("Ignoring example {}: {reason}", shape_path.display());
                skipped.push(SkippedExample {
                    column,
                    shape: shape_path.clone(),
                    reason,
                });
            }
        }
        progress.on_example_done(BuildStage::Examples, column + 1, shape_path);
    }

    progress.on_stage_finish(BuildStage::Examples);
    if !skipped.is_empty() {
        warn!(
            "{} of {} examples were skipped; their columns stay zero",
            skipped.len(),
            examples.len()
        );
    }

    Ok(ShapeMatrix { matrix, skipped })
}
