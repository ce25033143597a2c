use crate::builder::ExampleSet;
use crate::pca::PcaOptions;
use crate::sampler::DeltaMode;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Missing required setting '{0}'.")]
    MissingField(&'static str),
    #[error("At least one shape file is required.")]
    NoShapes,
    #[error("{skins} skin files were given for {shapes} shape files; the counts must match.")]
    SkinCountMismatch { shapes: usize, skins: usize },
    #[error("Variance fraction must be in (0, 1], got {0}.")]
    VarianceOutOfRange(f64),
    #[error("Pose-space deltas need one skin file per shape file.")]
    PoseSpaceWithoutSkins,
}

fn enabled() -> bool {
    true
}

/// Settings for one shape matrix build, loadable from TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub rest: Option<PathBuf>,
    #[serde(default)]
    pub shapes: Vec<PathBuf>,
    /// Empty means deltas are measured from the rest pose.
    #[serde(default)]
    pub skins: Vec<PathBuf>,
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// When set, the shape matrix is reduced to the components covering this fraction.
    #[serde(default)]
    pub variance: Option<f64>,
    #[serde(default = "enabled")]
    pub orthonormalize: bool,
    #[serde(default)]
    pub pose_space: bool,
    #[serde(default)]
    pub center: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            rest: None,
            shapes: Vec::new(),
            skins: Vec::new(),
            output: None,
            variance: None,
            orthonormalize: true,
            pose_space: false,
            center: false,
        }
    }
}

impl BuildConfig {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }

    /// Checks every rule that can be decided without touching geometry files.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rest.is_none() {
            return Err(ConfigError::MissingField("rest"));
        }
        if self.output.is_none() {
            return Err(ConfigError::MissingField("output"));
        }
        if self.shapes.is_empty() {
            return Err(ConfigError::NoShapes);
        }
        if !self.skins.is_empty() && self.skins.len() != self.shapes.len() {
            return Err(ConfigError::SkinCountMismatch {
                shapes: self.shapes.len(),
                skins: self.skins.len(),
            });
        }
        if let Some(fraction) = self.variance {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(ConfigError::VarianceOutOfRange(fraction));
            }
        }
        if self.pose_space && self.skins.is_empty() {
            return Err(ConfigError::PoseSpaceWithoutSkins);
        }
        Ok(())
    }

    pub fn examples(&self) -> ExampleSet {
        if self.skins.is_empty() {
            ExampleSet::new(self.shapes.clone())
        } else {
            ExampleSet::parallel(self.shapes.clone(), self.skins.clone())
        }
    }

    pub fn delta_mode(&self) -> DeltaMode {
        if self.pose_space {
            DeltaMode::PoseSpace
        } else {
            DeltaMode::Plain
        }
    }

    /// PCA settings, or `None` when the raw shape matrix should be written.
    pub fn pca_options(&self) -> Option<PcaOptions> {
        self.variance.map(|variance_fraction| PcaOptions {
            variance_fraction,
            shift: self.center,
            orthonormalize: self.orthonormalize,
        })
    }
}
