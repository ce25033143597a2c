#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{error, info, warn};
use ndarray::Array2;
use std::error::Error;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use subdeform::builder::{BuildProgressObserver, BuildStage, build_shape_matrix};
use subdeform::codec::{read_matrix, write_matrix};
use subdeform::config::{BuildConfig, ConfigError};
use subdeform::deformer::{DeformMode, DeformParams, SubspaceDeformer};
use subdeform::geometry::{JsonPointSetLoader, PointSet, TANGENT_U_ATTRIBUTE, TANGENT_V_ATTRIBUTE};
use subdeform::pca::reduce;
use subdeform::shared::files::resolve_geometry_paths;

type CliResult = Result<(), Box<dyn Error>>;

// ========================================================================================
//                                  Command-line surface
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "subdeform",
    version,
    about = "Example-based subspace shape deformation toolkit",
    long_about = "Builds displacement bases from example poses of a point set and applies \
                 them to new frames as a subspace correction."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a shape (or reduced PCA) basis from example poses
    #[command(about = "Build a basis matrix from example shapes (outputs: .matrix file)")]
    Build(BuildArgs),

    /// Print dimensions and orthonormality diagnostics of a matrix file
    #[command(about = "Inspect a basis matrix file")]
    Inspect {
        /// Path to the matrix file
        #[arg(value_name = "MATRIX")]
        file: PathBuf,
    },

    /// Deform frames with an existing basis
    #[command(about = "Apply a basis to geometry frames (outputs: deformed frames)")]
    Apply(ApplyArgs),
}

#[derive(Args)]
pub struct BuildArgs {
    /// Rest pose geometry file
    #[arg(long, value_name = "FILE")]
    pub rest: Option<PathBuf>,

    /// Example shape files or directories of them
    #[arg(long = "shape", value_name = "PATH", num_args = 1..)]
    pub shapes: Vec<PathBuf>,

    /// Skin pose files, one per shape, used as the delta base instead of the rest pose
    #[arg(long = "skin", value_name = "PATH", num_args = 1..)]
    pub skins: Vec<PathBuf>,

    /// Output matrix file
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Fraction of variance to keep; enables PCA reduction
    #[arg(long, value_name = "FRACTION")]
    pub variance: Option<f64>,

    /// Skip Gram-Schmidt on the reduced basis (enabled by default)
    #[arg(long)]
    pub no_orthonormalize: bool,

    /// Measure deltas in the rest pose's tangent frame (needs tangentu/tangentv attributes)
    #[arg(long)]
    pub pose_space: bool,

    /// Mean-centre the examples before the decomposition
    #[arg(long)]
    pub center: bool,

    /// TOML build configuration; command-line values override it
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Basis matrix file
    #[arg(long, value_name = "FILE")]
    pub basis: PathBuf,

    /// Deformation mode: orthogonal (0) or principal (1)
    #[arg(long, default_value = "orthogonal")]
    pub mode: DeformMode,

    /// Scale applied to the computed displacement
    #[arg(long, default_value = "1.0", allow_negative_numbers = true)]
    pub strength: f64,

    /// Point indices whose change marks the frame as modified
    #[arg(long, value_name = "IDX,...", value_delimiter = ',')]
    pub group: Option<Vec<usize>>,

    /// Directory receiving the deformed frames
    #[arg(long, value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Frame files or directories of them, processed in order
    #[arg(value_name = "FRAME", required = true)]
    pub frames: Vec<PathBuf>,
}

// ========================================================================================
//                                       Progress
// ========================================================================================

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}

#[derive(Default)]
struct ConsoleBuildProgress {
    bar: Option<ProgressBar>,
}

impl BuildProgressObserver for ConsoleBuildProgress {
    fn on_stage_start(&mut self, stage: BuildStage, total_examples: usize) {
        self.bar = Some(create_progress_bar(total_examples as u64, stage.describe()));
    }

    fn on_example_done(&mut self, stage: BuildStage, processed: usize, path: &Path) {
        if let Some(bar) = &self.bar {
            bar.set_position(processed as u64);
            bar.set_message(format!("{stage}: {}", path.display()));
        }
    }

    fn on_stage_finish(&mut self, stage: BuildStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} complete"));
        }
    }
}

// ========================================================================================
//                                        build
// ========================================================================================

fn resolve_build_config(args: BuildArgs) -> Result<BuildConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => BuildConfig::load(path)?,
        None => BuildConfig::default(),
    };

    if args.rest.is_some() {
        config.rest = args.rest;
    }
    if !args.shapes.is_empty() {
        config.shapes = args.shapes;
    }
    if !args.skins.is_empty() {
        config.skins = args.skins;
    }
    if args.output.is_some() {
        config.output = args.output;
    }
    if args.variance.is_some() {
        config.variance = args.variance;
    }
    if args.no_orthonormalize {
        config.orthonormalize = false;
    }
    if args.pose_space {
        config.pose_space = true;
    }
    if args.center {
        config.center = true;
    }

    config.validate()?;
    Ok(config)
}

fn load_rest(path: &Path, pose_space: bool) -> Result<PointSet, Box<dyn Error>> {
    let rest = PointSet::load(path)?;
    info!("Loaded rest pose with {} points from {}", rest.len(), path.display());
    if pose_space {
        for attribute in [TANGENT_U_ATTRIBUTE, TANGENT_V_ATTRIBUTE] {
            if !rest.has_attribute(attribute) {
                return Err(format!(
                    "Pose-space deltas need a '{attribute}' attribute on the rest pose {}",
                    path.display()
                )
                .into());
            }
        }
    }
    Ok(rest)
}

/// Reads `path` back and confirms it holds a matrix of the expected shape.
fn self_check(path: &Path, expected: &Array2<f64>) -> CliResult {
    let decoded = read_matrix(path)?;
    let size = fs::metadata(path)?.len();
    if decoded.dim() != expected.dim() {
        return Err(format!(
            "Self-check failed: wrote {}x{} but read back {}x{}",
            expected.nrows(),
            expected.ncols(),
            decoded.nrows(),
            decoded.ncols()
        )
        .into());
    }
    println!(
        "Self-check: {} rows, {} cols, {} bytes",
        decoded.nrows(),
        decoded.ncols(),
        size
    );
    Ok(())
}

fn run_build(args: BuildArgs) -> CliResult {
    let mut config = resolve_build_config(args)?;
    config.shapes = resolve_geometry_paths(&config.shapes)?;
    if !config.skins.is_empty() {
        config.skins = resolve_geometry_paths(&config.skins)?;
    }
    config.validate()?;

    let rest_path = config.rest.clone().ok_or(ConfigError::MissingField("rest"))?;
    let output = config.output.clone().ok_or(ConfigError::MissingField("output"))?;

    let rest = load_rest(&rest_path, config.pose_space)?;
    let built = build_shape_matrix(
        &rest,
        &config.examples(),
        config.delta_mode(),
        &mut JsonPointSetLoader,
        &mut ConsoleBuildProgress::default(),
    )?;
    if built.filled_columns() == 0 {
        warn!("No example could be sampled; the basis will be all zeros");
    }

    let basis = match config.pca_options() {
        Some(options) => reduce(&built.into_matrix(), &options)?.basis,
        None => built.into_matrix(),
    };

    let written = write_matrix(&basis, &output)?;
    println!(
        "Wrote {}x{} basis to {} ({} bytes)",
        basis.nrows(),
        basis.ncols(),
        output.display(),
        written
    );
    self_check(&output, &basis)
}

// ========================================================================================
//                                       inspect
// ========================================================================================

fn max_orthonormal_deviation(basis: &Array2<f64>) -> f64 {
    let gram = basis.t().dot(basis);
    gram.indexed_iter()
        .map(|((i, j), &value)| {
            let target = if i == j { 1.0 } else { 0.0 };
            (value - target).abs()
        })
        .fold(0.0, f64::max)
}

fn run_inspect(path: &Path) -> CliResult {
    let matrix = read_matrix(path)?;
    let size = fs::metadata(path)?.len();
    println!("File: {}", path.display());
    println!("Rows: {}", matrix.nrows());
    println!("Cols: {}", matrix.ncols());
    println!("Size: {size} bytes");
    for (index, column) in matrix.columns().into_iter().enumerate() {
        println!("  column {index}: norm {:.6}", column.dot(&column).sqrt());
    }
    println!(
        "Max |B^T B - I|: {:.3e}",
        max_orthonormal_deviation(&matrix)
    );
    Ok(())
}

// ========================================================================================
//                                        apply
// ========================================================================================

fn deform_frame(
    deformer: &mut SubspaceDeformer,
    params: &DeformParams,
    group: Option<&[usize]>,
    frame: &Path,
    output_dir: &Path,
) -> CliResult {
    let mut points = PointSet::load(frame)?;
    let evaluation = deformer.evaluate(&mut points, params, group)?;
    let name = frame
        .file_name()
        .ok_or_else(|| format!("Frame path {} has no file name", frame.display()))?;
    let target = output_dir.join(name);
    points.save(&target)?;
    info!(
        "Deformed {} ({} mode, {} coefficients) -> {}",
        frame.display(),
        evaluation.mode,
        evaluation.coefficients.len(),
        target.display()
    );
    Ok(())
}

fn run_apply(args: ApplyArgs) -> CliResult {
    let frames = resolve_geometry_paths(&args.frames)?;
    fs::create_dir_all(&args.output_dir)?;

    let params = DeformParams::new(args.basis, args.mode, args.strength);
    let mut deformer = SubspaceDeformer::new();
    let mut failed = 0usize;
    for frame in &frames {
        if let Err(e) = deform_frame(
            &mut deformer,
            &params,
            args.group.as_deref(),
            frame,
            &args.output_dir,
        ) {
            error!("Skipping frame {}: {e}", frame.display());
            failed += 1;
        }
    }

    println!(
        "Deformed {} of {} frames into {}",
        frames.len() - failed,
        frames.len(),
        args.output_dir.display()
    );
    if failed > 0 {
        return Err(format!("{failed} of {} frames failed", frames.len()).into());
    }
    Ok(())
}

// Help and version requests exit cleanly; every other parse failure is fatal.
fn parse_exit_code(err: &clap::Error) -> i32 {
    if err.use_stderr() { 1 } else { 0 }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            process::exit(parse_exit_code(&e));
        }
    };
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Build(args)) => run_build(args),
        Some(Commands::Inspect { file }) => run_inspect(&file),
        Some(Commands::Apply(args)) => run_apply(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn args(argv: &[&str]) -> BuildArgs {
        let mut full = vec!["subdeform", "build"];
        full.extend_from_slice(argv);
        match Cli::parse_from(full).command {
            Some(Commands::Build(args)) => args,
            _ => panic!("expected build command"),
        }
    }

    #[test]
    fn malformed_flags_exit_with_failure_but_help_does_not() {
        let err = Cli::try_parse_from(["subdeform", "build", "--variance", "abc"])
            .err()
            .expect("variance must be numeric");
        assert_eq!(parse_exit_code(&err), 1);

        let err = Cli::try_parse_from(["subdeform", "--help"])
            .err()
            .expect("help short-circuits parsing");
        assert_eq!(parse_exit_code(&err), 0);
    }

    #[test]
    fn command_line_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.toml");
        BuildConfig {
            rest: Some(PathBuf::from("rest.json")),
            shapes: vec![PathBuf::from("a.json")],
            output: Some(PathBuf::from("from_config.matrix")),
            variance: Some(0.5),
            ..BuildConfig::default()
        }
        .save(&path)
        .unwrap();

        let config = resolve_build_config(args(&[
            "--config",
            path.to_str().unwrap(),
            "--output",
            "cli.matrix",
            "--no-orthonormalize",
        ]))
        .unwrap();
        assert_eq!(config.output, Some(PathBuf::from("cli.matrix")));
        assert_eq!(config.variance, Some(0.5));
        assert!(!config.orthonormalize);
        assert_eq!(config.shapes, vec![PathBuf::from("a.json")]);
    }

    #[test]
    fn mismatched_skins_fail_validation() {
        let result = resolve_build_config(args(&[
            "--rest", "r.json", "--shape", "a.json", "b.json", "--skin", "s.json", "--output",
            "o.matrix",
        ]));
        assert!(matches!(
            result,
            Err(ConfigError::SkinCountMismatch {
                shapes: 2,
                skins: 1
            })
        ));
    }

    #[test]
    fn mode_and_group_parse() {
        let cli = Cli::parse_from([
            "subdeform",
            "apply",
            "--basis",
            "b.matrix",
            "--mode",
            "1",
            "--group",
            "0,4,7",
            "--output-dir",
            "out",
            "frame.json",
        ]);
        match cli.command {
            Some(Commands::Apply(args)) => {
                assert_eq!(args.mode, DeformMode::Principal);
                assert_eq!(args.group, Some(vec![0, 4, 7]));
                assert_eq!(args.strength, 1.0);
            }
            _ => panic!("expected apply command"),
        }
    }

    #[test]
    fn orthonormal_deviation_is_zero_for_identity_columns() {
        let basis = array![[1.0, 0.0], [0.0, 1.0], [0.0, 0.0]];
        assert_eq!(max_orthonormal_deviation(&basis), 0.0);
        let scaled = array![[2.0], [0.0]];
        assert_eq!(max_orthonormal_deviation(&scaled), 3.0);
    }
}
