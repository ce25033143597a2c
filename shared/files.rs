use log::debug;
use natord::compare;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilesError {
    #[error("Unable to list {path}: {source}")]
    ListDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No geometry files found in directory {0}")]
    EmptyDir(PathBuf),
}

fn has_geometry_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn compare_paths(a: &Path, b: &Path) -> std::cmp::Ordering {
    let a_str = a
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| a.to_string_lossy().into_owned());
    let b_str = b
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| b.to_string_lossy().into_owned());
    compare(&a_str, &b_str)
}

fn gather_geometry_files(dir: &Path) -> Result<Vec<PathBuf>, FilesError> {
    let list_error = |source| FilesError::ListDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(list_error)? {
        let path = entry.map_err(list_error)?.path();
        if path.is_file() && has_geometry_extension(&path) {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(FilesError::EmptyDir(dir.to_path_buf()));
    }
    files.sort_by(|a, b| compare_paths(a, b));
    Ok(files)
}

/// Expands `path` into geometry files: a directory yields its `.json` files in
/// natural order (`frame2` before `frame10`), anything else is passed through.
///
/// Plain paths are not checked here; a missing example is reported when it is loaded.
pub fn list_geometry_paths(path: &Path) -> Result<Vec<PathBuf>, FilesError> {
    if path.is_dir() {
        let files = gather_geometry_files(path)?;
        debug!("Expanded {} into {} geometry files", path.display(), files.len());
        Ok(files)
    } else {
        Ok(vec![path.to_path_buf()])
    }
}

/// [`list_geometry_paths`] over every input, keeping the input order.
pub fn resolve_geometry_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, FilesError> {
    let mut resolved = Vec::with_capacity(inputs.len());
    for input in inputs {
        resolved.extend(list_geometry_paths(input)?);
    }
    Ok(resolved)
}
