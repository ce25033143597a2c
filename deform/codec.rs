//! Binary matrix files.
//!
//! Layout: two little-endian `i32` values (rows, cols) followed by `rows * cols`
//! little-endian `f64` values in column-major order. Column-major order is part
//! of the format: a row-major reader would silently load the transpose.

use log::debug;
use ndarray::{Array2, ShapeBuilder};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Size in bytes of the `(rows, cols)` header.
pub const HEADER_LEN: u64 = 8;

const VALUE_LEN: u64 = std::mem::size_of::<f64>() as u64;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("can't create matrix file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("can't open matrix file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error while encoding or decoding a matrix: {0}")]
    Io(#[from] io::Error),
    #[error("matrix dimensions {rows}x{cols} do not fit the 32-bit header")]
    DimensionOverflow { rows: usize, cols: usize },
    #[error("matrix header declares negative dimensions {rows}x{cols}")]
    NegativeDimensions { rows: i32, cols: i32 },
    #[error("decoded payload does not fit the header shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("matrix payload truncated: header declares {expected} values, found {found}")]
    Truncated { expected: usize, found: usize },
}

/// Dimensions stored in a matrix file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatrixHeader {
    pub rows: usize,
    pub cols: usize,
}

impl MatrixHeader {
    /// Total file size implied by the header.
    pub fn encoded_len(&self) -> u64 {
        HEADER_LEN + (self.rows as u64) * (self.cols as u64) * VALUE_LEN
    }
}

fn checked_header(matrix: &Array2<f64>) -> Result<(i32, i32), CodecError> {
    let (rows, cols) = matrix.dim();
    match (i32::try_from(rows), i32::try_from(cols)) {
        (Ok(r), Ok(c)) => Ok((r, c)),
        _ => Err(CodecError::DimensionOverflow { rows, cols }),
    }
}

/// Encodes `matrix` into `writer`, returning the number of bytes written.
pub fn encode_matrix<W: Write>(matrix: &Array2<f64>, writer: &mut W) -> Result<u64, CodecError> {
    let (rows, cols) = checked_header(matrix)?;
    writer.write_all(&rows.to_le_bytes())?;
    writer.write_all(&cols.to_le_bytes())?;
    for column in matrix.columns() {
        for value in column.iter() {
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    Ok(HEADER_LEN + matrix.len() as u64 * VALUE_LEN)
}

fn decode_header<R: Read>(reader: &mut R) -> Result<MatrixHeader, CodecError> {
    let mut word = [0u8; 4];
    reader.read_exact(&mut word)?;
    let rows = i32::from_le_bytes(word);
    reader.read_exact(&mut word)?;
    let cols = i32::from_le_bytes(word);
    if rows < 0 || cols < 0 {
        return Err(CodecError::NegativeDimensions { rows, cols });
    }
    Ok(MatrixHeader {
        rows: rows as usize,
        cols: cols as usize,
    })
}

/// Decodes a matrix from `reader`. Bytes after the declared payload are left unread.
pub fn decode_matrix<R: Read>(reader: &mut R) -> Result<Array2<f64>, CodecError> {
    let header = decode_header(reader)?;
    let expected = header.rows * header.cols;
    let mut values = Vec::with_capacity(expected);
    let mut word = [0u8; 8];
    while values.len() < expected {
        match reader.read_exact(&mut word) {
            Ok(()) => values.push(f64::from_le_bytes(word)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(CodecError::Truncated {
                    expected,
                    found: values.len(),
                });
            }
            Err(err) => return Err(CodecError::Io(err)),
        }
    }
    Ok(Array2::from_shape_vec((header.rows, header.cols).f(), values)?)
}

/// Writes `matrix` to `path`. A file left behind by a failed write is removed.
pub fn write_matrix<P: AsRef<Path>>(matrix: &Array2<f64>, path: P) -> Result<u64, CodecError> {
    let path = path.as_ref();
    checked_header(matrix)?;
    let file = File::create(path).map_err(|source| CodecError::Create {
        path: path.to_path_buf(),
        source,
    })?;

    let mut writer = BufWriter::new(file);
    let result = encode_matrix(matrix, &mut writer).and_then(|written| {
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(written)
    });
    drop(writer);

    match result {
        Ok(written) => {
            debug!(
                "Wrote {}x{} matrix ({written} bytes) to {}",
                matrix.nrows(),
                matrix.ncols(),
                path.display()
            );
            Ok(written)
        }
        Err(err) => {
            let _ = fs::remove_file(path);
            Err(err)
        }
    }
}

/// Reads a matrix previously written by [`write_matrix`].
pub fn read_matrix<P: AsRef<Path>>(path: P) -> Result<Array2<f64>, CodecError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| CodecError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let matrix = decode_matrix(&mut BufReader::new(file))?;
    debug!(
        "Read {}x{} matrix from {}",
        matrix.nrows(),
        matrix.ncols(),
        path.display()
    );
    Ok(matrix)
}

/// Reads only the header of a matrix file.
pub fn read_header<P: AsRef<Path>>(path: P) -> Result<MatrixHeader, CodecError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| CodecError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    decode_header(&mut BufReader::new(file))
}
