//! Transaction table loading and writing for columnar files.

use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unsupported table format for {}; expected .parquet or .csv", path.display())]
    UnsupportedFormat { path: PathBuf },
    #[error("failed to read table from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: PolarsError,
    },
    #[error("failed to write table to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: PolarsError,
    },
}

pub fn load_transactions(
    path: &Path,
    columns: Option<&[&str]>,
) -> Result<DataFrame, LoadError> {
    info!(
        component = "loader",
        event = "loader.load.start",
        path = %path.display()
    );

    let projection: Option<Vec<String>> =
        columns.map(|names| names.iter().map(|name| (*name).to_string()).collect());

    let frame = match file_extension(path).as_deref() {
        Some("parquet") => {
            let file = File::open(path).map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            ParquetReader::new(file)
                .with_columns(projection)
                .finish()
                .map_err(|source| LoadError::Read {
                    path: path.to_path_buf(),
                    source,
                })?
        }
        Some("csv") => CsvReader::from_path(path)
            .map_err(|source| LoadError::Read {
                path: path.to_path_buf(),
                source,
            })?
            .has_header(true)
            .with_columns(projection)
            .finish()
            .map_err(|source| LoadError::Read {
                path: path.to_path_buf(),
                source,
            })?,
        _ => {
            return Err(LoadError::UnsupportedFormat {
                path: path.to_path_buf(),
            })
        }
    };

    info!(
        component = "loader",
        event = "loader.load.finish",
        path = %path.display(),
        rows = frame.height(),
        columns = frame.width()
    );

    Ok(frame)
}

pub fn write_features(path: &Path, frame: &mut DataFrame) -> Result<(), LoadError> {
    match file_extension(path).as_deref() {
        Some("parquet") => {
            let file = File::create(path).map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            ParquetWriter::new(file)
                .finish(frame)
                .map_err(|source| LoadError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        Some("csv") => {
            let mut file = File::create(path).map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            CsvWriter::new(&mut file)
                .finish(frame)
                .map_err(|source| LoadError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        _ => {
            return Err(LoadError::UnsupportedFormat {
                path: path.to_path_buf(),
            })
        }
    }

    info!(
        component = "loader",
        event = "loader.write.finish",
        path = %path.display(),
        rows = frame.height(),
        columns = frame.width()
    );

    Ok(())
}

fn file_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
}
