//! Error type for catalog / table loading and output emission.
//!
//! Recoverable sampling outcomes (cell outside the grid, empty cell,
//! repeated particle id) are not errors; the sampling loop skips and
//! counts them.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuadcovError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed table {}: {reason}", path.display())]
    Table { path: PathBuf, reason: String },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, QuadcovError>;
