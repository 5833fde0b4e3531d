//! Errors of the `serverkit` binary.

use std::path::PathBuf;

use serverkit_core::{ConfigError, DataError};
use serverkit_runtime::WorkbenchError;

/// Anything that stops a command.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// No built-in algorithm by that name.
    #[error("unknown algorithm {0:?}; see `serverkit list`")]
    UnknownAlgorithm(String),

    /// `--param` not of the form `key=value`.
    #[error("invalid --param {0:?}: expected key=value")]
    InvalidParam(String),

    /// The input image could not be read or an export could not be encoded.
    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// `--tiling-json` or a JSON export failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid tiling flags.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A layer could not be turned into an image.
    #[error(transparent)]
    Data(#[from] DataError),

    /// Setting up or starting the run failed.
    #[error(transparent)]
    Workbench(#[from] WorkbenchError),

    /// Writing an export failed.
    #[error("cannot write {}: {source}", path.display())]
    Write {
        /// Target file or directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}
