//! Error types for running algorithms.

use serverkit_core::{ConfigError, DataError, LayerKind, MergeError, StoreError};

/// Failure inside an algorithm body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlgorithmError {
    /// A required argument was not bound.
    #[error("missing argument {0:?}")]
    MissingArgument(String),

    /// An argument had the wrong type for how the algorithm reads it.
    #[error("argument {name:?} is not a {expected}")]
    WrongType {
        /// Parameter name.
        name: String,
        /// What the algorithm expected.
        expected: &'static str,
    },

    /// Raster or table construction failed.
    #[error(transparent)]
    Data(#[from] DataError),

    /// Invalid tiling setup inside the algorithm.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Anything else the algorithm reports.
    #[error("{0}")]
    Failed(String),
}

/// Why a background task ended without completing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// The algorithm returned an error.
    #[error("algorithm failed: {0}")]
    Algorithm(#[from] AlgorithmError),

    /// A result could not be merged and the run had to stop.
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    /// The task body panicked.
    #[error("task panicked")]
    Panicked,

    /// No tokio runtime was available to run tasks on.
    #[error("no tokio runtime is running")]
    NoRuntime,

    /// Free-form failure.
    #[error("{0}")]
    Failed(String),
}

/// Invalid parameter bindings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    /// No value and no default.
    #[error("parameter {0:?} has no value and no default")]
    Missing(String),

    /// An override names a parameter the schema does not declare.
    #[error("unknown parameter {0:?}")]
    Unknown(String),

    /// The value has the wrong JSON type for the widget.
    #[error("parameter {name:?} expects {expected}, got {actual}")]
    WrongType {
        /// Parameter name.
        name: String,
        /// Expected value type.
        expected: &'static str,
        /// The offending value.
        actual: String,
    },

    /// The value lies outside `[minimum, maximum]`.
    #[error("parameter {name:?} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        /// Parameter name.
        name: String,
        /// Supplied value.
        value: f64,
        /// Lower bound (inclusive).
        min: f64,
        /// Upper bound (inclusive).
        max: f64,
    },

    /// The value is not one of the dropdown choices.
    #[error("parameter {name:?} = {value:?} is not one of {choices:?}")]
    InvalidChoice {
        /// Parameter name.
        name: String,
        /// Supplied value.
        value: String,
        /// Allowed values.
        choices: Vec<String>,
    },

    /// The named input layer does not exist.
    #[error("parameter {name:?}: {source}")]
    Layer {
        /// Parameter name.
        name: String,
        /// Store lookup failure.
        source: StoreError,
    },

    /// The named input layer has the wrong kind for the widget.
    #[error("parameter {name:?} needs a {widget} layer, {layer:?} is {kind}")]
    LayerKind {
        /// Parameter name.
        name: String,
        /// Widget type of the parameter.
        widget: &'static str,
        /// Name of the layer supplied.
        layer: String,
        /// Kind of that layer.
        kind: LayerKind,
    },
}

/// Problems detected while planning an invocation, before it runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunnerError {
    /// Client-side tiling cannot wrap a streaming algorithm.
    #[error("algorithm {0:?} streams its results and cannot be tiled")]
    StreamNotTileable(String),

    /// Tiling needs a raster argument to split.
    #[error("algorithm {0:?} has no image argument to tile")]
    MissingRaster(String),

    /// Bad tiling configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Top-level failure of a workbench operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkbenchError {
    /// Argument binding failed.
    #[error(transparent)]
    Param(#[from] ParamError),

    /// Planning failed.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// Task setup failed.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Store contract violation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No algorithm registered under this name.
    #[error("unknown algorithm {0:?}")]
    UnknownAlgorithm(String),
}
