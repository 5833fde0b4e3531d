//! Error taxonomy for the core crate.
//!
//! Each concern gets its own enum so callers can decide what is fatal:
//!
//! - [`ConfigError`] -- bad tiling setup, surfaced before a run starts.
//! - [`DataError`] -- a raster or table that cannot be constructed.
//! - [`StoreError`] -- [`ResultStore`](crate::store::ResultStore) contract
//!   violations. Always surfaced to the caller.
//! - [`MergeError`] -- problems folding one partial result into a layer.
//!   Most are recoverable; see [`MergeError::is_recoverable`].
//!
//! Cancellation is not an error. A cancelled run ends in
//! [`RunState::Cancelled`](crate::merge::RunState::Cancelled).

use crate::types::LayerKind;

/// Invalid tiling configuration or input.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Tile edge length must be at least one pixel.
    #[error("tile size must be at least 1 pixel, got {0}")]
    InvalidTileSize(usize),

    /// Overlap is a fraction in `[0, 1)`.
    #[error("overlap must be in [0, 1), got {0}")]
    InvalidOverlap(f64),

    /// Per-tile delay must be finite and non-negative.
    #[error("tile delay must be finite and non-negative, got {0} s")]
    InvalidDelay(f64),

    /// Only 2-D `(y, x)` and 3-D `(z, y, x)` inputs can be tiled.
    #[error("tiling requires a 2-D or 3-D input, got rank {0}")]
    UnsupportedRank(usize),
}

/// Malformed raster or table data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataError {
    /// Rasters are rank 2 or rank 3.
    #[error("raster rank must be 2 or 3, got {0}")]
    UnsupportedRank(usize),

    /// The number of values does not match the declared shape.
    #[error("shape {shape:?} needs {expected} values, got {actual}")]
    ShapeMismatch {
        /// Declared shape.
        shape: Vec<usize>,
        /// `shape.iter().product()`.
        expected: usize,
        /// Number of values supplied.
        actual: usize,
    },

    /// A table row had the wrong number of columns.
    #[error("table has {width} columns, row has {actual}")]
    RowWidth {
        /// Column count of the table.
        width: usize,
        /// Length of the offending row.
        actual: usize,
    },

    /// Only rank-2 rasters convert to and from grayscale images.
    #[error("image conversion requires a 2-D raster, got rank {0}")]
    NotAnImage(usize),
}

/// Result Store contract violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A layer with this name already exists.
    #[error("a layer named {0:?} already exists")]
    DuplicateName(String),

    /// No layer with this name exists.
    #[error("no layer named {0:?}")]
    NotFound(String),

    /// The layer kind cannot hold the supplied data.
    #[error("layer {name:?} of kind {kind} cannot hold {data} data")]
    KindMismatch {
        /// Layer name.
        name: String,
        /// Declared kind of the layer.
        kind: LayerKind,
        /// Short description of the data variant supplied.
        data: &'static str,
    },
}

/// Errors raised while folding a partial result into the store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeError {
    /// A tile chunk does not fit inside the container at its position.
    #[error(
        "tile at {origin:?} with shape {chunk:?} does not fit in container of shape {container:?}"
    )]
    OutOfBoundsWrite {
        /// Tile origin in container axis order.
        origin: Vec<usize>,
        /// Shape of the incoming chunk.
        chunk: Vec<usize>,
        /// Shape of the container.
        container: Vec<usize>,
    },

    /// Incoming coordinates do not have the dimensionality of the tile.
    #[error("{kind} data has {actual} spatial columns, tile is {expected}-D")]
    DimensionMismatch {
        /// Kind being merged.
        kind: LayerKind,
        /// Spatial dimensionality of the tile.
        expected: usize,
        /// Spatial columns found in the incoming data.
        actual: usize,
    },

    /// The incoming table ends part-way through a feature.
    #[error("{kind} data has {rows} rows, not a multiple of {rows_per_feature} rows per feature")]
    IncompleteFeature {
        /// Kind being merged.
        kind: LayerKind,
        /// Rows in the incoming table.
        rows: usize,
        /// Rows making up one feature of this kind.
        rows_per_feature: usize,
    },

    /// Offsetting a tile's instance labels would exceed the range `f32`
    /// stores exactly.
    #[error("instance label {label} exceeds the exact label limit {limit}")]
    LabelOverflow {
        /// Largest label the offset tile would contain.
        label: f64,
        /// Largest exactly representable label.
        limit: f64,
    },

    /// The incoming data variant does not match the container.
    #[error("cannot merge {data} data into a {kind} layer")]
    DataMismatch {
        /// Kind of the container layer.
        kind: LayerKind,
        /// Short description of the incoming data variant.
        data: &'static str,
    },

    /// No tiled merge is defined for this kind (or this dimensionality).
    #[error("tiled merge is not supported for {kind}: {reason}")]
    UnsupportedKindTiling {
        /// Kind that was tiled.
        kind: LayerKind,
        /// What is unsupported.
        reason: &'static str,
        /// Whether the run must stop.
        fatal: bool,
    },

    /// Store contract violation while creating or updating the layer.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MergeError {
    /// Whether the run may continue after this error.
    ///
    /// Geometric problems with a single tile are skipped so later tiles
    /// still land. Store violations and fatal tiling errors are not.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::OutOfBoundsWrite { .. }
            | Self::DimensionMismatch { .. }
            | Self::IncompleteFeature { .. }
            | Self::LabelOverflow { .. }
            | Self::DataMismatch { .. } => true,
            Self::UnsupportedKindTiling { fatal, .. } => !*fatal,
            Self::Store(_) => false,
        }
    }
}
