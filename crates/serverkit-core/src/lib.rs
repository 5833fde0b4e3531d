//! Tiled execution and incremental result merging.
//!
//! This crate is pure computation with no I/O or threads. Algorithms
//! produce [`PartialResult`]s; a [`MergeSession`] folds them into named
//! [`Layer`]s held by a [`ResultStore`], stitching tiled outputs back
//! into one full-size layer as they arrive.
//!
//! ```text
//! Raster ──tiles()──► (chunk, TileMetadata)* ──algorithm──► PartialResult*
//!                                                               │
//!                           ResultStore ◄──MergeSession::apply──┘
//!                               │
//!                         LayerObserver (display, export)
//! ```

pub mod error;
pub mod merge;
pub mod progress;
pub mod raster;
pub mod store;
pub mod tile;
pub mod types;

pub use error::{ConfigError, DataError, MergeError, StoreError};
pub use merge::{MAX_EXACT_LABEL, MergeSession, RunState, TileMerge, strategy_for};
pub use progress::{NoProgress, ProgressReporter, RecordingStatus, StatusSink};
pub use raster::{PasteMode, Raster};
pub use store::{LayerEvent, LayerObserver, ObserverId, ResultStore};
pub use tile::{TileMetadata, TilePosition, Tiles, TilingConfig, tiles, tiles_with_rng};
pub use types::{
    DEFAULT_LAYER_NAME, KindCategory, Layer, LayerData, LayerKind, PartialResult, ResultParams,
    Severity, Table, UnknownKind,
};
