//! Incremental merge of partial results into the result store.
//!
//! A [`MergeSession`] lives for one run. Each batch an algorithm step
//! yields is routed by kind:
//!
//! - layer kinds go to the [`ResultStore`], through a per-kind
//!   [`TileMerge`] strategy when the result carries tile metadata;
//! - notifications go to [`StatusSink::notify`];
//! - scalar and text values replace the status overlay.
//!
//! Recoverable merge errors skip the offending result and the run goes
//! on. Fatal ones move the session to [`RunState::Failed`] and are
//! returned to the caller.

use std::collections::HashSet;

use crate::error::MergeError;
use crate::progress::{ProgressReporter, StatusSink};
use crate::raster::{PasteMode, Raster};
use crate::store::ResultStore;
use crate::tile::TileMetadata;
use crate::types::{
    KindCategory, LayerData, LayerKind, PartialResult, ResultParams, Severity, Table,
};

/// Largest instance label an `f32` raster holds exactly (2^24).
///
/// Tiled instance masks offset each tile's labels past the current
/// maximum; a tile that would push labels beyond this is skipped.
pub const MAX_EXACT_LABEL: f32 = 16_777_216.0;

/// Lifecycle of a merge session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// No result seen yet.
    #[default]
    Idle,
    /// At least one result merged, more may follow.
    Accumulating,
    /// The last tile arrived, or the task finished normally.
    Complete,
    /// The run was cancelled.
    Cancelled,
    /// A fatal merge error stopped the run.
    Failed,
}

impl RunState {
    /// Whether the session accepts no further results.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }
}

/// Per-kind stitching rule for tiled results.
pub trait TileMerge: Sync {
    /// Build the empty full-size container for the first tile.
    ///
    /// # Errors
    ///
    /// Returns a [`MergeError`] if the tile or data cannot be merged by
    /// this strategy at all.
    fn allocate(&self, tile: &TileMetadata, first: &LayerData) -> Result<LayerData, MergeError>;

    /// Fold one tile's data into the container.
    ///
    /// # Errors
    ///
    /// Returns a [`MergeError`]; the container is unchanged on error.
    fn merge(
        &self,
        container: &mut LayerData,
        incoming: LayerData,
        tile: &TileMetadata,
    ) -> Result<(), MergeError>;
}

/// Dense rasters: paste each chunk at its tile origin.
#[derive(Debug, Clone, Copy)]
struct RasterMerge {
    kind: LayerKind,
}

impl TileMerge for RasterMerge {
    fn allocate(&self, tile: &TileMetadata, first: &LayerData) -> Result<LayerData, MergeError> {
        if !matches!(first, LayerData::Raster(_)) {
            return Err(MergeError::DataMismatch {
                kind: self.kind,
                data: first.describe(),
            });
        }
        if tile.extent.len() != tile.ndim() {
            return Err(MergeError::DimensionMismatch {
                kind: self.kind,
                expected: tile.ndim(),
                actual: tile.extent.len(),
            });
        }
        let container = Raster::zeros(&tile.extent).map_err(|_| MergeError::DimensionMismatch {
            kind: self.kind,
            expected: tile.ndim(),
            actual: tile.extent.len(),
        })?;
        Ok(LayerData::Raster(container))
    }

    fn merge(
        &self,
        container: &mut LayerData,
        incoming: LayerData,
        tile: &TileMetadata,
    ) -> Result<(), MergeError> {
        let LayerData::Raster(container) = container else {
            return Err(MergeError::DataMismatch {
                kind: self.kind,
                data: container.describe(),
            });
        };
        let LayerData::Raster(mut chunk) = incoming else {
            return Err(MergeError::DataMismatch {
                kind: self.kind,
                data: incoming.describe(),
            });
        };
        if chunk.rank() != tile.ndim() {
            return Err(MergeError::DimensionMismatch {
                kind: self.kind,
                expected: tile.ndim(),
                actual: chunk.rank(),
            });
        }

        let mode = if self.kind == LayerKind::InstanceMask {
            let offset = container.max_value();
            let top = f64::from(offset) + f64::from(chunk.max_value());
            if top > f64::from(MAX_EXACT_LABEL) {
                return Err(MergeError::LabelOverflow {
                    label: top,
                    limit: f64::from(MAX_EXACT_LABEL),
                });
            }
            chunk.map_in_place(|label| if label == 0.0 { 0.0 } else { label + offset });
            PasteMode::SkipZeros
        } else {
            PasteMode::Overwrite
        };
        container.paste(&tile.origin(), &chunk, mode)
    }
}

/// Which rows of a feature get the tile origin added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Translate {
    /// Every row is a position.
    All,
    /// Only the first row is a position; the rest are relative.
    First,
}

/// When a stored feature counts as owned by the incoming tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    /// Its first row lies inside the tile box.
    FirstRow,
    /// All of its rows lie inside the tile box.
    AllRows,
}

/// Row grouping and column layout of a table-backed kind.
#[derive(Debug, Clone, Copy)]
struct FeatureLayout {
    rows_per_feature: usize,
    spatial_offset: usize,
    translate: Translate,
    ownership: Ownership,
}

/// Point-like tables: replace what the tile owns, append the rest.
#[derive(Debug, Clone, Copy)]
struct FeatureMerge {
    kind: LayerKind,
    layout: FeatureLayout,
}

impl FeatureMerge {
    fn check_tile(&self, tile: &TileMetadata) -> Result<(), MergeError> {
        if self.kind == LayerKind::Boxes && tile.is_3d {
            return Err(MergeError::UnsupportedKindTiling {
                kind: self.kind,
                reason: "boxes cannot be tiled in 3-D",
                fatal: true,
            });
        }
        Ok(())
    }

    fn check_width(&self, table: &Table, tile: &TileMetadata) -> Result<(), MergeError> {
        let spatial = table.width().saturating_sub(self.layout.spatial_offset);
        if table.width() != self.layout.spatial_offset + tile.ndim() {
            return Err(MergeError::DimensionMismatch {
                kind: self.kind,
                expected: tile.ndim(),
                actual: spatial,
            });
        }
        Ok(())
    }

    fn table(&self, data: LayerData) -> Result<Table, MergeError> {
        match (self.kind, data) {
            (LayerKind::Points, LayerData::Points(table))
            | (LayerKind::Vectors, LayerData::Vectors(table))
            | (LayerKind::Boxes, LayerData::Boxes(table))
            | (LayerKind::Tracks, LayerData::Tracks(table)) => Ok(table),
            (kind, other) => Err(MergeError::DataMismatch {
                kind,
                data: other.describe(),
            }),
        }
    }

    fn table_mut<'a>(&self, data: &'a mut LayerData) -> Result<&'a mut Table, MergeError> {
        match (self.kind, data) {
            (LayerKind::Points, LayerData::Points(table))
            | (LayerKind::Vectors, LayerData::Vectors(table))
            | (LayerKind::Boxes, LayerData::Boxes(table))
            | (LayerKind::Tracks, LayerData::Tracks(table)) => Ok(table),
            (kind, other) => Err(MergeError::DataMismatch {
                kind,
                data: other.describe(),
            }),
        }
    }

    fn wrap(&self, table: Table) -> LayerData {
        match self.kind {
            LayerKind::Vectors => LayerData::Vectors(table),
            LayerKind::Boxes => LayerData::Boxes(table),
            LayerKind::Tracks => LayerData::Tracks(table),
            _ => LayerData::Points(table),
        }
    }

    /// Whether the tile box owns a stored feature (rows of `group`).
    fn owned(&self, group: &[f64], width: usize, tile: &TileMetadata) -> bool {
        let spatial = self.layout.spatial_offset..self.layout.spatial_offset + tile.ndim();
        let mut rows = group.chunks_exact(width);
        match self.layout.ownership {
            Ownership::FirstRow => rows
                .next()
                .is_some_and(|row| tile.contains(&row[spatial])),
            Ownership::AllRows => rows.all(|row| tile.contains(&row[spatial.clone()])),
        }
    }
}

impl TileMerge for FeatureMerge {
    fn allocate(&self, tile: &TileMetadata, first: &LayerData) -> Result<LayerData, MergeError> {
        self.check_tile(tile)?;
        let width = match first {
            LayerData::Points(table)
            | LayerData::Vectors(table)
            | LayerData::Boxes(table)
            | LayerData::Tracks(table)
                if self.kind.accepts(first) =>
            {
                table.width()
            }
            other => {
                return Err(MergeError::DataMismatch {
                    kind: self.kind,
                    data: other.describe(),
                });
            }
        };
        Ok(self.wrap(Table::new(width)))
    }

    #[allow(clippy::cast_precision_loss)]
    fn merge(
        &self,
        container: &mut LayerData,
        incoming: LayerData,
        tile: &TileMetadata,
    ) -> Result<(), MergeError> {
        self.check_tile(tile)?;
        let mut incoming = self.table(incoming)?;
        let container = self.table_mut(container)?;
        self.check_width(&incoming, tile)?;
        if incoming.len() % self.layout.rows_per_feature != 0 {
            return Err(MergeError::IncompleteFeature {
                kind: self.kind,
                rows: incoming.len(),
                rows_per_feature: self.layout.rows_per_feature,
            });
        }
        if !container.is_empty() {
            self.check_width(container, tile)?;
        }

        let origin: Vec<f64> = tile.origin().iter().map(|&o| o as f64).collect();
        let offset = self.layout.spatial_offset;
        for index in 0..incoming.len() {
            let translate = match self.layout.translate {
                Translate::All => true,
                Translate::First => index % self.layout.rows_per_feature == 0,
            };
            if !translate {
                continue;
            }
            if let Some(row) = incoming.row_mut(index) {
                for (value, o) in row[offset..].iter_mut().zip(&origin) {
                    *value += o;
                }
            }
        }

        let width = incoming.width();
        container.retain_groups(self.layout.rows_per_feature, |group| {
            !self.owned(group, width, tile)
        });
        if container.is_empty() && container.width() != width {
            *container = Table::new(width);
        }
        container
            .extend_from(&incoming)
            .map_err(|_| MergeError::DimensionMismatch {
                kind: self.kind,
                expected: tile.ndim(),
                actual: width.saturating_sub(offset),
            })
    }
}

static RASTER: RasterMerge = RasterMerge {
    kind: LayerKind::Raster,
};
static MASK: RasterMerge = RasterMerge {
    kind: LayerKind::Mask,
};
static INSTANCE_MASK: RasterMerge = RasterMerge {
    kind: LayerKind::InstanceMask,
};
static POINTS: FeatureMerge = FeatureMerge {
    kind: LayerKind::Points,
    layout: FeatureLayout {
        rows_per_feature: 1,
        spatial_offset: 0,
        translate: Translate::All,
        ownership: Ownership::FirstRow,
    },
};
static VECTORS: FeatureMerge = FeatureMerge {
    kind: LayerKind::Vectors,
    layout: FeatureLayout {
        rows_per_feature: 2,
        spatial_offset: 0,
        translate: Translate::First,
        ownership: Ownership::FirstRow,
    },
};
static BOXES: FeatureMerge = FeatureMerge {
    kind: LayerKind::Boxes,
    layout: FeatureLayout {
        rows_per_feature: 4,
        spatial_offset: 0,
        translate: Translate::All,
        ownership: Ownership::AllRows,
    },
};
static TRACKS: FeatureMerge = FeatureMerge {
    kind: LayerKind::Tracks,
    layout: FeatureLayout {
        rows_per_feature: 1,
        spatial_offset: 2,
        translate: Translate::All,
        ownership: Ownership::FirstRow,
    },
};

/// Tiled-merge strategy for `kind`.
///
/// # Errors
///
/// Returns a recoverable [`MergeError::UnsupportedKindTiling`] for kinds
/// with no stitching rule.
pub fn strategy_for(kind: LayerKind) -> Result<&'static dyn TileMerge, MergeError> {
    match kind {
        LayerKind::Raster => Ok(&RASTER),
        LayerKind::Mask => Ok(&MASK),
        LayerKind::InstanceMask => Ok(&INSTANCE_MASK),
        LayerKind::Points => Ok(&POINTS),
        LayerKind::Vectors => Ok(&VECTORS),
        LayerKind::Boxes => Ok(&BOXES),
        LayerKind::Tracks => Ok(&TRACKS),
        LayerKind::Paths
        | LayerKind::Scalar
        | LayerKind::Text
        | LayerKind::Notification => Err(MergeError::UnsupportedKindTiling {
            kind,
            reason: "no tiled merge strategy",
            fatal: false,
        }),
    }
}

/// Merge state for one run.
#[derive(Debug, Default)]
pub struct MergeSession {
    state: RunState,
    steps: usize,
    skipped: usize,
    noticed: HashSet<LayerKind>,
}

impl MergeSession {
    /// Fresh session in [`RunState::Idle`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Number of results skipped because of recoverable errors.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }

    /// Merge a single result. Equivalent to a one-element batch.
    ///
    /// # Errors
    ///
    /// See [`MergeSession::apply_batch`].
    pub fn apply(
        &mut self,
        store: &mut ResultStore,
        status: &mut dyn StatusSink,
        progress: &dyn ProgressReporter,
        result: PartialResult,
    ) -> Result<(), MergeError> {
        self.apply_batch(store, status, progress, vec![result])
    }

    /// Merge everything one algorithm step yielded, in order.
    ///
    /// The overlay is hidden first. Progress is reported once per batch:
    /// `(tile_idx, n_tiles)` for tiled batches, `(steps, 0)` otherwise.
    /// The batch holding the last tile completes the session.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`MergeError`]; the session is then
    /// [`RunState::Failed`]. Batches arriving after a terminal state are
    /// ignored.
    pub fn apply_batch(
        &mut self,
        store: &mut ResultStore,
        status: &mut dyn StatusSink,
        progress: &dyn ProgressReporter,
        batch: Vec<PartialResult>,
    ) -> Result<(), MergeError> {
        if self.state.is_terminal() {
            tracing::debug!(state = ?self.state, results = batch.len(), "ignoring results after run ended");
            return Ok(());
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.state = RunState::Accumulating;
        status.hide_overlay();

        let mut last_tile = None;
        for result in batch {
            if let Some(tile) = &result.params.tile_params {
                last_tile = Some((tile.tile_idx, tile.n_tiles));
            }
            if let Err(err) = self.route(store, status, result) {
                if err.is_recoverable() {
                    self.skip(status, &err);
                } else {
                    tracing::error!(error = %err, "merge failed");
                    self.state = RunState::Failed;
                    return Err(err);
                }
            }
        }

        if let Some((tile_idx, n_tiles)) = last_tile {
            progress.on_progress(tile_idx, n_tiles);
            if tile_idx + 1 >= n_tiles {
                progress.on_progress(n_tiles, n_tiles);
                self.state = RunState::Complete;
                tracing::debug!(n_tiles, "last tile merged");
            }
        } else {
            self.steps += 1;
            progress.on_progress(self.steps, 0);
        }
        Ok(())
    }

    /// Mark the run as finished normally, unless it already ended.
    pub fn complete(&mut self) {
        if !self.state.is_terminal() {
            self.state = RunState::Complete;
        }
    }

    /// Mark the run as cancelled, unless it already ended.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = RunState::Cancelled;
        }
    }

    /// Mark the run as failed, unless it already ended.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = RunState::Failed;
        }
    }

    fn route(
        &self,
        store: &mut ResultStore,
        status: &mut dyn StatusSink,
        result: PartialResult,
    ) -> Result<(), MergeError> {
        match result.kind.category() {
            KindCategory::Notification => {
                status.notify(result.params.severity(), &result.data.display_string());
                Ok(())
            }
            KindCategory::Value => {
                status.show_overlay(&result.data.display_string());
                Ok(())
            }
            KindCategory::Layer => merge_layer(store, result),
        }
    }

    fn skip(&mut self, status: &mut dyn StatusSink, err: &MergeError) {
        self.skipped += 1;
        if let MergeError::UnsupportedKindTiling { kind, .. } = err {
            if self.noticed.insert(*kind) {
                tracing::warn!(kind = %kind, "tiled results of this kind are dropped");
                status.notify(Severity::Warning, &err.to_string());
            }
            return;
        }
        tracing::warn!(error = %err, "skipping partial result");
    }
}

fn merge_layer(store: &mut ResultStore, result: PartialResult) -> Result<(), MergeError> {
    let PartialResult { data, params, kind } = result;
    let name = params.layer_name().to_owned();
    let ResultParams {
        tile_params, meta, ..
    } = params;

    let Some(tile) = tile_params else {
        if store.contains(&name) {
            store.update(&name, data)?;
        } else {
            store.create(kind, data, name, meta)?;
        }
        return Ok(());
    };

    let strategy = strategy_for(kind)?;
    if !store.contains(&name) {
        let container = strategy.allocate(&tile, &data)?;
        store.create(kind, container, name.clone(), meta)?;
    }
    store.update_with(&name, |container| strategy.merge(container, data, &tile))?;
    tracing::trace!(name = %name, tile_idx = tile.tile_idx, n_tiles = tile.n_tiles, "tile merged");
    Ok(())
}
