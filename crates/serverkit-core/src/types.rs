//! Shared types: layer kinds, payloads, layers, and partial results.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DataError;
use crate::raster::Raster;
use crate::tile::TileMetadata;

/// Name given to layer results that do not carry one.
pub const DEFAULT_LAYER_NAME: &str = "Output";

/// Semantic kind of a result.
///
/// Layer kinds (`Raster` through `Tracks`) are stored in the
/// [`ResultStore`](crate::store::ResultStore). Value kinds and
/// notifications go to the [`StatusSink`](crate::progress::StatusSink)
/// instead.
///
/// Wire names follow the algorithm protocol (`"image"` for rasters).
/// Older protocol names are accepted as aliases when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Intensity image.
    #[serde(rename = "image", alias = "raster")]
    Raster,
    /// Semantic (class) mask.
    #[serde(alias = "mask3d")]
    Mask,
    /// Instance mask: each object has its own label.
    InstanceMask,
    /// Point set.
    #[serde(alias = "points3d")]
    Points,
    /// Vector set (origin + direction per vector).
    Vectors,
    /// Axis-aligned boxes (four corners per box).
    Boxes,
    /// Open polylines.
    Paths,
    /// Track table (`track_id, t, (z,) y, x`).
    Tracks,
    /// Number, boolean, or list shown as overlay text.
    #[serde(alias = "float", alias = "int", alias = "bool", alias = "list")]
    Scalar,
    /// Free text shown as overlay text.
    #[serde(alias = "str", alias = "class", alias = "dropdown")]
    Text,
    /// User-facing notification with a severity.
    Notification,
}

/// How a [`LayerKind`] is routed by the merge engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindCategory {
    /// Stored as a named layer.
    Layer,
    /// Coerced to a display string and shown as overlay text.
    Value,
    /// Routed to the notification channel.
    Notification,
}

impl LayerKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::Raster,
        Self::Mask,
        Self::InstanceMask,
        Self::Points,
        Self::Vectors,
        Self::Boxes,
        Self::Paths,
        Self::Tracks,
        Self::Scalar,
        Self::Text,
        Self::Notification,
    ];

    /// Protocol name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raster => "image",
            Self::Mask => "mask",
            Self::InstanceMask => "instance_mask",
            Self::Points => "points",
            Self::Vectors => "vectors",
            Self::Boxes => "boxes",
            Self::Paths => "paths",
            Self::Tracks => "tracks",
            Self::Scalar => "scalar",
            Self::Text => "text",
            Self::Notification => "notification",
        }
    }

    /// Routing category of the kind.
    #[must_use]
    pub const fn category(self) -> KindCategory {
        match self {
            Self::Scalar | Self::Text => KindCategory::Value,
            Self::Notification => KindCategory::Notification,
            _ => KindCategory::Layer,
        }
    }

    /// Whether a layer of this kind can hold `data`.
    #[must_use]
    pub const fn accepts(self, data: &LayerData) -> bool {
        matches!(
            (self, data),
            (
                Self::Raster | Self::Mask | Self::InstanceMask,
                LayerData::Raster(_)
            ) | (Self::Points, LayerData::Points(_))
                | (Self::Vectors, LayerData::Vectors(_))
                | (Self::Boxes, LayerData::Boxes(_))
                | (Self::Paths, LayerData::Paths(_))
                | (Self::Tracks, LayerData::Tracks(_))
                | (
                    Self::Scalar | Self::Text | Self::Notification,
                    LayerData::Value(_)
                )
        )
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized kind name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown layer kind {0:?}")]
pub struct UnknownKind(pub String);

impl FromStr for LayerKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" | "raster" => Ok(Self::Raster),
            "mask" | "mask3d" => Ok(Self::Mask),
            "instance_mask" => Ok(Self::InstanceMask),
            "points" | "points3d" => Ok(Self::Points),
            "vectors" => Ok(Self::Vectors),
            "boxes" => Ok(Self::Boxes),
            "paths" => Ok(Self::Paths),
            "tracks" => Ok(Self::Tracks),
            "scalar" | "float" | "int" | "bool" | "list" => Ok(Self::Scalar),
            "text" | "str" | "class" | "dropdown" => Ok(Self::Text),
            "notification" => Ok(Self::Notification),
            other => Err(UnknownKind(other.to_owned())),
        }
    }
}

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational message.
    #[default]
    Info,
    /// Something looks wrong but the run continues.
    Warning,
    /// Something failed.
    Error,
}

impl Severity {
    /// Parse a protocol `level` string. Unknown levels are `Info`.
    #[must_use]
    pub fn from_level(level: &str) -> Self {
        match level {
            "error" => Self::Error,
            "warning" => Self::Warning,
            _ => Self::Info,
        }
    }
}

/// Row-major `f64` matrix with a fixed column count.
///
/// Geometric layers are tables: one row per point, vector endpoint, or
/// box corner. Spatial columns use `(z,) y, x` order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "TableRepr", into = "TableRepr")]
pub struct Table {
    width: usize,
    values: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct TableRepr {
    width: usize,
    values: Vec<f64>,
}

impl TryFrom<TableRepr> for Table {
    type Error = DataError;

    fn try_from(repr: TableRepr) -> Result<Self, Self::Error> {
        Self::from_flat(repr.width, repr.values)
    }
}

impl From<Table> for TableRepr {
    fn from(table: Table) -> Self {
        Self {
            width: table.width,
            values: table.values,
        }
    }
}

impl Table {
    /// Empty table with `width` columns.
    #[must_use]
    pub const fn new(width: usize) -> Self {
        Self {
            width,
            values: Vec::new(),
        }
    }

    /// Build a table from row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::RowWidth`] if `values.len()` is not a
    /// multiple of `width` (or `width` is zero with values present).
    pub fn from_flat(width: usize, values: Vec<f64>) -> Result<Self, DataError> {
        let ragged = if width == 0 {
            !values.is_empty()
        } else {
            values.len() % width != 0
        };
        if ragged {
            return Err(DataError::RowWidth {
                width,
                actual: values.len(),
            });
        }
        Ok(Self { width, values })
    }

    /// Build a table from rows of equal length.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::RowWidth`] on the first row whose length
    /// differs from `width`.
    pub fn from_rows<R>(width: usize, rows: impl IntoIterator<Item = R>) -> Result<Self, DataError>
    where
        R: AsRef<[f64]>,
    {
        let mut table = Self::new(width);
        for row in rows {
            table.push_row(row.as_ref())?;
        }
        Ok(table)
    }

    /// Number of columns.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Number of rows.
    #[must_use]
    pub const fn len(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.values.len() / self.width
        }
    }

    /// Returns `true` if the table has no rows.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Row `index`, if present.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        let start = index.checked_mul(self.width)?;
        self.values.get(start..start + self.width)
    }

    /// Iterate over rows.
    pub fn rows(&self) -> impl ExactSizeIterator<Item = &[f64]> {
        self.values.chunks_exact(self.width.max(1))
    }

    /// Row-major values.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::RowWidth`] if `row.len() != self.width()`.
    pub fn push_row(&mut self, row: &[f64]) -> Result<(), DataError> {
        if row.len() != self.width {
            return Err(DataError::RowWidth {
                width: self.width,
                actual: row.len(),
            });
        }
        self.values.extend_from_slice(row);
        Ok(())
    }

    /// Keep only groups of `rows_per_group` consecutive rows for which
    /// `keep` returns `true`.
    ///
    /// A trailing partial group is dropped.
    pub fn retain_groups(&mut self, rows_per_group: usize, mut keep: impl FnMut(&[f64]) -> bool) {
        let stride = self.width * rows_per_group.max(1);
        if stride == 0 {
            return;
        }
        let mut kept = Vec::with_capacity(self.values.len());
        for group in self.values.chunks_exact(stride) {
            if keep(group) {
                kept.extend_from_slice(group);
            }
        }
        self.values = kept;
    }

    /// Append all rows of `other`.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::RowWidth`] if the column counts differ.
    pub fn extend_from(&mut self, other: &Self) -> Result<(), DataError> {
        if other.is_empty() {
            return Ok(());
        }
        if other.width != self.width {
            return Err(DataError::RowWidth {
                width: self.width,
                actual: other.width,
            });
        }
        self.values.extend_from_slice(&other.values);
        Ok(())
    }

    /// Mutable access to the values of row `index`.
    pub(crate) fn row_mut(&mut self, index: usize) -> Option<&mut [f64]> {
        let start = index.checked_mul(self.width)?;
        self.values.get_mut(start..start + self.width)
    }
}

/// Kind-typed layer payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LayerData {
    /// Dense array for image and mask kinds.
    Raster(Raster),
    /// One row per point.
    Points(Table),
    /// Two rows per vector: origin, then direction.
    Vectors(Table),
    /// Four rows per box, one per corner.
    Boxes(Table),
    /// One table per path.
    Paths(Vec<Table>),
    /// Rows of `track_id, t, (z,) y, x`.
    Tracks(Table),
    /// Scalar, text, or notification payload.
    Value(Value),
}

impl LayerData {
    /// Short name of the variant, for error messages.
    #[must_use]
    pub const fn describe(&self) -> &'static str {
        match self {
            Self::Raster(_) => "raster",
            Self::Points(_) => "points",
            Self::Vectors(_) => "vectors",
            Self::Boxes(_) => "boxes",
            Self::Paths(_) => "paths",
            Self::Tracks(_) => "tracks",
            Self::Value(_) => "value",
        }
    }

    /// The raster payload, if any.
    #[must_use]
    pub const fn as_raster(&self) -> Option<&Raster> {
        match self {
            Self::Raster(raster) => Some(raster),
            _ => None,
        }
    }

    /// Text shown for value payloads: strings verbatim, everything else
    /// in its JSON form.
    #[must_use]
    pub fn display_string(&self) -> String {
        match self {
            Self::Value(Value::String(text)) => text.clone(),
            Self::Value(value) => value.to_string(),
            other => other.describe().to_owned(),
        }
    }
}

/// A named, typed result held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Unique key within the store.
    pub name: String,
    /// Semantic kind.
    pub kind: LayerKind,
    /// Payload; always accepted by `kind`.
    pub data: LayerData,
    /// Display and construction properties.
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// Parameters attached to a partial result.
///
/// `tile_params` is the only signal that tiled merging applies.
/// Everything other than `name` and `tile_params` is layer metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultParams {
    /// Target layer name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tile this result was computed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_params: Option<TileMetadata>,
    /// Remaining properties (`level` for notifications, display hints).
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

impl ResultParams {
    /// Target layer name, falling back to [`DEFAULT_LAYER_NAME`].
    #[must_use]
    pub fn layer_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_LAYER_NAME)
    }

    /// Notification severity from the `level` property.
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.meta
            .get("level")
            .and_then(Value::as_str)
            .map_or(Severity::Info, Severity::from_level)
    }
}

/// One `(data, params, kind)` triple produced by an algorithm step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    /// Payload.
    pub data: LayerData,
    /// Name, tile metadata, and layer properties.
    pub params: ResultParams,
    /// Semantic kind.
    pub kind: LayerKind,
}

impl PartialResult {
    /// A layer result targeting `name`.
    #[must_use]
    pub fn layer(kind: LayerKind, name: impl Into<String>, data: LayerData) -> Self {
        Self {
            data,
            params: ResultParams {
                name: Some(name.into()),
                ..ResultParams::default()
            },
            kind,
        }
    }

    /// A notification with the given severity.
    #[must_use]
    pub fn notification(severity: Severity, message: impl Into<String>) -> Self {
        let level = match severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        let mut meta = Map::new();
        meta.insert("level".to_owned(), Value::from(level));
        Self {
            data: LayerData::Value(Value::String(message.into())),
            params: ResultParams {
                meta,
                ..ResultParams::default()
            },
            kind: LayerKind::Notification,
        }
    }

    /// A scalar or text value for the status overlay.
    #[must_use]
    pub fn value(kind: LayerKind, value: impl Into<Value>) -> Self {
        Self {
            data: LayerData::Value(value.into()),
            params: ResultParams::default(),
            kind,
        }
    }

    /// Attach tile metadata.
    #[must_use]
    pub fn with_tile(mut self, tile: TileMetadata) -> Self {
        self.params.tile_params = Some(tile);
        self
    }

    /// Attach a metadata property.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.meta.insert(key.into(), value.into());
        self
    }
}
