//! Tile generation: split a raster into overlapping spatial chunks.
//!
//! [`tiles`] returns a lazy [`Tiles`] iterator of `(chunk, TileMetadata)`
//! pairs covering the whole input. Chunks are extracted one at a time as
//! the iterator is pulled, so a per-tile delay throttles only the thread
//! doing the pulling.
//!
//! # Layout
//!
//! Per axis, tile origins are `0, s, 2s, ...` with stride
//! `s = max(1, round(T * (1 - overlap)))`, stopping once a tile reaches
//! the end of the axis. The last tile on each axis is truncated to the
//! input boundary, never padded. An axis no longer than `T` gets exactly
//! one tile. Tiles are enumerated row-major (outer axis slowest).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::raster::Raster;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom("delay seconds must be finite and non-negative")
        })
    }
}

/// Client-side tiling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Tile edge length in pixels.
    pub tile_size_px: usize,

    /// Fraction of the tile shared with its neighbour, in `[0, 1)`.
    pub overlap: f64,

    /// Pause between tiles. Useful for watching a merge progress.
    #[serde(with = "duration_secs")]
    pub delay: Duration,

    /// Shuffle tile order before yielding.
    pub randomize: bool,
}

impl TilingConfig {
    /// Default tile edge length.
    pub const DEFAULT_TILE_SIZE_PX: usize = 128;

    /// Default overlap fraction.
    pub const DEFAULT_OVERLAP: f64 = 0.0;

    /// Check the configuration before a run starts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTileSize`] for a zero tile size and
    /// [`ConfigError::InvalidOverlap`] for an overlap outside `[0, 1)`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tile_size_px == 0 {
            return Err(ConfigError::InvalidTileSize(self.tile_size_px));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(ConfigError::InvalidOverlap(self.overlap));
        }
        Ok(())
    }

    /// Set the per-tile delay from fractional seconds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDelay`] for negative or non-finite
    /// values.
    pub fn with_delay_secs(mut self, secs: f64) -> Result<Self, ConfigError> {
        self.delay = Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidDelay(secs))?;
        Ok(self)
    }

    /// Distance between consecutive tile origins along one axis.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn stride(&self) -> usize {
        let stride = (self.tile_size_px as f64 * (1.0 - self.overlap)).round();
        (stride as usize).max(1)
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size_px: Self::DEFAULT_TILE_SIZE_PX,
            overlap: Self::DEFAULT_OVERLAP,
            delay: Duration::ZERO,
            randomize: false,
        }
    }
}

/// Tile origin in source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilePosition {
    /// Column of the top-left corner.
    #[serde(rename = "pos_x")]
    pub x: usize,
    /// Row of the top-left corner.
    #[serde(rename = "pos_y")]
    pub y: usize,
    /// Plane of the top-left corner (3-D only).
    #[serde(rename = "pos_z", default, skip_serializing_if = "Option::is_none")]
    pub z: Option<usize>,
}

/// Where a chunk sits in the full input, and how far the run has got.
///
/// Serialized with the protocol's `tile_params` field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileMetadata {
    /// Top-left origin.
    #[serde(flatten)]
    pub pos: TilePosition,
    /// Tile edge length in pixels.
    #[serde(rename = "tile_size_px")]
    pub size: usize,
    /// Ordinal of this tile in yield order.
    pub tile_idx: usize,
    /// Total number of tiles in the run.
    pub n_tiles: usize,
    /// Whether the input is `(z, y, x)`.
    pub is_3d: bool,
    /// Full spatial shape of the input, in axis order.
    pub extent: Vec<usize>,
}

impl TileMetadata {
    /// Origin in axis order: `[z, y, x]` or `[y, x]`.
    #[must_use]
    pub fn origin(&self) -> Vec<usize> {
        if self.is_3d {
            vec![self.pos.z.unwrap_or(0), self.pos.y, self.pos.x]
        } else {
            vec![self.pos.y, self.pos.x]
        }
    }

    /// Number of spatial axes.
    #[must_use]
    pub const fn ndim(&self) -> usize {
        if self.is_3d { 3 } else { 2 }
    }

    /// Whether this is the last tile of the run.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.tile_idx + 1 >= self.n_tiles
    }

    /// Whether global `coords` (axis order) fall in `[origin, origin + size)`
    /// on every axis.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn contains(&self, coords: &[f64]) -> bool {
        let origin = self.origin();
        coords.len() == origin.len()
            && coords.iter().zip(&origin).all(|(&c, &o)| {
                let lo = o as f64;
                let hi = (o + self.size) as f64;
                lo <= c && c < hi
            })
    }
}

/// Lazy sequence of `(chunk, TileMetadata)` covering a raster.
///
/// Finite and not restartable: once pulled, a tile is gone.
#[derive(Debug)]
pub struct Tiles {
    input: Arc<Raster>,
    origins: Vec<Vec<usize>>,
    cursor: usize,
    size: usize,
    delay: Duration,
}

/// Split `input` into tiles.
///
/// # Errors
///
/// Returns a [`ConfigError`] if `config` is invalid or the input is not
/// 2-D or 3-D.
pub fn tiles(input: impl Into<Arc<Raster>>, config: &TilingConfig) -> Result<Tiles, ConfigError> {
    tiles_with_rng(input, config, &mut rand::rng())
}

/// [`tiles`] with an explicit random source for the `randomize` shuffle.
///
/// # Errors
///
/// Returns a [`ConfigError`] if `config` is invalid or the input is not
/// 2-D or 3-D.
pub fn tiles_with_rng<R: Rng + ?Sized>(
    input: impl Into<Arc<Raster>>,
    config: &TilingConfig,
    rng: &mut R,
) -> Result<Tiles, ConfigError> {
    config.validate()?;
    let input = input.into();
    let rank = input.rank();
    if !(2..=3).contains(&rank) {
        return Err(ConfigError::UnsupportedRank(rank));
    }

    let stride = config.stride();
    let per_axis: Vec<Vec<usize>> = input
        .shape()
        .iter()
        .map(|&dim| axis_origins(dim, config.tile_size_px, stride))
        .collect();

    let mut origins = cartesian(&per_axis);
    if config.randomize {
        origins.shuffle(rng);
    }

    Ok(Tiles {
        input,
        origins,
        cursor: 0,
        size: config.tile_size_px,
        delay: config.delay,
    })
}

impl Tiles {
    /// Total number of tiles, pulled or not.
    #[must_use]
    pub fn n_tiles(&self) -> usize {
        self.origins.len()
    }
}

impl Iterator for Tiles {
    type Item = (Raster, TileMetadata);

    fn next(&mut self) -> Option<Self::Item> {
        let origin = self.origins.get(self.cursor)?;
        if self.cursor > 0 && !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let rank = self.input.rank();
        let chunk = self.input.extract(origin, &vec![self.size; rank]);
        let pos = match origin[..] {
            [z, y, x] => TilePosition { x, y, z: Some(z) },
            [y, x] => TilePosition { x, y, z: None },
            _ => return None,
        };
        let meta = TileMetadata {
            pos,
            size: self.size,
            tile_idx: self.cursor,
            n_tiles: self.origins.len(),
            is_3d: rank == 3,
            extent: self.input.shape().to_vec(),
        };
        self.cursor += 1;
        Some((chunk, meta))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.origins.len() - self.cursor;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Tiles {}

/// Tile origins along one axis of length `dim`.
fn axis_origins(dim: usize, tile: usize, stride: usize) -> Vec<usize> {
    let mut origins = vec![0];
    let mut pos = 0;
    while pos + tile < dim {
        pos += stride;
        origins.push(pos);
    }
    origins
}

/// Row-major cartesian product of per-axis origins.
fn cartesian(per_axis: &[Vec<usize>]) -> Vec<Vec<usize>> {
    per_axis.iter().fold(vec![Vec::new()], |acc, axis| {
        acc.iter()
            .flat_map(|prefix| {
                axis.iter().map(move |&o| {
                    let mut next = prefix.clone();
                    next.push(o);
                    next
                })
            })
            .collect()
    })
}
