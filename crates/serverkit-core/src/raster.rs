//! Dense rank-2 / rank-3 `f32` arrays.
//!
//! Axis order is `(y, x)` for 2-D and `(z, y, x)` for 3-D data; the last
//! axis is contiguous. Every region operation (extracting a tile, pasting
//! a chunk) copies one contiguous last-axis run at a time.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::error::{DataError, MergeError};

/// Dense row-major array of rank 2 or 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RasterRepr", into = "RasterRepr")]
pub struct Raster {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct RasterRepr {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TryFrom<RasterRepr> for Raster {
    type Error = DataError;

    fn try_from(repr: RasterRepr) -> Result<Self, Self::Error> {
        Self::new(repr.shape, repr.data)
    }
}

impl From<Raster> for RasterRepr {
    fn from(raster: Raster) -> Self {
        Self {
            shape: raster.shape,
            data: raster.data,
        }
    }
}

/// How [`Raster::paste`] treats incoming pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasteMode {
    /// Every incoming pixel overwrites the container.
    Overwrite,
    /// Zero pixels are background and leave the container untouched.
    SkipZeros,
}

impl Raster {
    /// Build a raster from a shape and row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::UnsupportedRank`] unless the shape has two or
    /// three axes, and [`DataError::ShapeMismatch`] if the value count
    /// does not match the shape.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, DataError> {
        check_rank(shape.len())?;
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DataError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// A raster of `shape` filled with zeros.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::UnsupportedRank`] unless the shape has two or
    /// three axes.
    pub fn zeros(shape: &[usize]) -> Result<Self, DataError> {
        check_rank(shape.len())?;
        Ok(Self {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        })
    }

    /// A 2-D raster computed per pixel from `(y, x)`.
    #[must_use]
    pub fn from_fn_2d(height: usize, width: usize, f: impl Fn(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(height * width);
        for y in 0..height {
            for x in 0..width {
                data.push(f(y, x));
            }
        }
        Self {
            shape: vec![height, width],
            data,
        }
    }

    /// Shape in axis order.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of axes (2 or 3).
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Row-major values.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Value at `index`, if in bounds.
    #[must_use]
    pub fn get(&self, index: &[usize]) -> Option<f32> {
        flat_offset(&self.shape, index).and_then(|i| self.data.get(i).copied())
    }

    /// Largest value, or `0.0` for an empty raster.
    #[must_use]
    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(0.0_f32, f32::max)
    }

    /// Apply `f` to every value.
    #[must_use]
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Apply `f` to every value in place.
    pub fn map_in_place(&mut self, f: impl Fn(f32) -> f32) {
        for v in &mut self.data {
            *v = f(*v);
        }
    }

    /// Copy out the box `[origin, origin + size)`, truncated to the
    /// raster boundary.
    ///
    /// `origin` and `size` must have one entry per axis. A box starting
    /// outside the raster yields an empty region.
    #[must_use]
    pub fn extract(&self, origin: &[usize], size: &[usize]) -> Self {
        let region: Vec<usize> = self
            .shape
            .iter()
            .zip(origin)
            .zip(size)
            .map(|((&dim, &o), &s)| s.min(dim.saturating_sub(o)))
            .collect();
        let mut data = Vec::with_capacity(region.iter().product());
        for_each_run(&region, |run_start| {
            let index: Vec<usize> = run_start
                .iter()
                .zip(origin)
                .map(|(&r, &o)| r + o)
                .collect();
            if let Some(start) = flat_offset(&self.shape, &index) {
                let len = region[region.len() - 1];
                data.extend_from_slice(&self.data[start..start + len]);
            }
        });
        Self {
            shape: region,
            data,
        }
    }

    /// Write `chunk` into the box starting at `origin`.
    ///
    /// Nothing is written unless the whole chunk fits.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::OutOfBoundsWrite`] if the chunk rank differs
    /// from the container or the box extends past any axis.
    pub fn paste(
        &mut self,
        origin: &[usize],
        chunk: &Self,
        mode: PasteMode,
    ) -> Result<(), MergeError> {
        let fits = chunk.rank() == self.rank()
            && origin.len() == self.rank()
            && origin
                .iter()
                .zip(&chunk.shape)
                .zip(&self.shape)
                .all(|((&o, &c), &d)| o.checked_add(c).is_some_and(|end| end <= d));
        if !fits {
            return Err(MergeError::OutOfBoundsWrite {
                origin: origin.to_vec(),
                chunk: chunk.shape.clone(),
                container: self.shape.clone(),
            });
        }

        let run_len = chunk.shape[chunk.rank() - 1];
        let mut src = 0;
        for_each_run(&chunk.shape, |run_start| {
            let index: Vec<usize> = run_start
                .iter()
                .zip(origin)
                .map(|(&r, &o)| r + o)
                .collect();
            if let Some(dst) = flat_offset(&self.shape, &index) {
                let incoming = &chunk.data[src..src + run_len];
                let target = &mut self.data[dst..dst + run_len];
                match mode {
                    PasteMode::Overwrite => target.copy_from_slice(incoming),
                    PasteMode::SkipZeros => {
                        for (t, &v) in target.iter_mut().zip(incoming) {
                            if v != 0.0 {
                                *t = v;
                            }
                        }
                    }
                }
            }
            src += run_len;
        });
        Ok(())
    }

    /// Convert a grayscale image into a 2-D raster with values `0..=255`.
    #[must_use]
    pub fn from_gray_image(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            shape: vec![height as usize, width as usize],
            data: image.as_raw().iter().map(|&v| f32::from(v)).collect(),
        }
    }

    /// Convert a 2-D raster into a grayscale image, clamping to `0..=255`.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::NotAnImage`] for 3-D rasters.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_gray_image(&self) -> Result<GrayImage, DataError> {
        let &[height, width] = self.shape.as_slice() else {
            return Err(DataError::NotAnImage(self.rank()));
        };
        let pixels: Vec<u8> = self
            .data
            .iter()
            .map(|&v| v.round().clamp(0.0, 255.0) as u8)
            .collect();
        GrayImage::from_raw(
            u32::try_from(width).unwrap_or(u32::MAX),
            u32::try_from(height).unwrap_or(u32::MAX),
            pixels,
        )
        .ok_or_else(|| DataError::ShapeMismatch {
            shape: self.shape.clone(),
            expected: width * height,
            actual: self.data.len(),
        })
    }
}

/// Row-major offset of `index` in an array of `shape`, if in bounds.
fn flat_offset(shape: &[usize], index: &[usize]) -> Option<usize> {
    if index.len() != shape.len() {
        return None;
    }
    let mut offset = 0;
    for (&i, &dim) in index.iter().zip(shape) {
        if i >= dim {
            return None;
        }
        offset = offset * dim + i;
    }
    Some(offset)
}

fn check_rank(rank: usize) -> Result<(), DataError> {
    if rank == 2 || rank == 3 {
        Ok(())
    } else {
        Err(DataError::UnsupportedRank(rank))
    }
}

/// Call `f` with the index of the first element of every last-axis run
/// in a box of `shape`, in row-major order. Empty boxes produce no calls.
fn for_each_run(shape: &[usize], mut f: impl FnMut(&[usize])) {
    if shape.is_empty() || shape.contains(&0) {
        return;
    }
    let outer = &shape[..shape.len() - 1];
    let mut index = vec![0; shape.len()];
    loop {
        f(&index);
        // Advance the outer axes like an odometer; the last axis stays 0.
        let mut axis = outer.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < outer[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}
