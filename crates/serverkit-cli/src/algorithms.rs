//! Built-in algorithms shipped with the `serverkit` binary.
//!
//! Each one takes a grayscale image layer (values `0..=255`) and returns
//! one kind of result, so together they cover every merge path: dense
//! rasters and masks, points, paths, values, and a streamed raster.

use imageproc::contours::{Contour, find_contours};
use imageproc::filter::gaussian_blur_f32;
use serverkit_core::{LayerData, LayerKind, PartialResult, Raster, Severity, Table};
use serverkit_runtime::{
    Algorithm, AlgorithmError, AlgorithmRegistry, Args, BatchStream, ParameterSchema,
    ParameterSpec, ResultBatch, WidgetType,
};

/// Every built-in algorithm, keyed by name.
#[must_use]
pub fn builtin() -> AlgorithmRegistry {
    let mut registry = AlgorithmRegistry::new();
    registry.register(Threshold);
    registry.register(Gaussian);
    registry.register(Spots);
    registry.register(Contours);
    registry.register(Summary);
    registry.register(GaussianStream);
    registry
}

fn image_param() -> ParameterSpec {
    ParameterSpec::layer("Image", WidgetType::Image)
}

#[allow(clippy::cast_possible_truncation)]
fn arg_f32(args: &Args, name: &str) -> Result<f32, AlgorithmError> {
    Ok(args.f64(name)? as f32)
}

fn arg_usize(args: &Args, name: &str) -> Result<usize, AlgorithmError> {
    let value = args.i64(name)?;
    usize::try_from(value).map_err(|_| AlgorithmError::WrongType {
        name: name.to_owned(),
        expected: "non-negative integer",
    })
}

fn blur(raster: &Raster, sigma: f32) -> Result<Raster, AlgorithmError> {
    let image = raster.to_gray_image()?;
    Ok(Raster::from_gray_image(&gaussian_blur_f32(&image, sigma)))
}

/// Binary mask of pixels above a level.
#[derive(Debug, Clone, Copy)]
pub struct Threshold;

impl Algorithm for Threshold {
    fn name(&self) -> &str {
        "threshold"
    }

    fn description(&self) -> &str {
        "Binary mask of pixels brighter than a threshold"
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new()
            .with("image", image_param())
            .with(
                "threshold",
                ParameterSpec::float("Threshold", 128.0, 0.0, 255.0)
                    .with_step(1.0)
                    .auto_call(),
            )
            .with("invert", ParameterSpec::bool("Dark objects", false))
    }

    fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError> {
        let level = arg_f32(args, "threshold")?;
        let invert = args.bool("invert")?;
        let mask = args
            .raster("image")?
            .map(|v| if (v > level) != invert { 1.0 } else { 0.0 });
        Ok(vec![PartialResult::layer(
            LayerKind::Mask,
            "threshold",
            LayerData::Raster(mask),
        )])
    }
}

/// Gaussian smoothing.
#[derive(Debug, Clone, Copy)]
pub struct Gaussian;

impl Algorithm for Gaussian {
    fn name(&self) -> &str {
        "gaussian"
    }

    fn description(&self) -> &str {
        "Gaussian blur of a 2-D image"
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new()
            .with("image", image_param())
            .with(
                "sigma",
                ParameterSpec::float("Sigma", 2.0, 0.1, 20.0).with_step(0.1),
            )
    }

    fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError> {
        let blurred = blur(args.raster("image")?, arg_f32(args, "sigma")?)?;
        Ok(vec![
            PartialResult::layer(LayerKind::Raster, "gaussian", LayerData::Raster(blurred))
                .with_meta("colormap", "gray"),
        ])
    }
}

/// Bright local maxima as `(y, x)` points.
#[derive(Debug, Clone, Copy)]
pub struct Spots;

impl Algorithm for Spots {
    fn name(&self) -> &str {
        "spots"
    }

    fn description(&self) -> &str {
        "Local intensity maxima above a minimum brightness"
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new()
            .with("image", image_param())
            .with(
                "min_intensity",
                ParameterSpec::float("Minimum intensity", 128.0, 0.0, 255.0),
            )
            .with("radius", ParameterSpec::int("Suppression radius", 3, 1, 50))
    }

    fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError> {
        let points = local_maxima(
            args.raster("image")?,
            arg_f32(args, "min_intensity")?,
            arg_usize(args, "radius")?,
        )?;
        Ok(vec![
            PartialResult::layer(LayerKind::Points, "spots", LayerData::Points(points))
                .with_meta("size", 5),
        ])
    }
}

/// Pixels at least `min_intensity` that no neighbour within `radius`
/// exceeds. Plateaus keep only their first pixel in row-major order.
#[allow(clippy::cast_precision_loss)]
fn local_maxima(raster: &Raster, min_intensity: f32, radius: usize) -> Result<Table, AlgorithmError> {
    let &[height, width] = raster.shape() else {
        return Err(AlgorithmError::Failed(format!(
            "spot detection needs a 2-D image, got rank {}",
            raster.rank()
        )));
    };
    let values = raster.as_slice();
    let mut points = Table::new(2);
    for y in 0..height {
        for x in 0..width {
            let v = values[y * width + x];
            if v < min_intensity {
                continue;
            }
            let peak = (y.saturating_sub(radius)..=(y + radius).min(height - 1)).all(|ny| {
                (x.saturating_sub(radius)..=(x + radius).min(width - 1)).all(|nx| {
                    let n = values[ny * width + nx];
                    if (ny, nx) < (y, x) { n < v } else { n <= v }
                })
            });
            if peak {
                points.push_row(&[y as f64, x as f64])?;
            }
        }
    }
    Ok(points)
}

/// Outlines of thresholded objects as `(y, x)` polylines.
#[derive(Debug, Clone, Copy)]
pub struct Contours;

impl Algorithm for Contours {
    fn name(&self) -> &str {
        "contours"
    }

    fn description(&self) -> &str {
        "Border-following outlines of pixels above a threshold"
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new()
            .with("image", image_param())
            .with(
                "threshold",
                ParameterSpec::float("Threshold", 128.0, 0.0, 255.0),
            )
    }

    fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError> {
        let level = arg_f32(args, "threshold")?;
        let binary = args
            .raster("image")?
            .map(|v| if v > level { 255.0 } else { 0.0 })
            .to_gray_image()?;
        let contours: Vec<Contour<u32>> = find_contours(&binary);
        let paths = contours
            .into_iter()
            .filter(|c| c.points.len() >= 2)
            .map(|c| {
                Table::from_rows(
                    2,
                    c.points
                        .iter()
                        .map(|p| [f64::from(p.y), f64::from(p.x)]),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(vec![PartialResult::layer(
            LayerKind::Paths,
            "contours",
            LayerData::Paths(paths),
        )])
    }
}

/// Mean intensity as a value plus a min/max/mean notification.
#[derive(Debug, Clone, Copy)]
pub struct Summary;

impl Algorithm for Summary {
    fn name(&self) -> &str {
        "summary"
    }

    fn description(&self) -> &str {
        "Intensity statistics of an image"
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new().with("image", image_param())
    }

    #[allow(clippy::cast_precision_loss)]
    fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError> {
        let values = args.raster("image")?.as_slice();
        if values.is_empty() {
            return Err(AlgorithmError::Failed("image has no pixels".into()));
        }
        let (min, max, sum) = values.iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY, 0.0_f64),
            |(min, max, sum), &v| (min.min(v), max.max(v), sum + f64::from(v)),
        );
        let mean = sum / values.len() as f64;
        Ok(vec![
            PartialResult::value(LayerKind::Scalar, (mean * 100.0).round() / 100.0),
            PartialResult::notification(
                Severity::Info,
                format!("{} pixels, min {min}, max {max}, mean {mean:.2}", values.len()),
            ),
        ])
    }
}

/// Increasingly strong Gaussian blurs, one batch per step.
#[derive(Debug, Clone, Copy)]
pub struct GaussianStream;

impl Algorithm for GaussianStream {
    fn name(&self) -> &str {
        "gaussian-stream"
    }

    fn description(&self) -> &str {
        "Streams Gaussian blurs of growing sigma into one layer"
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new()
            .with("image", image_param())
            .with("max_sigma", ParameterSpec::float("Maximum sigma", 4.0, 0.1, 20.0))
            .with("steps", ParameterSpec::int("Steps", 5, 1, 50))
    }

    fn is_stream(&self) -> bool {
        true
    }

    fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError> {
        let sigma = arg_f32(args, "max_sigma")?;
        Ok(vec![PartialResult::layer(
            LayerKind::Raster,
            "gaussian-stream",
            LayerData::Raster(blur(args.raster("image")?, sigma)?),
        )])
    }

    #[allow(clippy::cast_precision_loss)]
    fn stream(&self, args: Args) -> Result<BatchStream, AlgorithmError> {
        let max_sigma = arg_f32(&args, "max_sigma")?;
        let steps = arg_usize(&args, "steps")?;
        let image = args.raster("image")?.clone();
        Ok(Box::new((1..=steps).map(move |step| -> Result<ResultBatch, AlgorithmError> {
            let sigma = max_sigma * step as f32 / steps as f32;
            let blurred = blur(&image, sigma)?;
            Ok(vec![
                PartialResult::layer(
                    LayerKind::Raster,
                    "gaussian-stream",
                    LayerData::Raster(blurred),
                ),
                PartialResult::value(LayerKind::Text, format!("sigma {sigma:.2}")),
            ])
        })))
    }
}
