//! Console feedback and export of finished layers.

use std::fs;
use std::path::{Path, PathBuf};

use serverkit_core::{Layer, LayerData, LayerEvent, LayerKind, LayerObserver, ProgressReporter};
use tracing::{debug, info};

use crate::error::CliError;

/// Logs every store mutation.
#[derive(Debug, Default)]
pub struct ConsoleDisplay {
    updates: usize,
}

impl LayerObserver for ConsoleDisplay {
    fn on_event(&mut self, event: &LayerEvent<'_>) {
        match event {
            LayerEvent::Created(layer) => {
                info!(name = %layer.name, kind = %layer.kind, data = layer.data.describe(), "layer created");
            }
            LayerEvent::Updated(layer) => {
                self.updates += 1;
                debug!(name = %layer.name, updates = self.updates, "layer updated");
            }
            LayerEvent::Deleted(name) => info!(name = %name, "layer deleted"),
            LayerEvent::Renamed { from, to } => info!(from = %from, to = %to, "layer renamed"),
        }
    }
}

/// Logs run progress. A total of zero means an open-ended stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn on_start(&self) {
        info!("run started");
    }

    fn on_progress(&self, current: usize, total: usize) {
        if total == 0 {
            info!(step = current, "progress");
        } else {
            info!(current, total, "progress");
        }
    }

    fn on_complete(&self) {
        info!("run finished");
    }
}

/// File name for `layer` inside an export directory.
fn file_name(layer: &Layer) -> String {
    let stem: String = layer
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let extension = if matches!(layer.data, LayerData::Raster(_)) {
        "png"
    } else {
        "json"
    };
    format!("{stem}.{extension}")
}

/// Write `layer` to `dir`: rasters as grayscale PNG, everything else as
/// JSON. Binary masks are stretched to `0..=255`.
///
/// # Errors
///
/// Returns a [`CliError`] if the layer cannot be encoded or written.
pub fn export_layer(layer: &Layer, dir: &Path) -> Result<PathBuf, CliError> {
    let path = dir.join(file_name(layer));
    match &layer.data {
        LayerData::Raster(raster) => {
            let image = if layer.kind == LayerKind::Mask {
                raster.map(|v| v * 255.0).to_gray_image()?
            } else {
                raster.to_gray_image()?
            };
            image.save(&path)?;
        }
        data => {
            let json = serde_json::to_string_pretty(data)?;
            fs::write(&path, json).map_err(|source| CliError::Write {
                path: path.clone(),
                source,
            })?;
        }
    }
    info!(name = %layer.name, path = %path.display(), "exported");
    Ok(path)
}
