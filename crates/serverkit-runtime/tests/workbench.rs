//! Integration tests: run algorithms through a `Workbench` and check what
//! lands in the result store.

#![allow(clippy::unwrap_used, clippy::cast_precision_loss)]

use std::sync::Arc;
use std::sync::mpsc;

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use serverkit_core::{
    LayerData, LayerKind, PartialResult, Raster, Severity, Table, TilingConfig,
};
use serverkit_runtime::{
    Algorithm, AlgorithmError, Args, BatchStream, ParameterSchema, ParameterSpec, Pumped,
    Recorder, ResultBatch, TaskError, TaskOutcome, WidgetType, Workbench, WorkbenchError,
};

fn image_schema() -> ParameterSchema {
    ParameterSchema::new().with("image", ParameterSpec::layer("Image", WidgetType::Image))
}

fn overrides(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn tiling(tile_size_px: usize) -> TilingConfig {
    TilingConfig {
        tile_size_px,
        ..TilingConfig::default()
    }
}

fn workbench(recorder: &Recorder) -> Workbench {
    Workbench::new(Box::new(recorder.clone()), Arc::new(recorder.clone())).unwrap()
}

fn stored(bench: &Workbench, name: &str) -> Raster {
    bench.store().read(name).unwrap().data.as_raster().unwrap().clone()
}

/// Pointwise `v -> 255 - v`.
struct Invert;

impl Algorithm for Invert {
    fn name(&self) -> &str {
        "invert"
    }

    fn parameters(&self) -> ParameterSchema {
        image_schema()
    }

    fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError> {
        let inverted = args.raster("image")?.map(|v| 255.0 - v);
        Ok(vec![PartialResult::layer(
            LayerKind::Raster,
            "inverted",
            LayerData::Raster(inverted),
        )])
    }
}

/// Blocks before every step until the test lets it through.
struct Gated {
    gate: Mutex<mpsc::Receiver<()>>,
}

impl Algorithm for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    fn parameters(&self) -> ParameterSchema {
        image_schema()
    }

    fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError> {
        let _ = self.gate.lock().recv();
        let ones = args.raster("image")?.map(|_| 1.0);
        Ok(vec![PartialResult::layer(
            LayerKind::Mask,
            "gated",
            LayerData::Raster(ones),
        )])
    }
}

/// Streams a count-up overlay and a final notification.
struct Counter;

impl Algorithm for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new().with("steps", ParameterSpec::int("Steps", 3, 1, 10))
    }

    fn is_stream(&self) -> bool {
        true
    }

    fn run(&self, _args: &Args) -> Result<ResultBatch, AlgorithmError> {
        Ok(Vec::new())
    }

    fn stream(&self, args: Args) -> Result<BatchStream, AlgorithmError> {
        let steps = args.i64("steps")?;
        Ok(Box::new((1..=steps).map(move |i| -> Result<ResultBatch, AlgorithmError> {
            let mut batch = vec![PartialResult::value(LayerKind::Scalar, i)];
            if i == steps {
                batch.push(PartialResult::notification(Severity::Info, "counted"));
            }
            Ok(batch)
        })))
    }
}

/// Reports the pixel sum of each tile as a value, no layers.
struct TileSum;

impl Algorithm for TileSum {
    fn name(&self) -> &str {
        "tile-sum"
    }

    fn parameters(&self) -> ParameterSchema {
        image_schema()
    }

    fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError> {
        let sum: f32 = args.raster("image")?.as_slice().iter().sum();
        Ok(vec![PartialResult::value(LayerKind::Scalar, f64::from(sum))])
    }
}

/// Emits boxes, which cannot be merged on 3-D tiles.
struct Boxes;

impl Algorithm for Boxes {
    fn name(&self) -> &str {
        "boxes"
    }

    fn parameters(&self) -> ParameterSchema {
        image_schema()
    }

    fn run(&self, _args: &Args) -> Result<ResultBatch, AlgorithmError> {
        let corners = Table::from_rows(3, [[0.0, 0.0, 0.0]; 4])?;
        Ok(vec![PartialResult::layer(
            LayerKind::Boxes,
            "boxes",
            LayerData::Boxes(corners),
        )])
    }
}

#[tokio::test]
async fn tiled_run_matches_untiled_run() {
    let recorder = Recorder::new();
    let mut bench = workbench(&recorder);
    let input = Raster::from_fn_2d(20, 20, |y, x| (y * 20 + x) as f32 % 256.0);
    bench
        .import_layer(LayerKind::Raster, LayerData::Raster(input.clone()), "input")
        .unwrap();

    bench
        .run(Arc::new(Invert), &overrides(json!({"image": "input"})), Some(&tiling(8)))
        .unwrap();
    let finished = bench.run_until_idle().await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].1, TaskOutcome::Completed);
    assert_eq!(stored(&bench, "inverted"), input.map(|v| 255.0 - v));

    let seen = recorder.snapshot();
    assert_eq!(seen.started, 1);
    assert_eq!(seen.completed, 1);
    assert_eq!(seen.progress.last(), Some(&(9, 9)));
    assert_eq!(seen.progress.len(), 10);
}

#[tokio::test]
async fn cancelling_after_two_tiles_keeps_exactly_those_tiles() {
    let (permits, gate) = mpsc::channel();
    let algorithm = Arc::new(Gated {
        gate: Mutex::new(gate),
    });
    let recorder = Recorder::new();
    let mut bench = workbench(&recorder);
    bench
        .import_layer(
            LayerKind::Raster,
            LayerData::Raster(Raster::zeros(&[8, 8]).unwrap()),
            "input",
        )
        .unwrap();

    let id = bench
        .run(algorithm, &overrides(json!({"image": "input"})), Some(&tiling(4)))
        .unwrap();
    for _ in 0..2 {
        permits.send(()).unwrap();
        assert_eq!(bench.pump_next().await, Some(Pumped::Yielded(id)));
    }
    assert!(bench.cancel(id));
    drop(permits);

    let finished = bench.run_until_idle().await;
    assert_eq!(finished, [(id, TaskOutcome::Cancelled)]);
    assert!(!bench.is_active(id));
    assert!(!bench.is_busy());

    let merged = stored(&bench, "gated");
    for y in 0..8 {
        for x in 0..8 {
            let expected = if y < 4 { 1.0 } else { 0.0 };
            assert_eq!(merged.get(&[y, x]), Some(expected), "pixel ({y}, {x})");
        }
    }
    assert_eq!(recorder.snapshot().completed, 1);
}

#[tokio::test]
async fn streamed_values_reach_the_status_sink() {
    let recorder = Recorder::new();
    let mut bench = workbench(&recorder);
    bench
        .run(Arc::new(Counter), &overrides(json!({"steps": 4})), None)
        .unwrap();
    bench.run_until_idle().await;

    let seen = recorder.snapshot();
    assert_eq!(seen.status.overlay.as_deref(), Some("4"));
    assert_eq!(
        seen.status.notifications,
        [(Severity::Info, "counted".to_owned())]
    );
    assert_eq!(seen.progress, [(1, 0), (2, 0), (3, 0), (4, 0)]);
    assert!(bench.store().is_empty());
}

#[tokio::test]
async fn bad_arguments_fail_before_anything_runs() {
    let recorder = Recorder::new();
    let mut bench = workbench(&recorder);
    let err = bench
        .run(Arc::new(Counter), &overrides(json!({"steps": 0})), None)
        .unwrap_err();
    assert!(matches!(err, WorkbenchError::Param(_)));

    let err = bench
        .run(Arc::new(Counter), &Map::new(), Some(&tiling(8)))
        .unwrap_err();
    assert!(matches!(err, WorkbenchError::Runner(_)));
    assert!(!bench.is_busy());
    assert_eq!(recorder.snapshot().started, 0);
}

#[tokio::test]
async fn fatal_merge_error_stops_the_run() {
    let recorder = Recorder::new();
    let mut bench = workbench(&recorder);
    let volume = Raster::zeros(&[8, 8, 8]).unwrap();
    bench
        .import_layer(LayerKind::Raster, LayerData::Raster(volume), "volume")
        .unwrap();

    bench
        .run(Arc::new(Boxes), &overrides(json!({"image": "volume"})), Some(&tiling(4)))
        .unwrap();
    let finished = bench.run_until_idle().await;
    assert!(matches!(
        finished[0].1,
        TaskOutcome::Failed(TaskError::Merge(_))
    ));
    assert!(!bench.store().contains("boxes"));

    let seen = recorder.snapshot();
    assert_eq!(seen.status.notifications.len(), 1);
    assert_eq!(seen.status.notifications[0].0, Severity::Error);
}

#[tokio::test]
async fn value_only_tiled_run_reports_tile_progress() {
    let recorder = Recorder::new();
    let mut bench = workbench(&recorder);
    bench
        .import_layer(
            LayerKind::Raster,
            LayerData::Raster(Raster::from_fn_2d(8, 8, |_, _| 1.0)),
            "input",
        )
        .unwrap();

    bench
        .run(Arc::new(TileSum), &overrides(json!({"image": "input"})), Some(&tiling(4)))
        .unwrap();
    let finished = bench.run_until_idle().await;
    assert_eq!(finished[0].1, TaskOutcome::Completed);

    let seen = recorder.snapshot();
    assert_eq!(seen.progress, [(0, 4), (1, 4), (2, 4), (3, 4), (4, 4)]);
    assert_eq!(seen.status.overlay.as_deref(), Some("16.0"));
    assert!(!bench.store().contains("tile-sum"));
}
