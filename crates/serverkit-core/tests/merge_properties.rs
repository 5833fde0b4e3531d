//! Integration tests: tile a raster, run a per-tile computation, and merge
//! the partial results back through a `MergeSession`.

#![allow(clippy::unwrap_used, clippy::cast_precision_loss)]

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serverkit_core::{
    LayerData, LayerKind, MergeSession, NoProgress, PartialResult, Raster, RecordingStatus,
    ResultStore, RunState, Table, TileMetadata, TilingConfig, tiles, tiles_with_rng,
};

fn gradient(height: usize, width: usize) -> Raster {
    Raster::from_fn_2d(height, width, |y, x| ((y * 7 + x * 3) % 256) as f32)
}

fn config(tile_size_px: usize, overlap: f64) -> TilingConfig {
    TilingConfig {
        tile_size_px,
        overlap,
        ..TilingConfig::default()
    }
}

/// Run `f` on every tile of `input` and merge the outputs into `store`.
fn tiled_run(
    store: &mut ResultStore,
    input: &Raster,
    cfg: &TilingConfig,
    kind: LayerKind,
    f: impl FnMut(Raster, &TileMetadata) -> LayerData,
) -> MergeSession {
    merge_tiles(store, tiles(input.clone(), cfg).unwrap(), kind, f)
}

/// Merge the outputs of `f` over the given tiles, in iteration order.
fn merge_tiles(
    store: &mut ResultStore,
    tiles: impl IntoIterator<Item = (Raster, TileMetadata)>,
    kind: LayerKind,
    mut f: impl FnMut(Raster, &TileMetadata) -> LayerData,
) -> MergeSession {
    let mut session = MergeSession::new();
    let mut status = RecordingStatus::default();
    for (chunk, meta) in tiles {
        let data = f(chunk, &meta);
        let result = PartialResult::layer(kind, "out", data).with_tile(meta);
        session
            .apply(store, &mut status, &NoProgress, result)
            .unwrap();
    }
    session
}

fn stored_raster(store: &ResultStore) -> Raster {
    store.read("out").unwrap().data.as_raster().unwrap().clone()
}

#[test]
fn tiled_pointwise_filter_equals_untiled() {
    let input = gradient(256, 256);
    let threshold = |v: f32| if v > 100.0 { 255.0 } else { 0.0 };

    let mut store = ResultStore::new();
    let session = tiled_run(&mut store, &input, &config(128, 0.0), LayerKind::Mask, |chunk, _| {
        LayerData::Raster(chunk.map(threshold))
    });

    assert_eq!(session.state(), RunState::Complete);
    assert_eq!(stored_raster(&store), input.map(threshold));
}

#[test]
fn non_divisible_extent_is_fully_reconstructed() {
    let input = gradient(100, 37);
    let mut store = ResultStore::new();
    tiled_run(&mut store, &input, &config(16, 0.3), LayerKind::Raster, |chunk, _| {
        LayerData::Raster(chunk)
    });
    assert_eq!(stored_raster(&store), input);
}

#[test]
fn three_d_tiles_reconstruct_the_volume() {
    let values: Vec<f32> = (0..6 * 5 * 7).map(|v| v as f32).collect();
    let input = Raster::new(vec![6, 5, 7], values).unwrap();
    let mut store = ResultStore::new();
    tiled_run(&mut store, &input, &config(4, 0.0), LayerKind::Raster, |chunk, _| {
        LayerData::Raster(chunk)
    });
    assert_eq!(stored_raster(&store), input);
}

#[test]
fn raster_merge_is_idempotent() {
    let input = gradient(40, 40);
    let cfg = config(16, 0.25);
    let double = |chunk: Raster, _: &TileMetadata| LayerData::Raster(chunk.map(|v| v * 2.0));

    let mut first = ResultStore::new();
    tiled_run(&mut first, &input, &cfg, LayerKind::Raster, double);
    let once = stored_raster(&first);

    tiled_run(&mut first, &input, &cfg, LayerKind::Raster, double);
    assert_eq!(stored_raster(&first), once);

    let mut fresh = ResultStore::new();
    tiled_run(&mut fresh, &input, &cfg, LayerKind::Raster, double);
    assert_eq!(stored_raster(&fresh), once);
}

#[test]
fn instance_labels_never_collide_across_tiles() {
    let input = gradient(24, 24);
    let cfg = config(8, 0.0);
    let mut store = ResultStore::new();
    let mut session = MergeSession::new();
    let mut status = RecordingStatus::default();

    let mut seen = BTreeSet::new();
    for (chunk, meta) in tiles(input, &cfg).unwrap() {
        // Two objects per tile, labelled 1 and 2 locally.
        let labels = Raster::from_fn_2d(chunk.shape()[0], chunk.shape()[1], |y, _| {
            if y < 4 { 1.0 } else { 2.0 }
        });
        let before = store
            .read("out")
            .map(|layer| layer.data.as_raster().unwrap().max_value())
            .unwrap_or(0.0);
        let result =
            PartialResult::layer(LayerKind::InstanceMask, "out", LayerData::Raster(labels))
                .with_tile(meta);
        session
            .apply(&mut store, &mut status, &NoProgress, result)
            .unwrap();

        let merged = stored_raster(&store);
        let new_labels: BTreeSet<u32> = merged
            .as_slice()
            .iter()
            .filter(|&&v| v > before)
            .map(|&v| v as u32)
            .collect();
        assert_eq!(new_labels.len(), 2);
        assert!(new_labels.is_disjoint(&seen));
        seen.extend(new_labels);
    }
    assert_eq!(seen.len(), 2 * 9);
}

#[test]
fn overlapping_points_keep_only_the_later_detection() {
    // Extent 4x6, tile 4, overlap 0.5: tiles at x=0 and x=2.
    let input = gradient(4, 6);
    let global = [1.0, 3.0];
    let mut store = ResultStore::new();
    let mut producers = Vec::new();
    tiled_run(&mut store, &input, &config(4, 0.5), LayerKind::Points, |_, meta| {
        producers.push(meta.tile_idx);
        let origin = meta.origin();
        let local = [global[0] - origin[0] as f64, global[1] - origin[1] as f64];
        LayerData::Points(Table::from_rows(2, [local]).unwrap())
    });

    assert_eq!(producers, [0, 1]);
    let LayerData::Points(points) = &store.read("out").unwrap().data else {
        unreachable!()
    };
    assert_eq!(points.len(), 1);
    assert_eq!(points.row(0), Some(&global[..]));
}

#[test]
fn points_outside_the_later_tile_survive() {
    let input = gradient(4, 6);
    let mut store = ResultStore::new();
    tiled_run(&mut store, &input, &config(4, 0.5), LayerKind::Points, |_, _| {
        // Each tile reports one point at its local (0, 0).
        LayerData::Points(Table::from_rows(2, [[0.0, 0.0]]).unwrap())
    });
    let LayerData::Points(points) = &store.read("out").unwrap().data else {
        unreachable!()
    };
    let rows: Vec<&[f64]> = points.rows().collect();
    assert_eq!(rows, [&[0.0, 0.0][..], &[0.0, 2.0][..]]);
}

#[test]
fn box_inside_later_tile_replaces_earlier_one() {
    // Tiles at x=0 and x=2 share columns 2..4.
    let input = gradient(4, 6);
    let corners = |y0: f64, x0: f64, y1: f64, x1: f64| [[y0, x0], [y0, x1], [y1, x1], [y1, x0]];
    let mut store = ResultStore::new();
    tiled_run(&mut store, &input, &config(4, 0.5), LayerKind::Boxes, |_, meta| {
        let ox = meta.origin()[1] as f64;
        let boxes: Vec<[f64; 2]> = if meta.tile_idx == 0 {
            // One box in the shared region, one straddling the shared border.
            corners(1.0, 2.0, 3.0, 3.0)
                .into_iter()
                .chain(corners(0.0, 0.0, 1.0, 2.0))
                .collect()
        } else {
            corners(1.0, 2.0 - ox, 3.0, 3.0 - ox).to_vec()
        };
        LayerData::Boxes(Table::from_rows(2, boxes).unwrap())
    });

    let LayerData::Boxes(boxes) = &store.read("out").unwrap().data else {
        unreachable!()
    };
    assert_eq!(boxes.len(), 8);
    let first_corners: Vec<&[f64]> = boxes.rows().step_by(4).collect();
    assert_eq!(first_corners, [&[0.0, 0.0][..], &[1.0, 2.0][..]]);
}

#[test]
fn shuffled_tile_order_merges_to_the_same_raster() {
    let input = gradient(40, 40);
    let cfg = config(16, 0.25);
    let double = |chunk: Raster, _: &TileMetadata| LayerData::Raster(chunk.map(|v| v * 2.0));

    let mut ordered = ResultStore::new();
    tiled_run(&mut ordered, &input, &cfg, LayerKind::Raster, double);
    let expected = stored_raster(&ordered);
    assert_eq!(expected, input.map(|v| v * 2.0));

    let shuffled_cfg = TilingConfig {
        randomize: true,
        ..cfg.clone()
    };
    let row_major: Vec<_> = tiles(input.clone(), &cfg).unwrap().map(|(_, m)| m.pos).collect();
    let mut reordered = false;
    for seed in 0..8 {
        let mut rng = StdRng::seed_from_u64(seed);
        let shuffled: Vec<_> = tiles_with_rng(input.clone(), &shuffled_cfg, &mut rng)
            .unwrap()
            .collect();
        let order: Vec<_> = shuffled.iter().map(|(_, m)| m.pos).collect();
        reordered |= order != row_major;

        let mut store = ResultStore::new();
        let session = merge_tiles(&mut store, shuffled, LayerKind::Raster, double);
        assert_eq!(session.state(), RunState::Complete, "seed {seed}");
        assert_eq!(stored_raster(&store), expected, "seed {seed}");
    }
    assert!(reordered);
}

#[test]
fn overlapping_vectors_are_owned_by_their_origin_row() {
    // Extent 4x6, tile 4, overlap 0.5: tiles at x=0 and x=2.
    let input = gradient(4, 6);
    let shared = [[1.0, 3.0], [0.5, 0.5]];
    let left_only = [[1.0, 1.0], [0.0, 3.0]];
    let mut store = ResultStore::new();
    tiled_run(&mut store, &input, &config(4, 0.5), LayerKind::Vectors, |_, meta| {
        let ox = meta.origin()[1] as f64;
        let mut rows = vec![[shared[0][0], shared[0][1] - ox], shared[1]];
        if meta.tile_idx == 0 {
            // Starts in the first tile only, points into the second.
            rows.extend(left_only);
        }
        LayerData::Vectors(Table::from_rows(2, rows).unwrap())
    });

    let LayerData::Vectors(vectors) = &store.read("out").unwrap().data else {
        unreachable!()
    };
    let rows: Vec<&[f64]> = vectors.rows().collect();
    assert_eq!(
        rows,
        [&left_only[0][..], &left_only[1][..], &shared[0][..], &shared[1][..]]
    );
}

#[test]
fn overlapping_tracks_dedup_on_spatial_columns() {
    // Columns are track_id, t, y, x; ownership follows (y, x) only.
    let input = gradient(4, 6);
    let mut store = ResultStore::new();
    tiled_run(&mut store, &input, &config(4, 0.5), LayerKind::Tracks, |_, meta| {
        let ox = meta.origin()[1] as f64;
        let mut rows = vec![[7.0, 0.0, 1.0, 3.0 - ox]];
        if meta.tile_idx == 0 {
            rows.push([8.0, 5.0, 2.0, 0.0]);
        }
        LayerData::Tracks(Table::from_rows(4, rows).unwrap())
    });

    let LayerData::Tracks(tracks) = &store.read("out").unwrap().data else {
        unreachable!()
    };
    let rows: Vec<&[f64]> = tracks.rows().collect();
    assert_eq!(rows, [&[8.0, 5.0, 2.0, 0.0][..], &[7.0, 0.0, 1.0, 3.0][..]]);
}

#[test]
fn delay_pauses_between_tiles_only() {
    let delay = Duration::from_millis(20);
    let cfg = TilingConfig {
        tile_size_px: 4,
        delay,
        ..TilingConfig::default()
    };
    let mut pending = tiles(gradient(8, 8), &cfg).unwrap();
    assert_eq!(pending.n_tiles(), 4);

    let start = Instant::now();
    assert!(pending.next().is_some());
    let first = start.elapsed();
    assert_eq!(pending.count(), 3);

    assert!(first < delay, "first tile waited {first:?}");
    assert!(start.elapsed() >= delay * 3);
}
