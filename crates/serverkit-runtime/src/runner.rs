//! Invocation planning: single shot, stream, or client-side tiled.
//!
//! [`Runner::plan`] checks everything that can be checked before a run
//! starts and returns an [`Invocation`]. [`Invocation::execute`] is the
//! task body; it runs on a worker thread.

use std::sync::Arc;

use serverkit_core::{LayerData, Tiles, TilingConfig, tiles};
use tracing::debug;

use crate::algorithm::{Algorithm, ResultBatch};
use crate::error::{RunnerError, TaskError};
use crate::params::Args;
use crate::task::Produced;

/// How an invocation produces its batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One call to [`Algorithm::run`].
    Single,
    /// Batches pulled from [`Algorithm::stream`].
    Stream,
    /// One call per tile of the image argument.
    Tiled {
        /// Number of tiles.
        n_tiles: usize,
    },
}

/// A planned, not yet started, algorithm call.
pub struct Invocation {
    algorithm: Arc<dyn Algorithm>,
    args: Args,
    plan: Plan,
}

enum Plan {
    Single,
    Stream,
    Tiled { parameter: String, tiles: Tiles },
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("algorithm", &self.algorithm.name())
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

/// Builds [`Invocation`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Runner;

impl Runner {
    /// Plan a call of `algorithm` with `args`, tiled if `tiling` is set.
    ///
    /// Tiling splits the first image parameter of the schema; every other
    /// argument is passed through unchanged.
    ///
    /// # Errors
    ///
    /// [`RunnerError::StreamNotTileable`] for a streaming algorithm with
    /// tiling, [`RunnerError::Config`] for a bad tiling configuration, and
    /// [`RunnerError::MissingRaster`] if there is no raster to tile.
    pub fn plan(
        algorithm: Arc<dyn Algorithm>,
        args: Args,
        tiling: Option<&TilingConfig>,
    ) -> Result<Invocation, RunnerError> {
        let plan = match tiling {
            None if algorithm.is_stream() => Plan::Stream,
            None => Plan::Single,
            Some(_) if algorithm.is_stream() => {
                return Err(RunnerError::StreamNotTileable(algorithm.name().to_owned()));
            }
            Some(config) => {
                config.validate()?;
                let missing = || RunnerError::MissingRaster(algorithm.name().to_owned());
                let schema = algorithm.parameters();
                let parameter = schema.image_parameter().ok_or_else(missing)?.to_owned();
                let raster = args.raster(&parameter).map_err(|_| missing())?.clone();
                let tiles = tiles(raster, config)?;
                debug!(
                    algorithm = algorithm.name(),
                    parameter = %parameter,
                    n_tiles = tiles.n_tiles(),
                    "planned tiled run"
                );
                Plan::Tiled { parameter, tiles }
            }
        };
        Ok(Invocation {
            algorithm,
            args,
            plan,
        })
    }
}

impl Invocation {
    /// How this invocation will produce batches.
    #[must_use]
    pub fn mode(&self) -> RunMode {
        match &self.plan {
            Plan::Single => RunMode::Single,
            Plan::Stream => RunMode::Stream,
            Plan::Tiled { tiles, .. } => RunMode::Tiled {
                n_tiles: tiles.n_tiles(),
            },
        }
    }

    /// Name of the algorithm being invoked.
    #[must_use]
    pub fn algorithm_name(&self) -> &str {
        self.algorithm.name()
    }

    /// Run the algorithm. Meant to be the body of a background task.
    ///
    /// # Errors
    ///
    /// Returns a [`TaskError`] if a single-shot run or stream setup fails.
    /// Errors of individual stream steps surface through the stream.
    pub fn execute(self) -> Result<Produced<ResultBatch>, TaskError> {
        let Self {
            algorithm,
            args,
            plan,
        } = self;
        match plan {
            Plan::Single => Ok(Produced::Value(algorithm.run(&args)?)),
            Plan::Stream => {
                let stream = algorithm.stream(args)?;
                Ok(Produced::Stream(Box::new(
                    stream.map(|batch| batch.map_err(TaskError::from)),
                )))
            }
            Plan::Tiled { parameter, tiles } => {
                let steps = tiles.map(move |(chunk, meta)| -> Result<ResultBatch, TaskError> {
                    let mut tile_args = args.clone();
                    tile_args.set_layer(parameter.clone(), LayerData::Raster(chunk));
                    let batch = algorithm.run(&tile_args)?;
                    Ok(batch
                        .into_iter()
                        .map(|result| result.with_tile(meta.clone()))
                        .collect())
                });
                Ok(Produced::Stream(Box::new(steps)))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serverkit_core::{LayerKind, PartialResult, Raster};

    use super::*;
    use crate::algorithm::BatchStream;
    use crate::error::AlgorithmError;
    use crate::params::{ParameterSchema, ParameterSpec, WidgetType};

    struct Echo {
        stream: bool,
    }

    impl Algorithm for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn parameters(&self) -> ParameterSchema {
            ParameterSchema::new().with("image", ParameterSpec::layer("Image", WidgetType::Image))
        }

        fn is_stream(&self) -> bool {
            self.stream
        }

        fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError> {
            let raster = args.raster("image")?.clone();
            Ok(vec![
                PartialResult::layer(LayerKind::Raster, "echo", LayerData::Raster(raster)),
                PartialResult::value(LayerKind::Text, "done"),
            ])
        }

        fn stream(&self, args: Args) -> Result<BatchStream, AlgorithmError> {
            let batch = self.run(&args);
            Ok(Box::new(vec![batch.clone(), batch].into_iter()))
        }
    }

    fn args(h: usize, w: usize) -> Args {
        Args::new().with_layer("image", LayerData::Raster(Raster::zeros(&[h, w]).unwrap()))
    }

    fn batches(produced: Produced<ResultBatch>) -> Vec<ResultBatch> {
        match produced {
            Produced::Value(batch) => vec![batch],
            Produced::Stream(stream) => stream.map(Result::unwrap).collect(),
        }
    }

    #[test]
    fn plain_algorithm_runs_once() {
        let invocation = Runner::plan(Arc::new(Echo { stream: false }), args(4, 4), None).unwrap();
        assert_eq!(invocation.mode(), RunMode::Single);
        assert_eq!(batches(invocation.execute().unwrap()).len(), 1);
    }

    #[test]
    fn streaming_algorithm_streams() {
        let invocation = Runner::plan(Arc::new(Echo { stream: true }), args(4, 4), None).unwrap();
        assert_eq!(invocation.mode(), RunMode::Stream);
        assert_eq!(batches(invocation.execute().unwrap()).len(), 2);
    }

    #[test]
    fn tiled_run_tags_every_result_with_its_tile() {
        let config = TilingConfig {
            tile_size_px: 4,
            ..TilingConfig::default()
        };
        let invocation =
            Runner::plan(Arc::new(Echo { stream: false }), args(8, 6), Some(&config)).unwrap();
        assert_eq!(invocation.mode(), RunMode::Tiled { n_tiles: 4 });

        let all = batches(invocation.execute().unwrap());
        assert_eq!(all.len(), 4);
        for (idx, batch) in all.iter().enumerate() {
            for result in batch {
                let tile = result.params.tile_params.as_ref().unwrap();
                assert_eq!(tile.tile_idx, idx);
                assert_eq!(tile.n_tiles, 4);
                assert_eq!(tile.extent, [8, 6]);
            }
        }
        let last = all[3][0].data.as_raster().unwrap();
        assert_eq!(last.shape(), [4, 2]);
    }

    #[test]
    fn tiling_a_stream_is_rejected() {
        let err = Runner::plan(
            Arc::new(Echo { stream: true }),
            args(4, 4),
            Some(&TilingConfig::default()),
        )
        .unwrap_err();
        assert_eq!(err, RunnerError::StreamNotTileable("echo".into()));
    }

    #[test]
    fn tiling_needs_a_raster_and_a_valid_config() {
        let err = Runner::plan(
            Arc::new(Echo { stream: false }),
            Args::new(),
            Some(&TilingConfig::default()),
        )
        .unwrap_err();
        assert_eq!(err, RunnerError::MissingRaster("echo".into()));

        let bad = TilingConfig {
            overlap: 1.5,
            ..TilingConfig::default()
        };
        let err = Runner::plan(Arc::new(Echo { stream: false }), args(4, 4), Some(&bad)).unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }
}
