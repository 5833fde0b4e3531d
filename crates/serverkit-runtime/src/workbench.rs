//! The workbench: result store, status, progress, and background runs in
//! one place.
//!
//! A [`Workbench`] is the foreground owner. Each [`Workbench::run`]
//! resolves arguments against the store, plans the invocation, and starts
//! it as a background task whose batches are folded in by a fresh
//! [`MergeSession`]. Nothing touches the store until the owner pumps.

use std::ops::ControlFlow;
use std::sync::Arc;

use serde_json::{Map, Value};
use serverkit_core::{
    LayerData, LayerKind, LayerObserver, MergeSession, ObserverId, ProgressReporter, ResultStore,
    Severity, StatusSink, TilingConfig,
};
use tracing::info;

use crate::algorithm::{Algorithm, ResultBatch};
use crate::error::{TaskError, WorkbenchError};
use crate::params::resolve_args;
use crate::runner::Runner;
use crate::task::{Pumped, TaskId, TaskManager, TaskOutcome, TaskReceiver};

/// State the background tasks' receivers work on.
pub struct Foreground {
    /// Layers produced so far.
    pub store: ResultStore,
    /// Notifications and overlay text.
    pub status: Box<dyn StatusSink>,
    /// Progress of the current run.
    pub progress: Arc<dyn ProgressReporter>,
}

impl std::fmt::Debug for Foreground {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Foreground")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Feeds one run's batches into its merge session.
struct SessionReceiver {
    algorithm: String,
    session: MergeSession,
}

impl TaskReceiver<ResultBatch, Foreground> for SessionReceiver {
    fn receive(&mut self, fg: &mut Foreground, batch: ResultBatch) -> ControlFlow<TaskError> {
        let applied = self.session.apply_batch(
            &mut fg.store,
            fg.status.as_mut(),
            fg.progress.as_ref(),
            batch,
        );
        match applied {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => ControlFlow::Break(err.into()),
        }
    }

    fn finished(&mut self, fg: &mut Foreground, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.session.complete(),
            TaskOutcome::Cancelled => self.session.cancel(),
            TaskOutcome::Failed(err) => {
                self.session.fail();
                fg.status.notify(Severity::Error, &err.to_string());
            }
        }
        info!(
            algorithm = %self.algorithm,
            state = ?self.session.state(),
            skipped = self.session.skipped(),
            "run ended"
        );
    }
}

/// Foreground controller wiring store, merge, tasks, and sinks.
#[derive(Debug)]
pub struct Workbench {
    tasks: TaskManager<ResultBatch, Foreground>,
    foreground: Foreground,
}

impl Workbench {
    /// Create a workbench on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`WorkbenchError::Task`] outside a runtime.
    pub fn new(
        status: Box<dyn StatusSink>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self, WorkbenchError> {
        let tasks = TaskManager::new(Arc::clone(&progress))?;
        Ok(Self {
            tasks,
            foreground: Foreground {
                store: ResultStore::new(),
                status,
                progress,
            },
        })
    }

    /// The result store.
    #[must_use]
    pub const fn store(&self) -> &ResultStore {
        &self.foreground.store
    }

    /// Register a store observer.
    pub fn subscribe(&mut self, observer: Box<dyn LayerObserver>) -> ObserverId {
        self.foreground.store.subscribe(observer)
    }

    /// Add an input layer, e.g. a loaded image.
    ///
    /// # Errors
    ///
    /// Propagates store contract violations.
    pub fn import_layer(
        &mut self,
        kind: LayerKind,
        data: LayerData,
        name: &str,
    ) -> Result<(), WorkbenchError> {
        self.foreground.store.create(kind, data, name, Map::new())?;
        Ok(())
    }

    /// Start `algorithm` in the background.
    ///
    /// Arguments are resolved and the invocation planned before anything
    /// runs, so configuration errors surface here.
    ///
    /// # Errors
    ///
    /// [`WorkbenchError::Param`] for bad arguments,
    /// [`WorkbenchError::Runner`] for an impossible plan.
    pub fn run(
        &mut self,
        algorithm: Arc<dyn Algorithm>,
        overrides: &Map<String, Value>,
        tiling: Option<&TilingConfig>,
    ) -> Result<TaskId, WorkbenchError> {
        let args = resolve_args(&algorithm.parameters(), overrides, &self.foreground.store)?;
        let invocation = Runner::plan(algorithm, args, tiling)?;
        let receiver = SessionReceiver {
            algorithm: invocation.algorithm_name().to_owned(),
            session: MergeSession::new(),
        };
        info!(algorithm = %receiver.algorithm, mode = ?invocation.mode(), "run queued");
        Ok(self
            .tasks
            .add_active(move || invocation.execute(), receiver))
    }

    /// Request cancellation of one run.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.tasks.cancel(id)
    }

    /// Request cancellation of every run.
    pub fn cancel_all(&self) {
        self.tasks.cancel_all();
    }

    /// Whether `id` is still running.
    #[must_use]
    pub fn is_active(&self, id: TaskId) -> bool {
        self.tasks.is_active(id)
    }

    /// Whether any run is still active.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.tasks.active_count() > 0
    }

    /// Apply everything already received, without waiting.
    pub fn pump(&mut self) -> Vec<Pumped> {
        self.tasks.process_pending(&mut self.foreground)
    }

    /// Wait for and apply the next event.
    pub async fn pump_next(&mut self) -> Option<Pumped> {
        self.tasks.process_next(&mut self.foreground).await
    }

    /// Apply events until every run has finished.
    pub async fn run_until_idle(&mut self) -> Vec<(TaskId, TaskOutcome)> {
        self.tasks.run_until_idle(&mut self.foreground).await
    }
}
