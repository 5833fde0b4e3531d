//! Background task manager.
//!
//! Task bodies run on tokio's blocking pool. Whatever they produce is
//! sent back over an unbounded channel and handed to the task's
//! [`TaskReceiver`] on the foreground, in production order, when the
//! owner pumps the manager ([`TaskManager::process_next`],
//! [`TaskManager::process_pending`], [`TaskManager::run_until_idle`]).
//! Only the foreground touches the context `C`.
//!
//! Cancellation is cooperative: the token is checked before every stream
//! step, and values a cancelled task still had in flight are dropped on
//! the foreground instead of reaching the receiver.

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use serverkit_core::ProgressReporter;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TaskError;

/// Identifier of a task in the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Ran to the end.
    Completed,
    /// Stopped by [`TaskManager::cancel`].
    Cancelled,
    /// Returned an error, panicked, or was failed by its receiver.
    Failed(TaskError),
}

/// Pull-based, finite sequence of values produced on the worker thread.
pub type ValueStream<T> = Box<dyn Iterator<Item = Result<T, TaskError>> + Send>;

/// What a task body hands back: one value or a lazy sequence of them.
pub enum Produced<T> {
    /// A single value.
    Value(T),
    /// Values pulled one at a time; cancellation is checked between pulls.
    Stream(ValueStream<T>),
}

impl<T> fmt::Debug for Produced<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(_) => f.write_str("Produced::Value(..)"),
            Self::Stream(_) => f.write_str("Produced::Stream(..)"),
        }
    }
}

/// Foreground consumer of a task's values.
pub trait TaskReceiver<T, C> {
    /// Handle one value. Returning `Break` stops the task, which then
    /// ends as [`TaskOutcome::Failed`] with the given error.
    fn receive(&mut self, ctx: &mut C, value: T) -> ControlFlow<TaskError>;

    /// Called once when the task leaves the active set.
    fn finished(&mut self, _ctx: &mut C, _outcome: &TaskOutcome) {}
}

impl<T, C, F> TaskReceiver<T, C> for F
where
    F: FnMut(&mut C, T) -> ControlFlow<TaskError>,
{
    fn receive(&mut self, ctx: &mut C, value: T) -> ControlFlow<TaskError> {
        self(ctx, value)
    }
}

/// Message from a worker thread to the foreground.
enum TaskEvent<T> {
    Yielded(TaskId, T),
    Finished(TaskId, TaskOutcome),
}

/// What one pump step did.
#[derive(Debug, Clone, PartialEq)]
pub enum Pumped {
    /// A value was delivered to (or discarded for) this task.
    Yielded(TaskId),
    /// The task finished and left the active set.
    Finished(TaskId, TaskOutcome),
}

struct ActiveTask<T, C> {
    token: CancellationToken,
    receiver: Box<dyn TaskReceiver<T, C>>,
    failure: Option<TaskError>,
}

/// Owns the active set and the foreground end of the event channel.
pub struct TaskManager<T, C> {
    handle: Handle,
    tx: mpsc::UnboundedSender<TaskEvent<T>>,
    rx: mpsc::UnboundedReceiver<TaskEvent<T>>,
    active: HashMap<TaskId, ActiveTask<T, C>>,
    next_id: u64,
    reporter: Arc<dyn ProgressReporter>,
}

impl<T, C> fmt::Debug for TaskManager<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("active", &self.active.len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl<T, C> TaskManager<T, C>
where
    T: Send + 'static,
{
    /// Create a manager bound to the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NoRuntime`] when called outside a runtime.
    pub fn new(reporter: Arc<dyn ProgressReporter>) -> Result<Self, TaskError> {
        let handle = Handle::try_current().map_err(|_| TaskError::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            handle,
            tx,
            rx,
            active: HashMap::new(),
            next_id: 0,
            reporter,
        })
    }

    /// Start `task` on the blocking pool and deliver its values to
    /// `receiver`.
    pub fn add_active<F, R>(&mut self, task: F, receiver: R) -> TaskId
    where
        F: FnOnce() -> Result<Produced<T>, TaskError> + Send + 'static,
        R: TaskReceiver<T, C> + 'static,
    {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let token = CancellationToken::new();
        self.active.insert(
            id,
            ActiveTask {
                token: token.clone(),
                receiver: Box::new(receiver),
                failure: None,
            },
        );
        self.reporter.on_start();
        info!(task = %id, "task started");

        let tx = self.tx.clone();
        self.handle
            .spawn_blocking(move || drive(id, task, &token, tx));
        id
    }

    /// Request cancellation of one task. Returns `false` if it is not
    /// active.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.active.get(&id).is_some_and(|task| {
            debug!(task = %id, "cancellation requested");
            task.token.cancel();
            true
        })
    }

    /// Request cancellation of every active task.
    pub fn cancel_all(&self) {
        for (id, task) in &self.active {
            debug!(task = %id, "cancellation requested");
            task.token.cancel();
        }
    }

    /// Whether `id` is still in the active set.
    #[must_use]
    pub fn is_active(&self, id: TaskId) -> bool {
        self.active.contains_key(&id)
    }

    /// Number of tasks in the active set.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Wait for the next event and handle it.
    ///
    /// Returns `None` once nothing is active and no event is queued.
    pub async fn process_next(&mut self, ctx: &mut C) -> Option<Pumped> {
        if let Ok(event) = self.rx.try_recv() {
            return Some(self.handle_event(ctx, event));
        }
        if self.active.is_empty() {
            return None;
        }
        let event = self.rx.recv().await?;
        Some(self.handle_event(ctx, event))
    }

    /// Handle every event already queued, without waiting.
    pub fn process_pending(&mut self, ctx: &mut C) -> Vec<Pumped> {
        let mut pumped = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            pumped.push(self.handle_event(ctx, event));
        }
        pumped
    }

    /// Pump until the active set is empty. Returns the outcome of every
    /// task that finished meanwhile.
    pub async fn run_until_idle(&mut self, ctx: &mut C) -> Vec<(TaskId, TaskOutcome)> {
        let mut finished = Vec::new();
        while let Some(pumped) = self.process_next(ctx).await {
            if let Pumped::Finished(id, outcome) = pumped {
                finished.push((id, outcome));
            }
        }
        finished
    }

    fn handle_event(&mut self, ctx: &mut C, event: TaskEvent<T>) -> Pumped {
        match event {
            TaskEvent::Yielded(id, value) => {
                match self.active.get_mut(&id) {
                    Some(task) if !task.token.is_cancelled() => {
                        if let ControlFlow::Break(err) = task.receiver.receive(ctx, value) {
                            debug!(task = %id, error = %err, "receiver stopped the task");
                            task.failure = Some(err);
                            task.token.cancel();
                        }
                    }
                    _ => debug!(task = %id, "discarding value from cancelled task"),
                }
                Pumped::Yielded(id)
            }
            TaskEvent::Finished(id, outcome) => {
                let outcome = match self.active.remove(&id) {
                    Some(mut task) => {
                        let outcome = match task.failure.take() {
                            Some(err) => TaskOutcome::Failed(err),
                            None if task.token.is_cancelled() => TaskOutcome::Cancelled,
                            None => outcome,
                        };
                        task.receiver.finished(ctx, &outcome);
                        outcome
                    }
                    None => outcome,
                };
                match &outcome {
                    TaskOutcome::Failed(err) => warn!(task = %id, error = %err, "task failed"),
                    other => info!(task = %id, outcome = ?other, "task finished"),
                }
                self.reporter.on_complete();
                Pumped::Finished(id, outcome)
            }
        }
    }
}

impl<T, C> Drop for TaskManager<T, C> {
    fn drop(&mut self) {
        for task in self.active.values() {
            task.token.cancel();
        }
    }
}

/// Sends `Finished` when dropped, so a panicking task body still leaves
/// the active set.
struct FinishGuard<T> {
    id: TaskId,
    tx: mpsc::UnboundedSender<TaskEvent<T>>,
    outcome: Option<TaskOutcome>,
}

impl<T> Drop for FinishGuard<T> {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or(TaskOutcome::Failed(TaskError::Panicked));
        let _ = self.tx.send(TaskEvent::Finished(self.id, outcome));
    }
}

/// Worker-thread body: run the task and forward what it produces.
fn drive<T, F>(id: TaskId, task: F, token: &CancellationToken, tx: mpsc::UnboundedSender<TaskEvent<T>>)
where
    F: FnOnce() -> Result<Produced<T>, TaskError>,
{
    let mut guard = FinishGuard {
        id,
        tx: tx.clone(),
        outcome: None,
    };
    let outcome = match task() {
        Err(err) => TaskOutcome::Failed(err),
        Ok(Produced::Value(value)) => {
            let _ = tx.send(TaskEvent::Yielded(id, value));
            TaskOutcome::Completed
        }
        Ok(Produced::Stream(mut stream)) => loop {
            if token.is_cancelled() {
                break TaskOutcome::Cancelled;
            }
            match stream.next() {
                None => break TaskOutcome::Completed,
                Some(Err(err)) => break TaskOutcome::Failed(err),
                Some(Ok(value)) => {
                    if tx.send(TaskEvent::Yielded(id, value)).is_err() {
                        break TaskOutcome::Cancelled;
                    }
                }
            }
        },
    };
    guard.outcome = Some(outcome);
}
