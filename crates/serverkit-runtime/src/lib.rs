//! Background execution for serverkit algorithms.
//!
//! - [`task`]: a tokio-backed task manager with cooperative cancellation.
//! - [`params`]: parameter schemas and argument binding.
//! - [`algorithm`]: the algorithm contract and registry.
//! - [`runner`]: single, streaming, and tiled invocation plans.
//! - [`workbench`]: the foreground controller tying them to a result store.

pub mod algorithm;
pub mod error;
pub mod params;
pub mod runner;
pub mod sinks;
pub mod task;
pub mod workbench;

pub use algorithm::{Algorithm, AlgorithmRegistry, BatchStream, ResultBatch};
pub use error::{AlgorithmError, ParamError, RunnerError, TaskError, WorkbenchError};
pub use params::{Args, ParameterSchema, ParameterSpec, WidgetType, resolve_args};
pub use runner::{Invocation, RunMode, Runner};
pub use sinks::{LogStatus, Recorder, Recording};
pub use task::{
    Produced, Pumped, TaskId, TaskManager, TaskOutcome, TaskReceiver, ValueStream,
};
pub use workbench::{Foreground, Workbench};
