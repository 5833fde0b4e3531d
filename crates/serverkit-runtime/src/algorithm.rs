//! The algorithm contract and a name-keyed registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use serverkit_core::PartialResult;

use crate::error::AlgorithmError;
use crate::params::{Args, ParameterSchema};

/// Everything one algorithm step yields.
pub type ResultBatch = Vec<PartialResult>;

/// Lazy sequence of batches from a streaming algorithm.
pub type BatchStream = Box<dyn Iterator<Item = Result<ResultBatch, AlgorithmError>> + Send>;

/// An image-analysis routine callable with resolved [`Args`].
///
/// `run` is called once per invocation (or once per tile when tiled).
/// Streaming algorithms override [`Algorithm::is_stream`] and
/// [`Algorithm::stream`]; the default stream wraps a single `run`.
pub trait Algorithm: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    /// One-line summary for listings.
    fn description(&self) -> &str {
        ""
    }

    /// Declared parameters.
    fn parameters(&self) -> ParameterSchema;

    /// Whether results arrive as a stream of batches.
    fn is_stream(&self) -> bool {
        false
    }

    /// Compute one batch.
    ///
    /// # Errors
    ///
    /// Returns an [`AlgorithmError`] if arguments are unusable or the
    /// computation fails.
    fn run(&self, args: &Args) -> Result<ResultBatch, AlgorithmError>;

    /// Compute a sequence of batches, pulled lazily by the caller.
    ///
    /// # Errors
    ///
    /// Returns an [`AlgorithmError`] if the stream cannot be set up.
    fn stream(&self, args: Args) -> Result<BatchStream, AlgorithmError> {
        let batch = self.run(&args);
        Ok(Box::new(std::iter::once(batch)))
    }
}

/// Algorithms by name.
#[derive(Default, Clone)]
pub struct AlgorithmRegistry {
    algorithms: BTreeMap<String, Arc<dyn Algorithm>>,
}

impl std::fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.algorithms.keys()).finish()
    }
}

impl AlgorithmRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an algorithm under its own name, replacing any previous one.
    pub fn register(&mut self, algorithm: impl Algorithm + 'static) {
        self.algorithms
            .insert(algorithm.name().to_owned(), Arc::new(algorithm));
    }

    /// Look up an algorithm.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Algorithm>> {
        self.algorithms.get(name).cloned()
    }

    /// Registered algorithms in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Algorithm>> {
        self.algorithms.values()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serverkit_core::{LayerKind, Severity};

    use super::*;

    struct Hello;

    impl Algorithm for Hello {
        fn name(&self) -> &str {
            "hello"
        }

        fn parameters(&self) -> ParameterSchema {
            ParameterSchema::new()
        }

        fn run(&self, _args: &Args) -> Result<ResultBatch, AlgorithmError> {
            Ok(vec![
                PartialResult::notification(Severity::Info, "hi"),
                PartialResult::value(LayerKind::Text, "hello"),
            ])
        }
    }

    #[test]
    fn default_stream_wraps_one_run() {
        let batches: Vec<_> = Hello.stream(Args::new()).unwrap().collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].as_ref().unwrap().len(), 2);
    }

    #[test]
    fn registry_looks_up_by_name() {
        let mut registry = AlgorithmRegistry::new();
        registry.register(Hello);
        assert!(registry.get("hello").is_some());
        assert!(registry.get("bye").is_none());
        assert_eq!(registry.iter().count(), 1);
    }
}
