//! Document-model registry.
//!
//! Resolves a document type to its reducer module, loading on demand
//! through an injected [`ModuleLoader`]. Concurrent loads for the same
//! type are deduplicated; a type that failed to load permanently is cached
//! distinctly from one that was never attempted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use strand_primitives::Action;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Pure reduction step for one document type.
pub trait Reducer: Send + Sync {
    /// Applies an action to a state.
    ///
    /// `Err` is a thrown (Rust-level) failure; a reducer that wants to
    /// report a domain error returns `Ok` with [`ReducerOutcome::error`]
    /// set. The two are surfaced differently by the executor.
    fn apply(&self, state: serde_json::Value, action: &Action)
        -> Result<ReducerOutcome, String>;
}

/// The result of a successful reduction, possibly carrying a
/// reducer-reported error.
#[derive(Clone, Debug)]
pub struct ReducerOutcome {
    pub state: serde_json::Value,
    pub error: Option<String>,
}

impl ReducerOutcome {
    #[must_use]
    pub fn ok(state: serde_json::Value) -> Self {
        Self { state, error: None }
    }
}

/// A loaded document-model module.
pub trait DocumentModel: Send + Sync {
    fn document_type(&self) -> &str;

    fn initial_state(&self) -> serde_json::Value;

    fn reducer(&self) -> &dyn Reducer;
}

/// Loads document-model modules by type.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Resolves a module for `document_type`. A returned error is treated
    /// as permanent for that type.
    async fn load(&self, document_type: &str) -> Result<Arc<dyn DocumentModel>, String>;
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("document model not found: {document_type}: {reason}")]
    ModuleNotFound {
        document_type: String,
        reason: String,
    },
}

type LoadCell = Arc<OnceCell<Result<Arc<dyn DocumentModel>, String>>>;

/// Registry of document models, keyed by document type.
pub struct DocumentModelRegistry {
    loader: Arc<dyn ModuleLoader>,
    cells: Mutex<HashMap<String, LoadCell>>,
}

impl DocumentModelRegistry {
    #[must_use]
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a module directly. Duplicate registration (e.g. from
    /// concurrent loads racing an explicit register) is benign and
    /// idempotent: the first registration wins.
    pub fn register(&self, model: Arc<dyn DocumentModel>) {
        let document_type = model.document_type().to_owned();

        let cell = self.cell_for(&document_type);
        if cell.set(Ok(model)).is_err() {
            debug!(%document_type, "Document model already registered, ignoring duplicate");
        }
    }

    /// Resolves the module for a document type, loading it on demand.
    ///
    /// Concurrent calls for the same type share a single load; once a
    /// load fails, the failure is cached and returned without retrying.
    pub async fn load(&self, document_type: &str) -> Result<Arc<dyn DocumentModel>, RegistryError> {
        let cell = self.cell_for(document_type);

        let result = cell
            .get_or_init(|| async {
                debug!(%document_type, "Loading document model");

                let loaded = self.loader.load(document_type).await;
                if let Err(reason) = &loaded {
                    warn!(%document_type, %reason, "Document model load failed permanently");
                }
                loaded
            })
            .await;

        match result {
            Ok(model) => Ok(Arc::clone(model)),
            Err(reason) => Err(RegistryError::ModuleNotFound {
                document_type: document_type.to_owned(),
                reason: reason.clone(),
            }),
        }
    }

    /// True if the type has been attempted (successfully or not).
    #[must_use]
    pub fn is_attempted(&self, document_type: &str) -> bool {
        self.cells
            .lock()
            .get(document_type)
            .is_some_and(|cell| cell.initialized())
    }

    fn cell_for(&self, document_type: &str) -> LoadCell {
        Arc::clone(
            self.cells
                .lock()
                .entry(document_type.to_owned())
                .or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use strand_primitives::Scope;

    use super::*;

    struct EchoReducer;

    impl Reducer for EchoReducer {
        fn apply(
            &self,
            state: serde_json::Value,
            _action: &Action,
        ) -> Result<ReducerOutcome, String> {
            Ok(ReducerOutcome::ok(state))
        }
    }

    struct TestModel {
        document_type: String,
    }

    impl DocumentModel for TestModel {
        fn document_type(&self) -> &str {
            &self.document_type
        }

        fn initial_state(&self) -> serde_json::Value {
            serde_json::Value::Null
        }

        fn reducer(&self) -> &dyn Reducer {
            &EchoReducer
        }
    }

    struct CountingLoader {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ModuleLoader for CountingLoader {
        async fn load(&self, document_type: &str) -> Result<Arc<dyn DocumentModel>, String> {
            let _count = self.loads.fetch_add(1, Ordering::SeqCst);

            if document_type == "broken" {
                return Err("module archive is corrupt".to_owned());
            }

            Ok(Arc::new(TestModel {
                document_type: document_type.to_owned(),
            }))
        }
    }

    fn registry() -> (Arc<DocumentModelRegistry>, Arc<CountingLoader>) {
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
        });
        let registry = Arc::new(DocumentModelRegistry::new(
            Arc::clone(&loader) as Arc<dyn ModuleLoader>
        ));
        (registry, loader)
    }

    #[tokio::test]
    async fn concurrent_loads_are_deduplicated() -> eyre::Result<()> {
        let (registry, loader) = registry();

        let (a, b, c) = tokio::join!(
            registry.load("powerhouse/budget"),
            registry.load("powerhouse/budget"),
            registry.load("powerhouse/budget"),
        );

        a?;
        b?;
        c?;

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        Ok(())
    }

    #[tokio::test]
    async fn failed_type_is_cached_without_retry() {
        let (registry, loader) = registry();

        assert!(!registry.is_attempted("broken"));

        let first = registry.load("broken").await;
        let second = registry.load("broken").await;

        assert!(matches!(
            first,
            Err(RegistryError::ModuleNotFound { .. })
        ));
        assert!(matches!(
            second,
            Err(RegistryError::ModuleNotFound { .. })
        ));

        // Permanent failure: exactly one attempt, but the type is marked
        // attempted (distinct from never-attempted).
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(registry.is_attempted("broken"));
        assert!(!registry.is_attempted("never-seen"));
    }

    #[tokio::test]
    async fn duplicate_registration_is_idempotent() -> eyre::Result<()> {
        let (registry, loader) = registry();

        registry.register(Arc::new(TestModel {
            document_type: "local/notes".to_owned(),
        }));
        registry.register(Arc::new(TestModel {
            document_type: "local/notes".to_owned(),
        }));

        let model = registry.load("local/notes").await?;
        assert_eq!(model.document_type(), "local/notes");

        // Registered directly, never through the loader.
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);

        Ok(())
    }

    #[tokio::test]
    async fn reducer_distinguishes_reported_errors() {
        let model = TestModel {
            document_type: "t".to_owned(),
        };

        let action = Action {
            id: "a".to_owned(),
            kind: "NOOP".to_owned(),
            scope: Scope::Global,
            timestamp_utc_ms: 0,
            input: serde_json::Value::Null,
            context: None,
        };

        let outcome = model
            .reducer()
            .apply(serde_json::json!({}), &action)
            .expect("reducer run");
        assert!(outcome.error.is_none());
    }
}
