//! Per-job execution: action → committed operation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use strand_cache::{CacheError, DocumentMetaCache};
use strand_crypto::{ActionSigner, SignError};
use strand_primitives::time::now_utc_ms;
use strand_primitives::{
    Action, Branch, DocumentHeader, DocumentId, EventBus, Hash, Job, JobId, JobPayload, Operation,
    ReactorEvent, Scope,
};
use strand_queue::JobQueue;
use strand_store::{OperationStore, StoreError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{DocumentModelRegistry, RegistryError};

const CREATE_DOCUMENT: &str = "CREATE_DOCUMENT";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("document is deleted: {0}")]
    DocumentDeleted(DocumentId),

    #[error(transparent)]
    ModuleNotFound(#[from] RegistryError),

    /// The reducer ran and reported a domain error.
    #[error("reducer reported error: {0}")]
    ReducerReported(String),

    /// The reducer itself failed.
    #[error("reducer failed: {0}")]
    ReducerFailed(String),

    #[error("operation aborted")]
    Aborted,

    #[error(transparent)]
    Signature(#[from] SignError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to serialize action: {0}")]
    Serialization(String),
}

/// What the pool reports per job. Errors live here, never as panics or
/// propagated results across the worker boundary.
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<ExecutorError>,
}

/// Executes one job at a time against the shared stores.
pub struct JobExecutor {
    store: Arc<dyn OperationStore>,
    registry: Arc<DocumentModelRegistry>,
    cache: Arc<DocumentMetaCache>,
    signer: Arc<ActionSigner>,
    queue: JobQueue,
    bus: EventBus,
}

impl JobExecutor {
    #[must_use]
    pub fn new(
        store: Arc<dyn OperationStore>,
        registry: Arc<DocumentModelRegistry>,
        cache: Arc<DocumentMetaCache>,
        signer: Arc<ActionSigner>,
        queue: JobQueue,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            signer,
            queue,
            bus,
        }
    }

    #[must_use]
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Runs a job to completion. Side effects are durable before this
    /// returns; there is no internal retry — retry policy belongs to the
    /// caller.
    pub async fn execute_job(
        &self,
        job: Job,
        signal: Option<&CancellationToken>,
    ) -> JobOutcome {
        let job_id = job.id.clone();
        let started = Instant::now();

        self.bus.emit(ReactorEvent::JobStarted {
            job_id: job_id.clone(),
        });

        let result = self.run(job, signal).await;
        let duration = started.elapsed();

        match result {
            Ok(()) => {
                debug!(%job_id, ?duration, "Job completed");
                self.bus.emit(ReactorEvent::JobCompleted {
                    job_id: job_id.clone(),
                });

                JobOutcome {
                    job_id,
                    success: true,
                    duration,
                    error: None,
                }
            }
            Err(error) => {
                warn!(%job_id, %error, ?duration, "Job failed");
                self.bus.emit(ReactorEvent::JobFailed {
                    job_id: job_id.clone(),
                    error: error.to_string(),
                });

                JobOutcome {
                    job_id,
                    success: false,
                    duration,
                    error: Some(error),
                }
            }
        }
    }

    async fn run(&self, job: Job, signal: Option<&CancellationToken>) -> Result<(), ExecutorError> {
        check_signal(signal)?;

        match job.payload {
            JobPayload::Action(action) => {
                self.run_action(&job.document_id, &job.scope, &job.branch, action, signal)
                    .await
            }
            JobPayload::Operation(operation) => {
                self.run_operation(&job.document_id, &job.scope, &job.branch, operation)
                    .await
            }
        }
    }

    /// Commits an already-formed operation arriving from a remote.
    /// Duplicate indices surface as [`StoreError::IndexConflict`]; the
    /// first canonical operation per index wins.
    async fn run_operation(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
        operation: Operation,
    ) -> Result<(), ExecutorError> {
        self.store
            .append_operations(document_id, scope, branch, vec![operation])
            .await?;

        if *scope == Scope::Document {
            self.cache.invalidate(document_id, Some(branch));
        }

        Ok(())
    }

    async fn run_action(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
        action: Action,
        signal: Option<&CancellationToken>,
    ) -> Result<(), ExecutorError> {
        let header = self.resolve_header(document_id, &action).await?;

        // Deleted documents accept no further work outside the document
        // scope itself.
        if *scope != Scope::Document {
            let meta = self
                .cache
                .get_document_meta(document_id, branch, signal)
                .await?;
            if meta.state.is_deleted {
                return Err(ExecutorError::DocumentDeleted(document_id.clone()));
            }
        }

        let model = self.registry.load(&header.document_type).await?;

        check_signal(signal)?;

        // Catch the materialized state up to the log head, honoring the
        // invariant: state at revision R = reducer folded over ops[0..R).
        let head = self.store.operation_count(document_id, scope, branch).await?;
        let (mut revision, mut state) = match self.store.get_state(document_id, scope, branch).await? {
            Some((revision, state)) if revision <= head => (revision, state),
            _ => (0, model.initial_state()),
        };

        if revision < head {
            let missed = self
                .store
                .read_range(document_id, scope, branch, revision, head)
                .await?;

            for op in &missed {
                let outcome = model
                    .reducer()
                    .apply(state, &op.action)
                    .map_err(ExecutorError::ReducerFailed)?;
                state = outcome.state;
            }

            revision = head;
        }

        check_signal(signal)?;

        let prev_hash = self.head_hash(document_id, scope, branch, head).await?;

        // Sign unsigned actions with the local identity; pre-signed
        // actions pass through verification unchanged.
        let action = self
            .signer
            .sign_action(action, &prev_hash, signal, false)
            .await?;

        let outcome = model
            .reducer()
            .apply(state, &action)
            .map_err(ExecutorError::ReducerFailed)?;

        if let Some(reported) = outcome.error {
            return Err(ExecutorError::ReducerReported(reported));
        }

        let hash = Operation::chain_hash(&prev_hash, &action)
            .map_err(|err| ExecutorError::Serialization(err.to_string()))?;

        let operation = Operation {
            id: format!("{}:{}", action.id, head),
            index: head,
            skip: 0,
            hash,
            timestamp_utc_ms: now_utc_ms(),
            action,
        };

        self.store
            .append_operations(document_id, scope, branch, vec![operation])
            .await?;
        self.store
            .put_state(document_id, scope, branch, revision + 1, outcome.state)
            .await?;

        if *scope == Scope::Document {
            self.cache.invalidate(document_id, Some(branch));
        }

        info!(%document_id, %scope, %branch, index = head, "Operation committed");

        Ok(())
    }

    /// Resolves the document header, creating it for CREATE_DOCUMENT
    /// actions in the document scope.
    async fn resolve_header(
        &self,
        document_id: &DocumentId,
        action: &Action,
    ) -> Result<DocumentHeader, ExecutorError> {
        match self.store.get_header(document_id).await {
            Ok(header) => Ok(header),
            Err(StoreError::DocumentNotFound(_)) if action.kind == CREATE_DOCUMENT => {
                let document_type = action
                    .input
                    .get("documentType")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();

                let mut header = DocumentHeader::new(document_id.clone(), document_type);
                header.created_at_utc_ms = action.timestamp_utc_ms;

                self.store.put_header(header.clone()).await?;
                Ok(header)
            }
            Err(StoreError::DocumentNotFound(id)) => Err(ExecutorError::DocumentNotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Hash of the log head operation, or the zero hash for an empty log.
    async fn head_hash(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
        head: u64,
    ) -> Result<Hash, ExecutorError> {
        if head == 0 {
            return Ok(Hash::default());
        }

        let tail = self
            .store
            .read_range(document_id, scope, branch, head - 1, head)
            .await?;

        Ok(tail.first().map_or_else(Hash::default, |op| op.hash))
    }
}

fn check_signal(signal: Option<&CancellationToken>) -> Result<(), ExecutorError> {
    if signal.is_some_and(CancellationToken::is_cancelled) {
        return Err(ExecutorError::Aborted);
    }
    Ok(())
}

impl From<CacheError> for ExecutorError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::DocumentNotFound(id) => Self::DocumentNotFound(id),
            CacheError::Aborted => Self::Aborted,
            CacheError::Store(err) => Self::Store(err),
            other => Self::Store(StoreError::Io(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use strand_cache::DEFAULT_MAX_ENTRIES;
    use strand_store::MemoryStore;

    use crate::registry::{DocumentModel, ModuleLoader, Reducer, ReducerOutcome};

    use super::*;

    struct CountingReducer;

    impl Reducer for CountingReducer {
        fn apply(
            &self,
            state: serde_json::Value,
            action: &Action,
        ) -> Result<ReducerOutcome, String> {
            match action.kind.as_str() {
                "FAIL_HARD" => Err("reducer blew up".to_owned()),
                "FAIL_SOFT" => Ok(ReducerOutcome {
                    state,
                    error: Some("domain rule violated".to_owned()),
                }),
                _ => {
                    let count = state.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
                    Ok(ReducerOutcome::ok(serde_json::json!({ "count": count + 1 })))
                }
            }
        }
    }

    struct CounterModel;

    impl DocumentModel for CounterModel {
        fn document_type(&self) -> &str {
            "test/counter"
        }

        fn initial_state(&self) -> serde_json::Value {
            serde_json::json!({ "count": 0 })
        }

        fn reducer(&self) -> &dyn Reducer {
            &CountingReducer
        }
    }

    struct CounterLoader;

    #[async_trait]
    impl ModuleLoader for CounterLoader {
        async fn load(&self, document_type: &str) -> Result<Arc<dyn DocumentModel>, String> {
            if document_type == "test/counter" {
                Ok(Arc::new(CounterModel))
            } else {
                Err(format!("unknown document type: {document_type}"))
            }
        }
    }

    struct Fixture {
        executor: JobExecutor,
        store: Arc<MemoryStore>,
        signer_key: ActionSigner,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::default();
        let queue = JobQueue::new(bus.clone());
        let registry = Arc::new(DocumentModelRegistry::new(Arc::new(CounterLoader)));
        let cache = Arc::new(DocumentMetaCache::new(
            Arc::clone(&store) as Arc<dyn OperationStore>,
            DEFAULT_MAX_ENTRIES,
        ));
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        let signer = Arc::new(ActionSigner::new(signing_key.clone(), "reactor-a"));

        Fixture {
            executor: JobExecutor::new(
                Arc::clone(&store) as Arc<dyn OperationStore>,
                registry,
                cache,
                Arc::clone(&signer),
                queue,
                bus,
            ),
            store,
            signer_key: ActionSigner::new(signing_key, "reactor-a"),
        }
    }

    fn action(id: &str, kind: &str, scope: Scope) -> Action {
        Action {
            id: id.to_owned(),
            kind: kind.to_owned(),
            scope,
            timestamp_utc_ms: 1_700_000_000_000,
            input: serde_json::json!({}),
            context: None,
        }
    }

    fn job(id: &str, doc: &str, scope: Scope, action: Action) -> Job {
        Job {
            id: id.into(),
            document_id: doc.into(),
            scope,
            branch: Branch::main(),
            payload: JobPayload::Action(action),
            created_at_utc_ms: 0,
            queue_hint: None,
        }
    }

    async fn seed_document(fx: &Fixture, doc: &str) {
        let mut create = action("create", CREATE_DOCUMENT, Scope::Document);
        create.input = serde_json::json!({ "documentType": "test/counter" });

        let outcome = fx
            .executor
            .execute_job(job("job-create", doc, Scope::Document, create), None)
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
    }

    #[tokio::test]
    async fn executes_action_into_signed_chained_operation() -> eyre::Result<()> {
        let fx = fixture();
        seed_document(&fx, "doc-1").await;

        let outcome = fx
            .executor
            .execute_job(
                job(
                    "job-1",
                    "doc-1",
                    Scope::Global,
                    action("a-1", "INCREMENT", Scope::Global),
                ),
                None,
            )
            .await;
        assert!(outcome.success, "{:?}", outcome.error);

        let ops = fx
            .store
            .read_all(&"doc-1".into(), &Scope::Global, &Branch::main())
            .await?;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].index, 0);

        // The unsigned action got exactly one signature, from the local
        // signer.
        let signer = ops[0].action.signer().expect("signer context");
        assert_eq!(signer.signatures.len(), 1);
        assert_eq!(signer.app.key, fx.signer_key.public_key_hex());
        strand_crypto::verify_action(&ops[0].action)?;

        // Materialized state advanced with the log.
        let (revision, state) = fx
            .store
            .get_state(&"doc-1".into(), &Scope::Global, &Branch::main())
            .await?
            .expect("state");
        assert_eq!(revision, 1);
        assert_eq!(state["count"], 1);

        Ok(())
    }

    #[tokio::test]
    async fn presigned_action_keeps_foreign_signer() -> eyre::Result<()> {
        let fx = fixture();
        seed_document(&fx, "doc-1").await;

        let foreign = ActionSigner::new(
            SigningKey::generate(&mut rand::thread_rng()),
            "reactor-b",
        );
        let presigned = foreign
            .sign_action(
                action("a-1", "INCREMENT", Scope::Global),
                &Hash::default(),
                None,
                false,
            )
            .await?;

        let outcome = fx
            .executor
            .execute_job(job("job-1", "doc-1", Scope::Global, presigned), None)
            .await;
        assert!(outcome.success, "{:?}", outcome.error);

        let ops = fx
            .store
            .read_all(&"doc-1".into(), &Scope::Global, &Branch::main())
            .await?;
        let signer = ops[0].action.signer().expect("signer context");
        assert_eq!(signer.app.key, foreign.public_key_hex());
        assert_ne!(signer.app.key, fx.signer_key.public_key_hex());

        Ok(())
    }

    #[tokio::test]
    async fn missing_document_fails_without_retry() {
        let fx = fixture();

        let outcome = fx
            .executor
            .execute_job(
                job(
                    "job-1",
                    "ghost",
                    Scope::Global,
                    action("a-1", "INCREMENT", Scope::Global),
                ),
                None,
            )
            .await;

        assert!(!outcome.success);
        assert!(matches!(
            outcome.error,
            Some(ExecutorError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_document_type_is_module_not_found() {
        let fx = fixture();

        let mut create = action("create", CREATE_DOCUMENT, Scope::Document);
        create.input = serde_json::json!({ "documentType": "test/unknown" });

        let outcome = fx
            .executor
            .execute_job(job("job-1", "doc-1", Scope::Document, create), None)
            .await;

        assert!(!outcome.success);
        assert!(matches!(
            outcome.error,
            Some(ExecutorError::ModuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reducer_reported_and_thrown_errors_are_distinct() {
        let fx = fixture();
        seed_document(&fx, "doc-1").await;

        let soft = fx
            .executor
            .execute_job(
                job(
                    "job-soft",
                    "doc-1",
                    Scope::Global,
                    action("a-1", "FAIL_SOFT", Scope::Global),
                ),
                None,
            )
            .await;
        assert!(matches!(
            soft.error,
            Some(ExecutorError::ReducerReported(_))
        ));

        let hard = fx
            .executor
            .execute_job(
                job(
                    "job-hard",
                    "doc-1",
                    Scope::Global,
                    action("a-2", "FAIL_HARD", Scope::Global),
                ),
                None,
            )
            .await;
        assert!(matches!(hard.error, Some(ExecutorError::ReducerFailed(_))));
    }

    #[tokio::test]
    async fn deleted_document_rejects_further_actions() {
        let fx = fixture();
        seed_document(&fx, "doc-1").await;

        let delete = fx
            .executor
            .execute_job(
                job(
                    "job-delete",
                    "doc-1",
                    Scope::Document,
                    action("a-del", "DELETE_DOCUMENT", Scope::Document),
                ),
                None,
            )
            .await;
        assert!(delete.success, "{:?}", delete.error);

        let outcome = fx
            .executor
            .execute_job(
                job(
                    "job-after",
                    "doc-1",
                    Scope::Global,
                    action("a-1", "INCREMENT", Scope::Global),
                ),
                None,
            )
            .await;

        assert!(!outcome.success);
        assert!(matches!(
            outcome.error,
            Some(ExecutorError::DocumentDeleted(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_signal_yields_aborted() {
        let fx = fixture();

        let signal = CancellationToken::new();
        signal.cancel();

        let outcome = fx
            .executor
            .execute_job(
                job(
                    "job-1",
                    "doc-1",
                    Scope::Global,
                    action("a-1", "INCREMENT", Scope::Global),
                ),
                Some(&signal),
            )
            .await;

        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(ExecutorError::Aborted)));
    }

    #[tokio::test]
    async fn duplicate_operation_index_is_filtered() -> eyre::Result<()> {
        let fx = fixture();
        seed_document(&fx, "doc-1").await;

        let committed = action("a-1", "INCREMENT", Scope::Global);
        let op = Operation {
            id: "op-0".to_owned(),
            index: 0,
            skip: 0,
            hash: Operation::chain_hash(&Hash::default(), &committed)
                .map_err(|err| eyre::eyre!(err))?,
            timestamp_utc_ms: 1,
            action: committed,
        };

        let first = fx
            .executor
            .execute_job(
                Job {
                    payload: JobPayload::Operation(op.clone()),
                    ..job("job-1", "doc-1", Scope::Global, action("x", "X", Scope::Global))
                },
                None,
            )
            .await;
        assert!(first.success);

        let second = fx
            .executor
            .execute_job(
                Job {
                    payload: JobPayload::Operation(op),
                    ..job("job-2", "doc-1", Scope::Global, action("x", "X", Scope::Global))
                },
                None,
            )
            .await;

        assert!(!second.success);
        assert!(matches!(
            second.error,
            Some(ExecutorError::Store(StoreError::IndexConflict { .. }))
        ));

        Ok(())
    }
}
