//! Document metadata cache.
//!
//! Gives the job executor cheap access to document-scope metadata (head
//! revision, deletion flag, document type) that usually lives in a
//! different scope than the one a job mutates, without replaying the full
//! log per job. Entries are rebuilt from the operation log on miss and
//! evicted LRU past a configured bound; the log stays the source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use strand_primitives::{Branch, CachedDocumentMeta, DocumentId, DocumentMetaState, Operation, Scope};
use strand_store::{OperationStore, StoreError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default bound on cached entries.
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Action kinds the metadata fold understands.
const CREATE_DOCUMENT: &str = "CREATE_DOCUMENT";
const UPGRADE_DOCUMENT: &str = "UPGRADE_DOCUMENT";
const DELETE_DOCUMENT: &str = "DELETE_DOCUMENT";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// The document scope has no CREATE_DOCUMENT operation.
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    /// The caller's cancellation token tripped. Never conflated with
    /// failure.
    #[error("operation aborted")]
    Aborted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug)]
struct Entry {
    meta: Arc<CachedDocumentMeta>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Lru {
    entries: HashMap<(DocumentId, Branch), Entry>,
    tick: u64,
}

impl Lru {
    fn touch(&mut self, key: &(DocumentId, Branch)) -> Option<Arc<CachedDocumentMeta>> {
        self.tick += 1;
        let tick = self.tick;

        self.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            Arc::clone(&entry.meta)
        })
    }

    fn insert(&mut self, key: (DocumentId, Branch), meta: Arc<CachedDocumentMeta>, bound: usize) {
        self.tick += 1;
        let last_used = self.tick;

        let _previous = self.entries.insert(key, Entry { meta, last_used });

        while self.entries.len() > bound {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };

            debug!(document_id = %oldest.0, branch = %oldest.1, "Evicting LRU cache entry");
            let _evicted = self.entries.remove(&oldest);
        }
    }
}

/// LRU-bounded cache over document-scope metadata.
///
/// LRU bookkeeping is private; all mutation goes through this API.
pub struct DocumentMetaCache {
    store: Arc<dyn OperationStore>,
    lru: Mutex<Lru>,
    max_entries: usize,
}

impl DocumentMetaCache {
    #[must_use]
    pub fn new(store: Arc<dyn OperationStore>, max_entries: usize) -> Self {
        Self {
            store,
            lru: Mutex::new(Lru::default()),
            max_entries: max_entries.max(1),
        }
    }

    /// Cache hit returns the identical cached entry; miss folds the
    /// document scope's log into a fresh one, caches and returns it.
    ///
    /// # Errors
    ///
    /// [`CacheError::DocumentNotFound`] absent a CREATE_DOCUMENT operation;
    /// [`CacheError::Aborted`] if `signal` is cancelled before or during
    /// the rebuild.
    pub async fn get_document_meta(
        &self,
        document_id: &DocumentId,
        branch: &Branch,
        signal: Option<&CancellationToken>,
    ) -> CacheResult<Arc<CachedDocumentMeta>> {
        check_signal(signal)?;

        let key = (document_id.clone(), branch.clone());

        if let Some(meta) = self.lru.lock().touch(&key) {
            return Ok(meta);
        }

        let operations = self
            .store
            .read_all(document_id, &Scope::Document, branch)
            .await?;

        check_signal(signal)?;

        let meta = fold_meta(document_id, &operations, None)?;
        let meta = Arc::new(meta);

        self.lru
            .lock()
            .insert(key, Arc::clone(&meta), self.max_entries);

        Ok(meta)
    }

    /// Recomputes metadata as of `target_revision`, never consulting or
    /// touching the cache. Needed when operations must be inserted
    /// retroactively and prior metadata must be known exactly.
    pub async fn rebuild_at_revision(
        &self,
        document_id: &DocumentId,
        branch: &Branch,
        target_revision: u64,
        signal: Option<&CancellationToken>,
    ) -> CacheResult<CachedDocumentMeta> {
        check_signal(signal)?;

        let operations = self
            .store
            .read_range(document_id, &Scope::Document, branch, 0, target_revision)
            .await?;

        check_signal(signal)?;

        fold_meta(document_id, &operations, Some(target_revision))
    }

    /// Explicitly installs an entry, e.g. right after committing a
    /// document-scope operation whose effect is already known.
    pub fn put_document_meta(
        &self,
        document_id: &DocumentId,
        branch: &Branch,
        meta: CachedDocumentMeta,
    ) {
        self.lru.lock().insert(
            (document_id.clone(), branch.clone()),
            Arc::new(meta),
            self.max_entries,
        );
    }

    /// Drops cached entries for a document: one branch, or all branches
    /// when `branch` is `None`. Called on document-scope writes.
    pub fn invalidate(&self, document_id: &DocumentId, branch: Option<&Branch>) {
        let mut lru = self.lru.lock();

        match branch {
            Some(branch) => {
                let _evicted = lru
                    .entries
                    .remove(&(document_id.clone(), branch.clone()));
            }
            None => lru.entries.retain(|(doc, _), _| doc != document_id),
        }
    }

    pub fn clear(&self) {
        self.lru.lock().entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lru.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lru.lock().entries.is_empty()
    }
}

fn check_signal(signal: Option<&CancellationToken>) -> CacheResult<()> {
    if signal.is_some_and(CancellationToken::is_cancelled) {
        return Err(CacheError::Aborted);
    }
    Ok(())
}

/// Folds CREATE_DOCUMENT / UPGRADE_DOCUMENT / DELETE_DOCUMENT operations
/// into metadata. `up_to` limits the fold to operations below that index.
fn fold_meta(
    document_id: &DocumentId,
    operations: &[Operation],
    up_to: Option<u64>,
) -> CacheResult<CachedDocumentMeta> {
    let mut state: Option<DocumentMetaState> = None;
    let mut document_type = String::new();
    let mut folded_revision = 0;

    for op in operations {
        if up_to.is_some_and(|limit| op.index >= limit) {
            break;
        }

        folded_revision = op.index + 1;

        match op.action.kind.as_str() {
            CREATE_DOCUMENT => {
                document_type = op
                    .action
                    .input
                    .get("documentType")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_owned();

                state = Some(DocumentMetaState {
                    revision: folded_revision,
                    hash: op.hash,
                    is_deleted: false,
                    created_at_utc_ms: op.timestamp_utc_ms,
                    last_modified_utc_ms: op.timestamp_utc_ms,
                });
            }
            UPGRADE_DOCUMENT => {
                if let Some(state) = state.as_mut() {
                    if let Some(new_type) = op
                        .action
                        .input
                        .get("documentType")
                        .and_then(|v| v.as_str())
                    {
                        document_type = new_type.to_owned();
                    }
                    state.revision = folded_revision;
                    state.hash = op.hash;
                    state.last_modified_utc_ms = op.timestamp_utc_ms;
                }
            }
            DELETE_DOCUMENT => {
                if let Some(state) = state.as_mut() {
                    state.is_deleted = true;
                    state.revision = folded_revision;
                    state.hash = op.hash;
                    state.last_modified_utc_ms = op.timestamp_utc_ms;
                }
            }
            // Other document-scope operations advance the revision without
            // changing the folded metadata fields.
            _ => {
                if let Some(state) = state.as_mut() {
                    state.revision = folded_revision;
                    state.hash = op.hash;
                    state.last_modified_utc_ms = op.timestamp_utc_ms;
                }
            }
        }
    }

    let state = state.ok_or_else(|| CacheError::DocumentNotFound(document_id.clone()))?;

    Ok(CachedDocumentMeta {
        document_scope_revision: folded_revision,
        state,
        document_type,
    })
}
