//! Storage interfaces for the sync core.
//!
//! The core never talks to a database directly; it goes through two
//! async traits so real backends and the in-memory test double are
//! interchangeable (dependency injection, no ambient globals):
//!
//! - [`OperationStore`]: append-only operation logs plus document headers
//!   and materialized state.
//! - [`CursorStore`]: remote records and per-remote sync cursors.
//!
//! Persistence mechanics are a backend concern and out of scope here.

use std::collections::BTreeMap;

use async_trait::async_trait;
use strand_primitives::{Branch, DocumentHeader, DocumentId, Operation, RemoteRecord, Scope};
use thiserror::Error;

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    /// An operation arrived for an index that already holds a canonical
    /// operation. Duplicates are filtered deterministically by index.
    #[error("operation index conflict at {document_id}/{scope}/{branch} index {index}")]
    IndexConflict {
        document_id: DocumentId,
        scope: Scope,
        branch: Branch,
        index: u64,
    },

    /// An operation arrived ahead of the log head, which would leave a
    /// hole. Never benign: accepting it would lose the missing range.
    #[error("operation index gap at {document_id}/{scope}/{branch}: index {index}, head {head}")]
    IndexGap {
        document_id: DocumentId,
        scope: Scope,
        branch: Branch,
        index: u64,
        head: u64,
    },

    #[error("storage i/o error: {0}")]
    Io(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Append-only operation log storage.
///
/// The log is the single source of truth; materialized state stored through
/// [`OperationStore::put_state`] is a rebuildable cache.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Appends operations to a scope's log. Each operation's `index` must
    /// equal the log head at the time of the append; an occupied index
    /// yields [`StoreError::IndexConflict`], an index past the head yields
    /// [`StoreError::IndexGap`], and in both cases nothing is written.
    async fn append_operations(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
        operations: Vec<Operation>,
    ) -> StoreResult<()>;

    /// Reads `[start, end)` of a scope's log.
    async fn read_range(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
        start: u64,
        end: u64,
    ) -> StoreResult<Vec<Operation>>;

    /// Reads the whole log for a scope.
    async fn read_all(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
    ) -> StoreResult<Vec<Operation>>;

    /// Head revision of a scope's log (number of committed operations).
    async fn operation_count(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
    ) -> StoreResult<u64>;

    async fn get_header(&self, document_id: &DocumentId) -> StoreResult<DocumentHeader>;

    async fn put_header(&self, header: DocumentHeader) -> StoreResult<()>;

    /// Writes the materialized state for a scope at the given revision.
    async fn put_state(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
        revision: u64,
        state: serde_json::Value,
    ) -> StoreResult<()>;

    /// Reads the materialized state for a scope, if any was written.
    async fn get_state(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
    ) -> StoreResult<Option<(u64, serde_json::Value)>>;

    async fn list_documents(&self) -> StoreResult<Vec<DocumentId>>;
}

/// Sync-progress storage: remote records and cursors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_remote(&self, name: &str) -> StoreResult<RemoteRecord>;

    /// Creates or replaces a remote record. Idempotent.
    async fn put_remote(&self, record: RemoteRecord) -> StoreResult<()>;

    async fn delete_remote(&self, name: &str) -> StoreResult<()>;

    async fn list_remotes(&self) -> StoreResult<Vec<RemoteRecord>>;

    /// Last acknowledged cursor for a remote, if any sync completed.
    async fn get_cursor(&self, remote: &str) -> StoreResult<Option<String>>;

    async fn set_cursor(&self, remote: &str, cursor: String) -> StoreResult<()>;
}

/// Composite key for one scope's log inside the in-memory store.
pub(crate) type LogKey = (DocumentId, String, String);

pub(crate) fn log_key(document_id: &DocumentId, scope: &Scope, branch: &Branch) -> LogKey {
    (
        document_id.clone(),
        scope.as_str().to_owned(),
        branch.as_str().to_owned(),
    )
}

pub(crate) type LogMap = BTreeMap<LogKey, Vec<Operation>>;
