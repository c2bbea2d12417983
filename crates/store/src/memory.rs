//! In-memory store used by tests and by in-process channels between
//! co-resident reactors.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use strand_primitives::{Branch, DocumentHeader, DocumentId, Operation, RemoteRecord, Scope};

use crate::{log_key, CursorStore, LogMap, OperationStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct Inner {
    logs: LogMap,
    headers: BTreeMap<DocumentId, DocumentHeader>,
    states: BTreeMap<crate::LogKey, (u64, serde_json::Value)>,
    remotes: BTreeMap<String, RemoteRecord>,
    cursors: BTreeMap<String, String>,
}

/// Thread-safe in-memory implementation of both storage traits.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn append_operations(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
        operations: Vec<Operation>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let log = inner.logs.entry(log_key(document_id, scope, branch)).or_default();

        // Validate the whole batch before mutating anything.
        let head = log.len() as u64;
        for (offset, op) in operations.iter().enumerate() {
            let expected = head + offset as u64;
            if op.index < expected {
                return Err(StoreError::IndexConflict {
                    document_id: document_id.clone(),
                    scope: scope.clone(),
                    branch: branch.clone(),
                    index: op.index,
                });
            }
            if op.index > expected {
                return Err(StoreError::IndexGap {
                    document_id: document_id.clone(),
                    scope: scope.clone(),
                    branch: branch.clone(),
                    index: op.index,
                    head: expected,
                });
            }
        }

        log.extend(operations);
        Ok(())
    }

    async fn read_range(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
        start: u64,
        end: u64,
    ) -> StoreResult<Vec<Operation>> {
        let inner = self.inner.read();
        let Some(log) = inner.logs.get(&log_key(document_id, scope, branch)) else {
            return Ok(Vec::new());
        };

        let start = (start as usize).min(log.len());
        let end = (end as usize).min(log.len());

        Ok(log[start..end.max(start)].to_vec())
    }

    async fn read_all(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
    ) -> StoreResult<Vec<Operation>> {
        let inner = self.inner.read();

        Ok(inner
            .logs
            .get(&log_key(document_id, scope, branch))
            .cloned()
            .unwrap_or_default())
    }

    async fn operation_count(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
    ) -> StoreResult<u64> {
        let inner = self.inner.read();

        Ok(inner
            .logs
            .get(&log_key(document_id, scope, branch))
            .map_or(0, |log| log.len() as u64))
    }

    async fn get_header(&self, document_id: &DocumentId) -> StoreResult<DocumentHeader> {
        let inner = self.inner.read();

        inner
            .headers
            .get(document_id)
            .cloned()
            .ok_or_else(|| StoreError::DocumentNotFound(document_id.clone()))
    }

    async fn put_header(&self, header: DocumentHeader) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let _previous = inner.headers.insert(header.document_id.clone(), header);
        Ok(())
    }

    async fn put_state(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
        revision: u64,
        state: serde_json::Value,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let _previous = inner
            .states
            .insert(log_key(document_id, scope, branch), (revision, state));
        Ok(())
    }

    async fn get_state(
        &self,
        document_id: &DocumentId,
        scope: &Scope,
        branch: &Branch,
    ) -> StoreResult<Option<(u64, serde_json::Value)>> {
        let inner = self.inner.read();

        Ok(inner.states.get(&log_key(document_id, scope, branch)).cloned())
    }

    async fn list_documents(&self) -> StoreResult<Vec<DocumentId>> {
        let inner = self.inner.read();

        Ok(inner.headers.keys().cloned().collect())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get_remote(&self, name: &str) -> StoreResult<RemoteRecord> {
        let inner = self.inner.read();

        inner
            .remotes
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::RemoteNotFound(name.to_owned()))
    }

    async fn put_remote(&self, record: RemoteRecord) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let _previous = inner.remotes.insert(record.name.clone(), record);
        Ok(())
    }

    async fn delete_remote(&self, name: &str) -> StoreResult<()> {
        let mut inner = self.inner.write();

        if inner.remotes.remove(name).is_none() {
            return Err(StoreError::RemoteNotFound(name.to_owned()));
        }

        let _cursor = inner.cursors.remove(name);
        Ok(())
    }

    async fn list_remotes(&self) -> StoreResult<Vec<RemoteRecord>> {
        let inner = self.inner.read();

        Ok(inner.remotes.values().cloned().collect())
    }

    async fn get_cursor(&self, remote: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.read();

        Ok(inner.cursors.get(remote).cloned())
    }

    async fn set_cursor(&self, remote: &str, cursor: String) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let _previous = inner.cursors.insert(remote.to_owned(), cursor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use strand_primitives::{Action, ChannelConfig, ChannelType, Hash};

    use super::*;

    fn op(index: u64, prev: &Hash) -> Operation {
        let action = Action {
            id: format!("action-{index}"),
            kind: "SET_VALUE".to_owned(),
            scope: Scope::Global,
            timestamp_utc_ms: 1_000 + index,
            input: serde_json::json!({ "value": index }),
            context: None,
        };

        Operation {
            id: format!("op-{index}"),
            index,
            skip: 0,
            hash: Operation::chain_hash(prev, &action).expect("hashable"),
            timestamp_utc_ms: 1_000 + index,
            action,
        }
    }

    #[tokio::test]
    async fn append_and_read_back() -> eyre::Result<()> {
        let store = MemoryStore::new();
        let doc: DocumentId = "doc-1".into();

        let genesis = Hash::default();
        let first = op(0, &genesis);
        let second = op(1, &first.hash);

        store
            .append_operations(&doc, &Scope::Global, &Branch::main(), vec![first, second])
            .await?;

        assert_eq!(
            store
                .operation_count(&doc, &Scope::Global, &Branch::main())
                .await?,
            2
        );

        let range = store
            .read_range(&doc, &Scope::Global, &Branch::main(), 1, 10)
            .await?;
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].index, 1);

        Ok(())
    }

    #[tokio::test]
    async fn occupied_index_is_a_conflict() -> eyre::Result<()> {
        let store = MemoryStore::new();
        let doc: DocumentId = "doc-1".into();
        let genesis = Hash::default();

        store
            .append_operations(&doc, &Scope::Global, &Branch::main(), vec![op(0, &genesis)])
            .await?;

        let result = store
            .append_operations(&doc, &Scope::Global, &Branch::main(), vec![op(0, &genesis)])
            .await;

        assert!(matches!(
            result,
            Err(StoreError::IndexConflict { index: 0, .. })
        ));

        // The failed batch wrote nothing.
        assert_eq!(
            store
                .operation_count(&doc, &Scope::Global, &Branch::main())
                .await?,
            1
        );

        Ok(())
    }

    #[tokio::test]
    async fn index_past_the_head_is_a_gap() -> eyre::Result<()> {
        let store = MemoryStore::new();
        let doc: DocumentId = "doc-1".into();

        let result = store
            .append_operations(
                &doc,
                &Scope::Global,
                &Branch::main(),
                vec![op(5, &Hash::default())],
            )
            .await;

        assert!(matches!(
            result,
            Err(StoreError::IndexGap {
                index: 5,
                head: 0,
                ..
            })
        ));
        assert_eq!(
            store
                .operation_count(&doc, &Scope::Global, &Branch::main())
                .await?,
            0
        );

        Ok(())
    }

    #[tokio::test]
    async fn remote_crud_and_cursor() -> eyre::Result<()> {
        let store = MemoryStore::new();

        let record = RemoteRecord {
            name: "origin".to_owned(),
            collection_id: "collection-1".to_owned(),
            channel_config: ChannelConfig {
                channel_type: ChannelType::InProcess,
                parameters: Default::default(),
            },
            filter: Default::default(),
            status: Default::default(),
        };

        store.put_remote(record).await?;
        assert_eq!(store.list_remotes().await?.len(), 1);

        store.set_cursor("origin", "7".to_owned()).await?;
        assert_eq!(store.get_cursor("origin").await?.as_deref(), Some("7"));

        store.delete_remote("origin").await?;
        assert!(matches!(
            store.get_remote("origin").await,
            Err(StoreError::RemoteNotFound(_))
        ));
        // Cursor goes with the remote.
        assert_eq!(store.get_cursor("origin").await?, None);

        Ok(())
    }
}
