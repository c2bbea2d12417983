//! Channel transports: how strand queries and mutations reach a remote.
//!
//! [`HttpTransport`] speaks JSON request-response over reqwest;
//! [`InProcessTransport`] serves a co-resident reactor's store directly,
//! honoring the same envelope and cursor contract.

use std::sync::Arc;

use async_trait::async_trait;
use strand_primitives::{Branch, PartitionKey, Strand};
use strand_store::{OperationStore, StoreError};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::wire::{
    synced_scopes, OperationResult, StrandMutation, StrandMutationResponse, StrandQuery,
    StrandQueryResponse, SyncCursor,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The remote rejected our credentials. Recoverable by exactly one
    /// refresh-and-retry.
    #[error("unauthorized")]
    Unauthorized,

    #[error("remote returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("credential refresh failed: {0}")]
    Credentials(String),

    #[error("store error behind in-process channel: {0}")]
    Store(String),
}

/// One remote endpoint for strand exchange.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn query_strands(&self, query: &StrandQuery)
        -> Result<StrandQueryResponse, TransportError>;

    async fn push_strands(
        &self,
        mutation: &StrandMutation,
    ) -> Result<StrandMutationResponse, TransportError>;

    /// Re-acquires credentials after an [`TransportError::Unauthorized`].
    async fn refresh_credentials(&self) -> Result<(), TransportError>;
}

/// Supplies and refreshes bearer credentials for a network channel.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current token, if the channel is authenticated at all.
    async fn bearer_token(&self) -> Result<Option<String>, TransportError>;

    async fn refresh(&self) -> Result<(), TransportError>;
}

/// JSON-over-HTTP transport against a remote reactor.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl HttpTransport {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        endpoint: Url,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Self {
        Self {
            client,
            endpoint,
            credentials,
        }
    }

    fn route(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            let _ = path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post<Req, Resp>(&self, segments: &[&str], body: &Req) -> Result<Resp, TransportError>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let mut request = self.client.post(self.route(segments)).json(body);

        if let Some(credentials) = &self.credentials {
            if let Some(token) = credentials.bearer_token().await? {
                request = request.bearer_auth(token);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))
    }
}

#[async_trait]
impl ChannelTransport for HttpTransport {
    async fn query_strands(
        &self,
        query: &StrandQuery,
    ) -> Result<StrandQueryResponse, TransportError> {
        self.post(&["strands", "query"], query).await
    }

    async fn push_strands(
        &self,
        mutation: &StrandMutation,
    ) -> Result<StrandMutationResponse, TransportError> {
        self.post(&["strands", "push"], mutation).await
    }

    async fn refresh_credentials(&self) -> Result<(), TransportError> {
        match &self.credentials {
            Some(credentials) => credentials.refresh().await,
            None => Err(TransportError::Credentials(
                "channel has no credential provider".to_owned(),
            )),
        }
    }
}

/// A co-resident reactor reachable without a network hop. Backed by that
/// reactor's operation store; the cursor contract is identical to the
/// network channel's.
pub struct InProcessTransport {
    store: Arc<dyn OperationStore>,
}

impl InProcessTransport {
    #[must_use]
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChannelTransport for InProcessTransport {
    async fn query_strands(
        &self,
        query: &StrandQuery,
    ) -> Result<StrandQueryResponse, TransportError> {
        let mut cursor = SyncCursor::parse(query.cursor.as_deref());
        let mut strands = Vec::new();
        let mut budget = query.limit;

        let documents = self.store.list_documents().await.map_err(store_err)?;

        'outer: for document_id in documents {
            // A document can hold operations before its header lands.
            let branches = match self.store.get_header(&document_id).await {
                Ok(header) => header.branches,
                Err(StoreError::DocumentNotFound(_)) => vec![Branch::main()],
                Err(err) => return Err(store_err(err)),
            };

            for scope in synced_scopes() {
                for branch in &branches {
                    if budget == 0 {
                        break 'outer;
                    }
                    if !query.filter.matches(&document_id, &scope, branch) {
                        continue;
                    }

                    let partition =
                        PartitionKey::new(document_id.clone(), scope.clone(), branch.clone());
                    let start = cursor.next_index(&partition);
                    let head = self
                        .store
                        .operation_count(&document_id, &scope, branch)
                        .await
                        .map_err(store_err)?;
                    if head <= start {
                        continue;
                    }

                    let end = head.min(start + budget as u64);
                    let operations = self
                        .store
                        .read_range(&document_id, &scope, branch, start, end)
                        .await
                        .map_err(store_err)?;

                    budget -= operations.len();
                    cursor.advance(&partition, end);
                    strands.push(Strand {
                        document_id: document_id.clone(),
                        scope: scope.clone(),
                        branch: branch.clone(),
                        origin: None,
                        operations,
                    });
                }
            }
        }

        debug!(strands = strands.len(), "In-process query served");

        Ok(StrandQueryResponse {
            strands,
            cursor: Some(cursor.encode()),
        })
    }

    async fn push_strands(
        &self,
        mutation: &StrandMutation,
    ) -> Result<StrandMutationResponse, TransportError> {
        let mut results = Vec::new();

        for strand in &mutation.strands {
            for operation in &strand.operations {
                let index = operation.index;
                let appended = self
                    .store
                    .append_operations(
                        &strand.document_id,
                        &strand.scope,
                        &strand.branch,
                        vec![operation.clone()],
                    )
                    .await;

                let result = match appended {
                    // Occupied index: the canonical operation is already
                    // here. An at-least-once redelivery, acked as applied.
                    Ok(()) | Err(StoreError::IndexConflict { .. }) => OperationResult {
                        index,
                        success: true,
                        error: None,
                    },
                    // A gap (IndexGap included) was not applied; acking it
                    // would advance the sender's cursor past a lost range.
                    Err(err) => OperationResult {
                        index,
                        success: false,
                        error: Some(err.to_string()),
                    },
                };

                results.push(result);
            }
        }

        Ok(StrandMutationResponse { results })
    }

    async fn refresh_credentials(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn store_err(err: StoreError) -> TransportError {
    TransportError::Store(err.to_string())
}

#[cfg(test)]
mod tests {
    use strand_primitives::{Action, DocumentId, Hash, Operation, Scope};
    use strand_store::MemoryStore;

    use super::*;

    fn op(index: u64) -> Operation {
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
            hash: Operation::chain_hash(&Hash::default(), &action).expect("hashable"),
            timestamp_utc_ms: 1_000 + index,
            action,
        }
    }

    fn strand(doc: &str, operations: Vec<Operation>) -> Strand {
        Strand {
            document_id: doc.into(),
            scope: Scope::Global,
            branch: Branch::main(),
            origin: None,
            operations,
        }
    }

    #[tokio::test]
    async fn gap_push_is_rejected_not_acked() -> eyre::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let transport = InProcessTransport::new(Arc::clone(&store) as Arc<dyn OperationStore>);
        let doc: DocumentId = "doc-1".into();

        // Index 5 into an empty log: nothing is applied, so the sender
        // must not see success and advance its cursor past the hole.
        let mutation = StrandMutation {
            strands: vec![strand("doc-1", vec![op(5)])],
        };
        let response = transport.push_strands(&mutation).await?;

        assert_eq!(response.results.len(), 1);
        assert!(!response.results[0].success);
        assert_eq!(response.results[0].index, 5);
        assert_eq!(
            store
                .operation_count(&doc, &Scope::Global, &Branch::main())
                .await?,
            0
        );

        Ok(())
    }

    #[tokio::test]
    async fn duplicate_push_is_acked_as_applied() -> eyre::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let transport = InProcessTransport::new(Arc::clone(&store) as Arc<dyn OperationStore>);
        let doc: DocumentId = "doc-1".into();

        store
            .append_operations(&doc, &Scope::Global, &Branch::main(), vec![op(0)])
            .await?;

        // At-least-once redelivery of an occupied index is routine.
        let mutation = StrandMutation {
            strands: vec![strand("doc-1", vec![op(0)])],
        };
        let response = transport.push_strands(&mutation).await?;

        assert!(response.results[0].success);
        assert_eq!(
            store
                .operation_count(&doc, &Scope::Global, &Branch::main())
                .await?,
            1
        );

        Ok(())
    }
}
