//! Wire contract between reactors.
//!
//! Sync is request-response: a query pulls strands since a cursor, a
//! mutation pushes strands and gets per-operation results back. Cursors are
//! opaque to the peer; this implementation encodes them as a JSON map from
//! partition key to next unread index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strand_primitives::{PartitionKey, Scope, Strand, SyncFilter};

/// Scopes that cross the wire. The local scope never leaves its reactor.
#[must_use]
pub fn synced_scopes() -> [Scope; 2] {
    [Scope::Document, Scope::Global]
}

/// Pulls strands the remote has accumulated since `cursor`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrandQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default)]
    pub filter: SyncFilter,
    pub limit: usize,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrandQueryResponse {
    pub strands: Vec<Strand>,
    /// Resume position for the next query; echo it back verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrandMutation {
    pub strands: Vec<Strand>,
}

/// One entry per pushed operation, in push order.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub index: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrandMutationResponse {
    pub results: Vec<OperationResult>,
}

impl StrandMutationResponse {
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    #[must_use]
    pub fn rejected(&self) -> usize {
        self.results.len() - self.accepted()
    }
}

/// Next unread index per partition. Serialized form is what travels as the
/// opaque cursor string.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SyncCursor(BTreeMap<String, u64>);

impl SyncCursor {
    /// Decodes a cursor string. A missing or undecodable cursor means
    /// "from the beginning".
    #[must_use]
    pub fn parse(encoded: Option<&str>) -> Self {
        encoded
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_owned())
    }

    #[must_use]
    pub fn next_index(&self, partition: &PartitionKey) -> u64 {
        self.0.get(&partition.to_string()).copied().unwrap_or(0)
    }

    pub fn advance(&mut self, partition: &PartitionKey, next_index: u64) {
        let entry = self.0.entry(partition.to_string()).or_insert(0);
        *entry = (*entry).max(next_index);
    }
}
