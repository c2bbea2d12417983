use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::{Branch, DocumentId, PartitionKey, Scope};
use crate::operation::{Action, Operation};

/// Identifies one queued unit of work.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// What a job carries: either a proposed action to execute through the
/// reducer, or an already-committed operation arriving from a remote.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum JobPayload {
    Action(Action),
    Operation(Operation),
}

/// A queued unit of work against one (document, scope, branch) partition.
///
/// Created on submission, dequeued FIFO within its partition, destroyed on
/// completion or removal.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub document_id: DocumentId,
    pub scope: Scope,
    pub branch: Branch,
    pub payload: JobPayload,
    pub created_at_utc_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_hint: Option<String>,
}

impl Job {
    #[must_use]
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(
            self.document_id.clone(),
            self.scope.clone(),
            self.branch.clone(),
        )
    }
}
