use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::{Branch, DocumentId, Scope};
use crate::operation::Operation;

/// A contiguous run of operations for one (document, scope, branch),
/// exchanged between reactors.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Strand {
    pub document_id: DocumentId,
    pub scope: Scope,
    pub branch: Branch,
    /// Name of the remote this strand was first received from, if any.
    /// Used for loop prevention when pushing back out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub operations: Vec<Operation>,
}

/// Allow-list restricting which strands a remote exchanges.
/// An empty list means "all".
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFilter {
    #[serde(default)]
    pub document_ids: Vec<DocumentId>,
    #[serde(default)]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub branches: Vec<Branch>,
}

impl SyncFilter {
    /// True if the filter admits the given strand coordinates.
    #[must_use]
    pub fn matches(&self, document_id: &DocumentId, scope: &Scope, branch: &Branch) -> bool {
        let doc_ok = self.document_ids.is_empty() || self.document_ids.contains(document_id);
        let scope_ok = self.scopes.is_empty() || self.scopes.contains(scope);
        let branch_ok = self.branches.is_empty() || self.branches.contains(branch);

        doc_ok && scope_ok && branch_ok
    }
}

/// How a channel to a remote is constructed.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelType {
    /// Fixed-interval query/mutation polling over the network.
    Network,
    /// Co-resident reactor sharing the same envelope and cursor contract.
    InProcess,
}

/// State of one direction (push or pull) of a remote.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    #[default]
    Idle,
    Running,
    Error,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_utc_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_utc_ms: Option<u64>,
    pub failure_count: u32,
}

impl SyncStatus {
    pub fn on_success(&mut self, now_utc_ms: u64) {
        self.state = SyncState::Idle;
        self.last_success_utc_ms = Some(now_utc_ms);
        self.failure_count = 0;
    }

    pub fn on_failure(&mut self, now_utc_ms: u64) {
        self.last_failure_utc_ms = Some(now_utc_ms);
        self.failure_count += 1;
    }
}

/// Push and pull run independent state machines.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub push: SyncStatus,
    pub pull: SyncStatus,
}

/// A registered remote: created on registration, mutated after every
/// push/pull attempt, removed on unregister.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub name: String,
    pub collection_id: String,
    pub channel_config: ChannelConfig,
    #[serde(default)]
    pub filter: SyncFilter,
    #[serde(default)]
    pub status: RemoteStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SyncFilter::default();

        assert!(filter.matches(&"doc-1".into(), &Scope::Global, &Branch::main()));
        assert!(filter.matches(&"doc-2".into(), &Scope::Document, &"feature".into()));
    }

    #[test]
    fn filter_restricts_each_axis() {
        let filter = SyncFilter {
            document_ids: vec!["doc-1".into()],
            scopes: vec![Scope::Global],
            branches: vec![],
        };

        assert!(filter.matches(&"doc-1".into(), &Scope::Global, &Branch::main()));
        assert!(!filter.matches(&"doc-2".into(), &Scope::Global, &Branch::main()));
        assert!(!filter.matches(&"doc-1".into(), &Scope::Local, &Branch::main()));
    }

    #[test]
    fn status_transitions_track_counts() {
        let mut status = SyncStatus::default();
        assert_eq!(status.state, SyncState::Idle);

        status.on_failure(10);
        status.on_failure(20);
        assert_eq!(status.failure_count, 2);
        assert_eq!(status.last_failure_utc_ms, Some(20));

        status.on_success(30);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.last_success_utc_ms, Some(30));
    }
}
