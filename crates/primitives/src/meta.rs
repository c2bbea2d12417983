use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// Document-scope metadata folded out of the operation log.
///
/// Derivable state: safe to drop and rebuild from the log at any time.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetaState {
    /// Head revision of the document scope at the time this was built.
    pub revision: u64,
    /// Hash of the last document-scope operation folded in.
    pub hash: Hash,
    pub is_deleted: bool,
    pub created_at_utc_ms: u64,
    pub last_modified_utc_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedDocumentMeta {
    pub state: DocumentMetaState,
    pub document_type: String,
    /// Revision of the document scope the state was folded up to.
    pub document_scope_revision: u64,
}
