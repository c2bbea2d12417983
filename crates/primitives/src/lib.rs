//! Core data model for the strand synchronization core.
//!
//! Everything here is plain data: documents, scopes, branches, operations,
//! actions with their signer context, jobs, remote records and cached
//! metadata. The operation log is the single source of truth; materialized
//! state, cached metadata and remote status are all derivable from it.

pub mod document;
pub mod events;
pub mod hash;
pub mod job;
pub mod meta;
pub mod operation;
pub mod remote;
pub mod time;

pub use document::{Branch, DocumentHeader, DocumentId, PartitionKey, Scope};
pub use events::{EventBus, ReactorEvent};
pub use hash::Hash;
pub use job::{Job, JobId, JobPayload};
pub use meta::{CachedDocumentMeta, DocumentMetaState};
pub use operation::{
    Action, ActionContext, ActionSignature, Operation, SignerApp, SignerContext, SignerUser,
};
pub use remote::{
    ChannelConfig, ChannelType, RemoteRecord, RemoteStatus, Strand, SyncFilter, SyncState,
    SyncStatus,
};
