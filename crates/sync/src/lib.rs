//! Remote synchronization: channels, the sync engine, the awaiter and the
//! transmitter.
//!
//! A remote is another reactor reachable through a channel. Each registered
//! remote gets its own polling channel; push and pull run independent state
//! machines (`Idle → Running → Idle | Error`) whose status survives in the
//! cursor store, so an interrupted sync resumes where it stopped. Delivery
//! is at-least-once; the operation index filters duplicates
//! deterministically on the receiving side.

use strand_store::StoreError;
use thiserror::Error;

pub mod awaiter;
pub mod channel;
pub mod config;
pub mod engine;
pub mod transmitter;
pub mod transport;
pub mod wire;

pub use awaiter::{SyncAwaiter, SyncOutcome};
pub use channel::{ChannelFactory, ChannelTick, PollingChannel};
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use transmitter::{TransmitReport, Transmitter};
pub use transport::{
    ChannelTransport, CredentialProvider, HttpTransport, InProcessTransport, TransportError,
};
pub use wire::{
    OperationResult, StrandMutation, StrandMutationResponse, StrandQuery, StrandQueryResponse,
    SyncCursor,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    #[error("invalid channel config: {0}")]
    InvalidChannelConfig(String),

    /// Some operations were rejected by the remote; the counts live in the
    /// sync events.
    #[error("remote rejected {rejected} of {total} operations")]
    PartialRejection { rejected: usize, total: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The awaiter or engine was shut down while work was pending.
    #[error("sync shut down")]
    ShutDown,
}
