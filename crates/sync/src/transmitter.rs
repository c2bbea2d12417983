//! Outbound delivery of strands to one remote.
//!
//! Batches operations up to a fixed limit per mutation, skips strands that
//! originated from the remote being notified (loop prevention), and on an
//! unauthorized response refreshes credentials exactly once and retries
//! exactly once.

use std::sync::Arc;

use strand_primitives::Strand;
use tracing::{debug, warn};

use crate::transport::{ChannelTransport, TransportError};
use crate::wire::{StrandMutation, StrandMutationResponse};
use crate::SyncError;

/// What a transmit attempt did, per operation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransmitReport {
    pub accepted: usize,
    pub rejected: usize,
    /// Operations never sent because their strand originated from the
    /// target remote.
    pub skipped: usize,
}

/// Pushes strands to one remote through its transport.
pub struct Transmitter {
    transport: Arc<dyn ChannelTransport>,
    batch_limit: usize,
}

impl Transmitter {
    #[must_use]
    pub fn new(transport: Arc<dyn ChannelTransport>, batch_limit: usize) -> Self {
        Self {
            transport,
            batch_limit: batch_limit.max(1),
        }
    }

    /// Delivers `strands` to `target`. Partial rejection is reported, not
    /// an error; transport failures are.
    pub async fn transmit(
        &self,
        target: &str,
        strands: Vec<Strand>,
    ) -> Result<TransmitReport, SyncError> {
        let mut report = TransmitReport::default();

        // Never echo a strand back to where it came from.
        let (outbound, looped): (Vec<_>, Vec<_>) = strands
            .into_iter()
            .partition(|strand| strand.origin.as_deref() != Some(target));

        report.skipped = looped.iter().map(|s| s.operations.len()).sum();
        if report.skipped > 0 {
            debug!(remote = target, skipped = report.skipped, "Loop-prevented strands dropped");
        }

        for batch in batches(outbound, self.batch_limit) {
            let response = self.push_with_auth_retry(target, &batch).await?;

            report.accepted += response.accepted();
            report.rejected += response.rejected();
        }

        Ok(report)
    }

    /// One push; on Unauthorized, one credential refresh and one retry.
    async fn push_with_auth_retry(
        &self,
        target: &str,
        mutation: &StrandMutation,
    ) -> Result<StrandMutationResponse, SyncError> {
        match self.transport.push_strands(mutation).await {
            Ok(response) => Ok(response),
            Err(TransportError::Unauthorized) => {
                warn!(remote = target, "Unauthorized, refreshing credentials");
                self.transport.refresh_credentials().await?;

                Ok(self.transport.push_strands(mutation).await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Splits strands into mutations of at most `limit` operations, cutting
/// within strands where needed.
fn batches(strands: Vec<Strand>, limit: usize) -> Vec<StrandMutation> {
    let mut mutations = Vec::new();
    let mut current: Vec<Strand> = Vec::new();
    let mut room = limit;

    for strand in strands {
        let mut operations = strand.operations;

        while !operations.is_empty() {
            if room == 0 {
                mutations.push(StrandMutation {
                    strands: std::mem::take(&mut current),
                });
                room = limit;
            }

            let take = operations.len().min(room);
            let rest = operations.split_off(take);

            current.push(Strand {
                document_id: strand.document_id.clone(),
                scope: strand.scope.clone(),
                branch: strand.branch.clone(),
                origin: strand.origin.clone(),
                operations: std::mem::replace(&mut operations, rest),
            });
            room -= take;
        }
    }

    if !current.is_empty() {
        mutations.push(StrandMutation { strands: current });
    }

    mutations
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use strand_primitives::{Action, Branch, Hash, Operation, Scope};

    use crate::wire::{OperationResult, StrandMutationResponse, StrandQuery, StrandQueryResponse};

    use super::*;

    fn op(index: u64) -> Operation {
        let action = Action {
            id: format!("action-{index}"),
            kind: "SET_VALUE".to_owned(),
            scope: Scope::Global,
            timestamp_utc_ms: index,
            input: serde_json::json!({ "value": index }),
            context: None,
        };

        Operation {
            id: format!("op-{index}"),
            index,
            skip: 0,
            hash: Operation::chain_hash(&Hash::default(), &action).expect("hashable"),
            timestamp_utc_ms: index,
            action,
        }
    }

    fn strand(doc: &str, origin: Option<&str>, count: u64) -> Strand {
        Strand {
            document_id: doc.into(),
            scope: Scope::Global,
            branch: Branch::main(),
            origin: origin.map(str::to_owned),
            operations: (0..count).map(op).collect(),
        }
    }

    /// Accepts everything; counts pushes and can demand one auth refresh.
    struct RecordingTransport {
        pushes: AtomicU32,
        refreshes: AtomicU32,
        unauthorized_until_refresh: bool,
    }

    impl RecordingTransport {
        fn accepting() -> Self {
            Self {
                pushes: AtomicU32::new(0),
                refreshes: AtomicU32::new(0),
                unauthorized_until_refresh: false,
            }
        }

        fn unauthorized_first() -> Self {
            Self {
                unauthorized_until_refresh: true,
                ..Self::accepting()
            }
        }
    }

    #[async_trait]
    impl ChannelTransport for RecordingTransport {
        async fn query_strands(
            &self,
            _query: &StrandQuery,
        ) -> Result<StrandQueryResponse, TransportError> {
            Ok(StrandQueryResponse::default())
        }

        async fn push_strands(
            &self,
            mutation: &StrandMutation,
        ) -> Result<StrandMutationResponse, TransportError> {
            let _count = self.pushes.fetch_add(1, Ordering::SeqCst);

            if self.unauthorized_until_refresh && self.refreshes.load(Ordering::SeqCst) == 0 {
                return Err(TransportError::Unauthorized);
            }

            let results = mutation
                .strands
                .iter()
                .flat_map(|strand| &strand.operations)
                .map(|op| OperationResult {
                    index: op.index,
                    success: true,
                    error: None,
                })
                .collect();

            Ok(StrandMutationResponse { results })
        }

        async fn refresh_credentials(&self) -> Result<(), TransportError> {
            let _count = self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn batches_respect_the_limit() -> eyre::Result<()> {
        let transport = Arc::new(RecordingTransport::accepting());
        let transmitter = Transmitter::new(Arc::clone(&transport) as _, 4);

        let report = transmitter
            .transmit("peer", vec![strand("doc-1", None, 10)])
            .await?;

        assert_eq!(report.accepted, 10);
        assert_eq!(report.rejected, 0);
        // 10 operations at 4 per mutation.
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 3);

        Ok(())
    }

    #[tokio::test]
    async fn origin_strands_are_skipped() -> eyre::Result<()> {
        let transport = Arc::new(RecordingTransport::accepting());
        let transmitter = Transmitter::new(Arc::clone(&transport) as _, 100);

        let report = transmitter
            .transmit(
                "peer",
                vec![
                    strand("doc-1", Some("peer"), 3),
                    strand("doc-2", Some("elsewhere"), 2),
                    strand("doc-3", None, 1),
                ],
            )
            .await?;

        assert_eq!(report.skipped, 3);
        assert_eq!(report.accepted, 3);

        Ok(())
    }

    #[tokio::test]
    async fn everything_looped_means_no_push_at_all() -> eyre::Result<()> {
        let transport = Arc::new(RecordingTransport::accepting());
        let transmitter = Transmitter::new(Arc::clone(&transport) as _, 100);

        let report = transmitter
            .transmit("peer", vec![strand("doc-1", Some("peer"), 5)])
            .await?;

        assert_eq!(report.skipped, 5);
        assert_eq!(report.accepted, 0);
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 0);

        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_refreshes_once_and_retries_once() -> eyre::Result<()> {
        let transport = Arc::new(RecordingTransport::unauthorized_first());
        let transmitter = Transmitter::new(Arc::clone(&transport) as _, 100);

        let report = transmitter
            .transmit("peer", vec![strand("doc-1", None, 2)])
            .await?;

        assert_eq!(report.accepted, 2);
        assert_eq!(transport.refreshes.load(Ordering::SeqCst), 1);
        // First push bounced, second succeeded.
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 2);

        Ok(())
    }

    /// Always unauthorized, even after refresh.
    struct AlwaysUnauthorized {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl ChannelTransport for AlwaysUnauthorized {
        async fn query_strands(
            &self,
            _query: &StrandQuery,
        ) -> Result<StrandQueryResponse, TransportError> {
            Err(TransportError::Unauthorized)
        }

        async fn push_strands(
            &self,
            _mutation: &StrandMutation,
        ) -> Result<StrandMutationResponse, TransportError> {
            Err(TransportError::Unauthorized)
        }

        async fn refresh_credentials(&self) -> Result<(), TransportError> {
            let _count = self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_unauthorized_is_fatal() {
        let transport = Arc::new(AlwaysUnauthorized {
            refreshes: AtomicU32::new(0),
        });
        let transmitter = Transmitter::new(Arc::clone(&transport) as _, 100);

        let result = transmitter
            .transmit("peer", vec![strand("doc-1", None, 1)])
            .await;

        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::Unauthorized))
        ));
        // Exactly one refresh, no second retry.
        assert_eq!(transport.refreshes.load(Ordering::SeqCst), 1);
    }
}
