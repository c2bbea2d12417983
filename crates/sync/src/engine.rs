//! Remote lifecycle and the push/pull state machines.
//!
//! Each registered remote gets its own polling channel and worker; one
//! remote failing never blocks the others. Push and pull are independent:
//! each runs `Idle → Running → (Idle | Error)` per attempt and keeps its
//! own cursor, so an interrupted direction resumes where it stopped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use strand_primitives::time::now_utc_ms;
use strand_primitives::{
    Branch, ChannelConfig, EventBus, Job, JobId, JobPayload, PartitionKey, ReactorEvent,
    RemoteRecord, RemoteStatus, Strand, SyncFilter, SyncState,
};
use strand_queue::JobQueue;
use strand_store::{CursorStore, OperationStore, StoreError};
use tracing::{debug, info, warn};

use crate::channel::{ChannelFactory, ChannelTick, PollingChannel};
use crate::config::SyncConfig;
use crate::transmitter::Transmitter;
use crate::transport::ChannelTransport;
use crate::wire::{synced_scopes, StrandQuery, SyncCursor};
use crate::SyncError;

fn pull_key(remote: &str) -> String {
    format!("{remote}/pull")
}

fn push_key(remote: &str) -> String {
    format!("{remote}/push")
}

#[derive(Clone, Copy, Debug)]
enum Direction {
    Pull,
    Push,
}

/// Bound on remembered operation origins.
const MAX_ORIGIN_ENTRIES: usize = 8192;

/// Insertion-order bounded map of operation id → remote it was pulled
/// from. Evicting an old entry is safe: an operation pushed back to its
/// source lands on an occupied index there and is acked as a duplicate.
#[derive(Default)]
struct OriginIndex {
    map: HashMap<String, String>,
    order: VecDeque<String>,
}

impl OriginIndex {
    fn record(&mut self, operation_id: String, remote: String) {
        if self.map.insert(operation_id.clone(), remote).is_none() {
            self.order.push_back(operation_id);
        }

        while self.map.len() > MAX_ORIGIN_ENTRIES {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            let _evicted = self.map.remove(&oldest);
        }
    }

    fn source(&self, operation_id: &str) -> Option<&String> {
        self.map.get(operation_id)
    }
}

/// Orchestrates all registered remotes.
pub struct SyncEngine {
    store: Arc<dyn OperationStore>,
    cursors: Arc<dyn CursorStore>,
    queue: JobQueue,
    bus: EventBus,
    factory: ChannelFactory,
    config: SyncConfig,
    origins: Arc<Mutex<OriginIndex>>,
    /// Jobs awaiting acknowledgement, by the partition and index of the
    /// operation they committed.
    tracked: Arc<Mutex<HashMap<PartitionKey, Vec<(u64, JobId)>>>>,
    channels: Mutex<HashMap<String, (PollingChannel, Arc<RemoteWorker>)>>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn OperationStore>,
        cursors: Arc<dyn CursorStore>,
        queue: JobQueue,
        bus: EventBus,
        factory: ChannelFactory,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            cursors,
            queue,
            bus,
            factory,
            config,
            origins: Arc::new(Mutex::new(OriginIndex::default())),
            tracked: Arc::new(Mutex::new(HashMap::new())),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) a remote and starts polling it. The channel
    /// config is validated before anything is persisted.
    pub async fn register_remote(
        &self,
        name: impl Into<String>,
        collection_id: impl Into<String>,
        channel_config: ChannelConfig,
        filter: SyncFilter,
    ) -> Result<(), SyncError> {
        let name = name.into();

        let transport = self.factory.create(&channel_config)?;

        let record = RemoteRecord {
            name: name.clone(),
            collection_id: collection_id.into(),
            channel_config,
            filter: filter.clone(),
            status: RemoteStatus::default(),
        };
        self.cursors.put_remote(record).await?;

        let worker = Arc::new(RemoteWorker {
            name: name.clone(),
            filter,
            transmitter: Transmitter::new(Arc::clone(&transport), self.config.batch_limit),
            transport,
            store: Arc::clone(&self.store),
            cursors: Arc::clone(&self.cursors),
            queue: self.queue.clone(),
            bus: self.bus.clone(),
            config: self.config,
            origins: Arc::clone(&self.origins),
            tracked: Arc::clone(&self.tracked),
            tick_lock: tokio::sync::Mutex::new(()),
        });

        let channel = PollingChannel::start(
            name.clone(),
            self.config,
            Arc::clone(&worker) as Arc<dyn ChannelTick>,
        );

        let replaced = self
            .channels
            .lock()
            .insert(name.clone(), (channel, worker));
        if let Some((old, _worker)) = replaced {
            debug!(remote = %name, "Replacing existing channel");
            old.stop().await;
        }

        info!(remote = %name, "Remote registered");
        Ok(())
    }

    /// Stops polling and removes the remote record and its cursors.
    pub async fn unregister_remote(&self, name: &str) -> Result<(), SyncError> {
        if let Some((channel, _worker)) = self.channels.lock().remove(name) {
            channel.stop().await;
        }

        self.cursors.delete_remote(name).await.map_err(|err| match err {
            StoreError::RemoteNotFound(name) => SyncError::RemoteNotFound(name),
            other => other.into(),
        })?;

        info!(remote = name, "Remote unregistered");
        Ok(())
    }

    pub async fn remote_status(&self, name: &str) -> Result<RemoteStatus, SyncError> {
        match self.cursors.get_remote(name).await {
            Ok(record) => Ok(record.status),
            Err(StoreError::RemoteNotFound(name)) => Err(SyncError::RemoteNotFound(name)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_remotes(&self) -> Result<Vec<RemoteRecord>, SyncError> {
        Ok(self.cursors.list_remotes().await?)
    }

    /// Runs one pull + push round for a remote right now, outside its
    /// polling schedule.
    pub async fn sync_now(&self, name: &str) -> Result<(), SyncError> {
        let worker = self
            .channels
            .lock()
            .get(name)
            .map(|(_channel, worker)| Arc::clone(worker))
            .ok_or_else(|| SyncError::RemoteNotFound(name.to_owned()))?;

        worker.tick().await
    }

    /// Marks a job as awaiting remote acknowledgement of the operation it
    /// committed at `index`. A later successful push covering that index
    /// emits `SyncSucceeded` with this job id.
    pub fn track_job(&self, job_id: JobId, partition: PartitionKey, index: u64) {
        self.tracked
            .lock()
            .entry(partition)
            .or_default()
            .push((index, job_id));
    }

    /// Stops every polling channel. Remote records stay; a fresh engine
    /// resumes from the persisted cursors.
    pub async fn shutdown(&self) {
        let channels: Vec<_> = {
            let mut map = self.channels.lock();
            map.drain().map(|(_name, (channel, _worker))| channel).collect()
        };

        for channel in channels {
            channel.stop().await;
        }

        info!("Sync engine shut down");
    }
}

/// Per-remote sync worker: one tick is one pull and one push.
struct RemoteWorker {
    name: String,
    filter: SyncFilter,
    transport: Arc<dyn ChannelTransport>,
    transmitter: Transmitter,
    store: Arc<dyn OperationStore>,
    cursors: Arc<dyn CursorStore>,
    queue: JobQueue,
    bus: EventBus,
    config: SyncConfig,
    origins: Arc<Mutex<OriginIndex>>,
    tracked: Arc<Mutex<HashMap<PartitionKey, Vec<(u64, JobId)>>>>,
    /// Serializes ticks: a manual sync must not overlap a scheduled one.
    tick_lock: tokio::sync::Mutex<()>,
}

#[async_trait]
impl ChannelTick for RemoteWorker {
    async fn tick(&self) -> Result<(), SyncError> {
        let _serialized = self.tick_lock.lock().await;

        let pull = self.pull().await;
        let push = self.push().await;

        pull.and(push)
    }

    async fn exhausted(&self) {
        warn!(remote = %self.name, "Remote errored out, polling stopped until restart");
    }
}

impl RemoteWorker {
    async fn pull(&self) -> Result<(), SyncError> {
        self.set_state(Direction::Pull, SyncState::Running).await?;

        let mut accepted = 0;
        let result = self.pull_inner(&mut accepted).await;

        self.settle(Direction::Pull, result, accepted, 0).await
    }

    async fn pull_inner(&self, accepted: &mut usize) -> Result<(), SyncError> {
        let key = pull_key(&self.name);
        let cursor = self.cursors.get_cursor(&key).await?;

        let query = StrandQuery {
            cursor,
            filter: self.filter.clone(),
            limit: self.config.batch_limit,
        };
        let response = self.transport.query_strands(&query).await?;

        for strand in response.strands {
            for operation in strand.operations {
                // Remember where the operation came from so it is never
                // pushed back there.
                self.origins
                    .lock()
                    .record(operation.id.clone(), self.name.clone());

                let job = Job {
                    id: format!(
                        "{}:{}:{}:{}:{}",
                        self.name, strand.document_id, strand.scope, strand.branch,
                        operation.index
                    )
                    .into(),
                    document_id: strand.document_id.clone(),
                    scope: strand.scope.clone(),
                    branch: strand.branch.clone(),
                    payload: JobPayload::Operation(operation),
                    created_at_utc_ms: now_utc_ms(),
                    queue_hint: Some(self.name.clone()),
                };

                self.queue.enqueue(job);
                *accepted += 1;
            }
        }

        if let Some(cursor) = response.cursor {
            self.cursors.set_cursor(&key, cursor).await?;
        }

        debug!(remote = %self.name, accepted, "Pull round done");
        Ok(())
    }

    async fn push(&self) -> Result<(), SyncError> {
        self.set_state(Direction::Push, SyncState::Running).await?;

        let mut accepted = 0;
        let mut rejected = 0;
        let result = self.push_inner(&mut accepted, &mut rejected).await;

        self.settle(Direction::Push, result, accepted, rejected).await
    }

    async fn push_inner(
        &self,
        accepted: &mut usize,
        rejected: &mut usize,
    ) -> Result<(), SyncError> {
        let key = push_key(&self.name);
        let mut cursor = SyncCursor::parse(self.cursors.get_cursor(&key).await?.as_deref());

        let mut strands = Vec::new();
        // Partitions this round covers, with the index it covers up to.
        let mut covered: Vec<(PartitionKey, u64)> = Vec::new();
        let mut budget = self.config.batch_limit;

        'outer: for document_id in self.store.list_documents().await? {
            let branches = match self.store.get_header(&document_id).await {
                Ok(header) => header.branches,
                Err(StoreError::DocumentNotFound(_)) => vec![Branch::main()],
                Err(err) => return Err(err.into()),
            };

            for scope in synced_scopes() {
                for branch in &branches {
                    if budget == 0 {
                        break 'outer;
                    }
                    if !self.filter.matches(&document_id, &scope, branch) {
                        continue;
                    }

                    let partition =
                        PartitionKey::new(document_id.clone(), scope.clone(), branch.clone());
                    let start = cursor.next_index(&partition);
                    let head = self
                        .store
                        .operation_count(&document_id, &scope, branch)
                        .await?;
                    if head <= start {
                        continue;
                    }

                    let end = head.min(start + budget as u64);
                    let operations = self
                        .store
                        .read_range(&document_id, &scope, branch, start, end)
                        .await?;
                    budget -= operations.len();

                    // Operations pulled from this remote go back out to
                    // everyone else, never to it.
                    let outbound: Vec<_> = {
                        let origins = self.origins.lock();
                        operations
                            .into_iter()
                            .filter(|op| origins.source(&op.id) != Some(&self.name))
                            .collect()
                    };

                    covered.push((partition, end));
                    if !outbound.is_empty() {
                        strands.push(Strand {
                            document_id: document_id.clone(),
                            scope: scope.clone(),
                            branch: branch.clone(),
                            origin: None,
                            operations: outbound,
                        });
                    }
                }
            }
        }

        if !strands.is_empty() {
            let report = self.transmitter.transmit(&self.name, strands).await?;
            *accepted = report.accepted;
            *rejected = report.rejected;

            if report.rejected > 0 {
                // Leave the cursor so the rejected range is retried; the
                // remote filters redelivered duplicates by index.
                return Err(SyncError::PartialRejection {
                    rejected: report.rejected,
                    total: report.accepted + report.rejected,
                });
            }
        }

        if !covered.is_empty() {
            for (partition, end) in &covered {
                cursor.advance(partition, *end);
            }
            self.cursors.set_cursor(&key, cursor.encode()).await?;

            self.acknowledge_tracked(&covered, *accepted);
        }

        debug!(remote = %self.name, accepted, "Push round done");
        Ok(())
    }

    /// Resolves tracked jobs whose operation index this push covered.
    fn acknowledge_tracked(&self, covered: &[(PartitionKey, u64)], accepted: usize) {
        let acked: Vec<JobId> = {
            let mut tracked = self.tracked.lock();
            let mut acked = Vec::new();

            for (partition, end) in covered {
                if let Some(entries) = tracked.get_mut(partition) {
                    let (done, waiting): (Vec<_>, Vec<_>) =
                        entries.drain(..).partition(|(index, _)| *index < *end);
                    *entries = waiting;
                    acked.extend(done.into_iter().map(|(_, job_id)| job_id));
                }
            }

            acked
        };

        for job_id in acked {
            self.bus.emit(ReactorEvent::SyncSucceeded {
                remote: self.name.clone(),
                job_id: Some(job_id),
                operations_accepted: accepted,
            });
        }
    }

    async fn set_state(&self, direction: Direction, state: SyncState) -> Result<(), SyncError> {
        let mut record = self.cursors.get_remote(&self.name).await?;

        match direction {
            Direction::Pull => record.status.pull.state = state,
            Direction::Push => record.status.push.state = state,
        }

        Ok(self.cursors.put_remote(record).await?)
    }

    /// Applies the attempt result to the direction's status and announces
    /// it on the bus.
    async fn settle(
        &self,
        direction: Direction,
        result: Result<(), SyncError>,
        accepted: usize,
        rejected: usize,
    ) -> Result<(), SyncError> {
        let now = now_utc_ms();
        let mut record = self.cursors.get_remote(&self.name).await?;
        let status = match direction {
            Direction::Pull => &mut record.status.pull,
            Direction::Push => &mut record.status.push,
        };

        match result {
            Ok(()) => {
                status.on_success(now);
                self.cursors.put_remote(record).await?;

                self.bus.emit(ReactorEvent::SyncSucceeded {
                    remote: self.name.clone(),
                    job_id: None,
                    operations_accepted: accepted,
                });

                Ok(())
            }
            Err(err) => {
                status.on_failure(now);
                status.state = if status.failure_count >= self.config.max_failures {
                    SyncState::Error
                } else {
                    SyncState::Idle
                };
                self.cursors.put_remote(record).await?;

                warn!(remote = %self.name, ?direction, %err, "Sync attempt failed");
                self.bus.emit(ReactorEvent::SyncFailed {
                    remote: self.name.clone(),
                    job_id: None,
                    operations_accepted: accepted,
                    operations_rejected: rejected,
                    error: err.to_string(),
                });

                Err(err)
            }
        }
    }
}
