//! Event bus for decoupled communication between the queue, executors and
//! the sync engine.

use tokio::sync::broadcast;

use crate::document::PartitionKey;
use crate::job::JobId;

/// Everything the sync core announces, as a closed enum so consumers match
/// exhaustively.
#[derive(Clone, Debug)]
pub enum ReactorEvent {
    /// A job was enqueued and is ready for a worker.
    JobAvailable {
        partition: PartitionKey,
        job_id: JobId,
    },

    /// A worker picked up a job.
    JobStarted { job_id: JobId },

    /// A job finished and its side effects are durable.
    JobCompleted { job_id: JobId },

    /// A job failed; the error stays in the job outcome, never crosses the
    /// pool boundary as a panic.
    JobFailed { job_id: JobId, error: String },

    /// An executor manager came up with the given worker count.
    ExecutorStarted { workers: usize },

    /// An executor manager shut down.
    ExecutorStopped { graceful: bool },

    /// Operations for a job were acknowledged by a remote.
    SyncSucceeded {
        remote: String,
        job_id: Option<JobId>,
        operations_accepted: usize,
    },

    /// A sync attempt failed; partial success is representable.
    SyncFailed {
        remote: String,
        job_id: Option<JobId>,
        operations_accepted: usize,
        operations_rejected: usize,
        error: String,
    },
}

const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Broadcast-backed event bus. Emission never fails; events sent while no
/// receiver is subscribed are dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ReactorEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: ReactorEvent) {
        let _ignored = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReactorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
