//! Bridges sync events to per-job waits.
//!
//! One broadcast subscription feeds all waits. Completed results are
//! cached, so a caller that asks after the event already fired resolves
//! immediately instead of hanging on an event that will never repeat.
//! Shutdown rejects every pending wait; nothing is left parked forever.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use strand_primitives::{EventBus, JobId, ReactorEvent};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::SyncError;

/// How a job's sync round ended.
#[derive(Clone, Debug)]
pub struct SyncOutcome {
    pub remote: String,
    pub success: bool,
    pub operations_accepted: usize,
    pub operations_rejected: usize,
    pub error: Option<String>,
}

/// Bound on cached completed results; the oldest are evicted first.
pub const DEFAULT_COMPLETED_CAPACITY: usize = 1024;

struct Inner {
    pending: HashMap<JobId, Vec<oneshot::Sender<SyncOutcome>>>,
    completed: HashMap<JobId, SyncOutcome>,
    /// Insertion order of `completed`, for eviction past the capacity.
    order: VecDeque<JobId>,
    capacity: usize,
    shut_down: bool,
}

/// Waits for `SyncSucceeded`/`SyncFailed` events keyed by job id.
pub struct SyncAwaiter {
    inner: Arc<Mutex<Inner>>,
    listener: JoinHandle<()>,
}

impl SyncAwaiter {
    #[must_use]
    pub fn new(bus: &EventBus) -> Self {
        Self::with_capacity(bus, DEFAULT_COMPLETED_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(bus: &EventBus, capacity: usize) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            pending: HashMap::new(),
            completed: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            shut_down: false,
        }));
        // Subscribe before returning so no event can slip past between
        // construction and the listener starting.
        let events = bus.subscribe();
        let listener = tokio::spawn(listen(events, Arc::clone(&inner)));

        Self { inner, listener }
    }

    /// Resolves when the job's operations have been acknowledged by a
    /// remote (or the attempt failed). Resolves immediately from the cache
    /// if the event already fired.
    pub async fn wait_for_sync(&self, job_id: &JobId) -> Result<SyncOutcome, SyncError> {
        let receiver = {
            let mut inner = self.inner.lock();

            if let Some(done) = inner.completed.get(job_id) {
                return Ok(done.clone());
            }
            if inner.shut_down {
                return Err(SyncError::ShutDown);
            }

            let (sender, receiver) = oneshot::channel();
            inner.pending.entry(job_id.clone()).or_default().push(sender);
            receiver
        };

        receiver.await.map_err(|_closed| SyncError::ShutDown)
    }

    /// Cached result for a job whose sync round already ended.
    #[must_use]
    pub fn completed(&self, job_id: &JobId) -> Option<SyncOutcome> {
        self.inner.lock().completed.get(job_id).cloned()
    }

    /// Rejects every pending wait and stops listening. Waits arriving
    /// after shutdown are rejected immediately.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shut_down = true;
        // Dropping the senders resolves every pending wait with an error.
        inner.pending.clear();

        self.listener.abort();
    }
}

async fn listen(mut events: broadcast::Receiver<ReactorEvent>, inner: Arc<Mutex<Inner>>) {
    loop {
        let (job_id, outcome) = match events.recv().await {
            Ok(ReactorEvent::SyncSucceeded {
                remote,
                job_id: Some(job_id),
                operations_accepted,
            }) => (
                job_id,
                SyncOutcome {
                    remote,
                    success: true,
                    operations_accepted,
                    operations_rejected: 0,
                    error: None,
                },
            ),
            Ok(ReactorEvent::SyncFailed {
                remote,
                job_id: Some(job_id),
                operations_accepted,
                operations_rejected,
                error,
            }) => (
                job_id,
                SyncOutcome {
                    remote,
                    success: false,
                    operations_accepted,
                    operations_rejected,
                    error: Some(error),
                },
            ),
            Ok(_) => continue,
            // Missed events only matter for waits that would have resolved;
            // they stay pending until shutdown, which is the documented
            // contract for lost signals.
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "Sync awaiter lagged behind the bus");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let mut inner = inner.lock();
        if inner.shut_down {
            break;
        }

        let waiters = inner.pending.remove(&job_id).unwrap_or_default();
        if inner.completed.insert(job_id.clone(), outcome.clone()).is_none() {
            inner.order.push_back(job_id);
        }
        while inner.completed.len() > inner.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            let _evicted = inner.completed.remove(&oldest);
        }
        drop(inner);

        for waiter in waiters {
            let _gone = waiter.send(outcome.clone());
        }
    }
}
