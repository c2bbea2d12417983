//! In-memory job queue partitioned by (document, scope, branch).
//!
//! Strict FIFO within each partition; order across partitions is
//! unspecified, which maximizes parallelism while preserving causal
//! ordering where it matters. All mutations are synchronous in-memory
//! operations; enqueueing additionally emits a [`ReactorEvent::JobAvailable`]
//! on the bus.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use strand_primitives::{EventBus, Job, JobId, PartitionKey, ReactorEvent};
use tracing::debug;

#[derive(Debug, Default)]
struct Partitions {
    /// FIFO per partition.
    jobs: HashMap<PartitionKey, VecDeque<Job>>,
    /// Partition creation order, so `dequeue_next` is deterministic.
    order: Vec<PartitionKey>,
}

impl Partitions {
    fn push(&mut self, job: Job) {
        let key = job.partition_key();

        if !self.jobs.contains_key(&key) {
            self.order.push(key.clone());
        }

        self.jobs.entry(key).or_default().push_back(job);
    }
}

/// FIFO job queue shared between submitters and executor workers.
#[derive(Clone, Debug, Default)]
pub struct JobQueue {
    partitions: Arc<Mutex<Partitions>>,
    bus: EventBus,
}

impl JobQueue {
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            partitions: Arc::new(Mutex::new(Partitions::default())),
            bus,
        }
    }

    /// Appends a job to its partition and announces it on the bus.
    pub fn enqueue(&self, job: Job) {
        let partition = job.partition_key();
        let job_id = job.id.clone();

        self.partitions.lock().push(job);

        debug!(%partition, %job_id, "Job enqueued");

        self.bus.emit(ReactorEvent::JobAvailable { partition, job_id });
    }

    /// Pops the oldest job of one partition, if any.
    #[must_use]
    pub fn dequeue(&self, partition: &PartitionKey) -> Option<Job> {
        self.partitions
            .lock()
            .jobs
            .get_mut(partition)
            .and_then(VecDeque::pop_front)
    }

    /// Pops the oldest job of the first non-empty partition, in partition
    /// creation order. Used by general workers.
    #[must_use]
    pub fn dequeue_next(&self) -> Option<Job> {
        let mut partitions = self.partitions.lock();
        let order = partitions.order.clone();

        for key in &order {
            if let Some(job) = partitions.jobs.get_mut(key).and_then(VecDeque::pop_front) {
                return Some(job);
            }
        }

        None
    }

    /// Backlog of one partition.
    #[must_use]
    pub fn size(&self, partition: &PartitionKey) -> usize {
        self.partitions
            .lock()
            .jobs
            .get(partition)
            .map_or(0, VecDeque::len)
    }

    /// Backlog across all partitions.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.partitions
            .lock()
            .jobs
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Cancels a not-yet-run job. Returns the job if it was still queued.
    pub fn remove(&self, job_id: &JobId) -> Option<Job> {
        let mut partitions = self.partitions.lock();

        for queue in partitions.jobs.values_mut() {
            if let Some(pos) = queue.iter().position(|job| &job.id == job_id) {
                return queue.remove(pos);
            }
        }

        None
    }

    /// Wipes one partition.
    pub fn clear(&self, partition: &PartitionKey) {
        if let Some(queue) = self.partitions.lock().jobs.get_mut(partition) {
            queue.clear();
        }
    }

    /// Wipes everything.
    pub fn clear_all(&self) {
        let mut partitions = self.partitions.lock();
        partitions.jobs.clear();
        partitions.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use strand_primitives::{Action, Branch, JobPayload, Scope};

    use super::*;

    fn job(id: &str, doc: &str, scope: Scope, branch: &str) -> Job {
        Job {
            id: id.into(),
            document_id: doc.into(),
            scope: scope.clone(),
            branch: branch.into(),
            payload: JobPayload::Action(Action {
                id: format!("{id}-action"),
                kind: "SET_VALUE".to_owned(),
                scope,
                timestamp_utc_ms: 0,
                input: serde_json::Value::Null,
                context: None,
            }),
            created_at_utc_ms: 0,
            queue_hint: None,
        }
    }

    #[test]
    fn fifo_within_partition() {
        let queue = JobQueue::new(EventBus::default());

        for id in ["job-1", "job-2", "job-3", "job-4"] {
            queue.enqueue(job(id, "doc-1", Scope::Global, "main"));
        }

        assert_eq!(queue.total_size(), 4);

        for expected in ["job-1", "job-2", "job-3", "job-4"] {
            let job = queue.dequeue_next().expect("job");
            assert_eq!(job.id.as_str(), expected);
        }

        assert!(queue.dequeue_next().is_none());
    }

    #[test]
    fn remove_preserves_remaining_order() {
        let queue = JobQueue::new(EventBus::default());

        for id in ["job-1", "job-2", "job-3", "job-4"] {
            queue.enqueue(job(id, "doc-1", Scope::Global, "main"));
        }

        let removed = queue.remove(&"job-3".into()).expect("removed");
        assert_eq!(removed.id.as_str(), "job-3");

        for expected in ["job-1", "job-2", "job-4"] {
            assert_eq!(queue.dequeue_next().expect("job").id.as_str(), expected);
        }
    }

    #[test]
    fn partitions_are_independent() {
        let queue = JobQueue::new(EventBus::default());

        queue.enqueue(job("a-1", "doc-a", Scope::Global, "main"));
        queue.enqueue(job("b-1", "doc-b", Scope::Global, "main"));
        queue.enqueue(job("a-2", "doc-a", Scope::Global, "main"));

        let partition_a = PartitionKey::new("doc-a".into(), Scope::Global, Branch::main());
        let partition_b = PartitionKey::new("doc-b".into(), Scope::Global, Branch::main());

        assert_eq!(queue.size(&partition_a), 2);
        assert_eq!(queue.size(&partition_b), 1);

        assert_eq!(queue.dequeue(&partition_b).expect("job").id.as_str(), "b-1");
        assert_eq!(queue.dequeue(&partition_a).expect("job").id.as_str(), "a-1");
        assert_eq!(queue.dequeue(&partition_a).expect("job").id.as_str(), "a-2");
    }

    #[tokio::test]
    async fn enqueue_announces_on_the_bus() {
        let bus = EventBus::default();
        let queue = JobQueue::new(bus.clone());
        let mut rx = bus.subscribe();

        queue.enqueue(job("job-9", "doc-1", Scope::Global, "main"));

        let event = rx.recv().await.expect("event");
        match event {
            ReactorEvent::JobAvailable { partition, job_id } => {
                assert_eq!(partition.to_string(), "doc-1/global/main");
                assert_eq!(job_id.as_str(), "job-9");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn clear_and_clear_all() {
        let queue = JobQueue::new(EventBus::default());

        queue.enqueue(job("a-1", "doc-a", Scope::Global, "main"));
        queue.enqueue(job("b-1", "doc-b", Scope::Local, "main"));

        let partition_a = PartitionKey::new("doc-a".into(), Scope::Global, Branch::main());
        queue.clear(&partition_a);
        assert_eq!(queue.size(&partition_a), 0);
        assert_eq!(queue.total_size(), 1);

        queue.clear_all();
        assert_eq!(queue.total_size(), 0);
    }
}
