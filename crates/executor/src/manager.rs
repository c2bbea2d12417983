//! Worker-pool supervision around the job executor.
//!
//! The manager owns a set of worker tasks that drain the shared queue.
//! Workers idle on the event bus between jobs, so a fresh enqueue wakes
//! them without polling. The pool can be scaled, paused and resumed at
//! runtime; stopping is graceful by default, letting in-flight jobs finish
//! within a grace period before aborting them.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strand_primitives::{EventBus, ReactorEvent};
use strand_queue::JobQueue;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::JobExecutor;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug)]
pub struct ManagerConfig {
    /// Worker tasks spawned on start.
    pub workers: usize,
    /// How long a graceful stop waits for in-flight jobs.
    pub shutdown_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Point-in-time snapshot of the pool.
#[derive(Clone, Debug)]
pub struct ExecutorStats {
    pub is_running: bool,
    pub workers: usize,
    pub active_jobs: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub uptime: Duration,
    pub backlog: usize,
}

impl ExecutorStats {
    /// Fraction of processed jobs that succeeded, in `[0, 1]`.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.processed as f64
    }

    #[must_use]
    pub fn jobs_per_second(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.processed as f64 / secs
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    active: AtomicUsize,
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct State {
    workers: Vec<Worker>,
    /// Graceful stop: workers pick up no new jobs.
    shutdown: CancellationToken,
    /// Hard stop: in-flight jobs observe cancellation.
    abort: CancellationToken,
    started_at: Option<Instant>,
}

/// Supervises a pool of workers draining the job queue.
pub struct ExecutorManager {
    executor: Arc<JobExecutor>,
    queue: JobQueue,
    bus: EventBus,
    config: ManagerConfig,
    counters: Arc<Counters>,
    pause: watch::Sender<bool>,
    state: Mutex<State>,
}

impl ExecutorManager {
    #[must_use]
    pub fn new(
        executor: Arc<JobExecutor>,
        queue: JobQueue,
        bus: EventBus,
        config: ManagerConfig,
    ) -> Self {
        let (pause, _) = watch::channel(false);

        Self {
            executor,
            queue,
            bus,
            config,
            counters: Arc::new(Counters::default()),
            pause,
            state: Mutex::new(State {
                workers: Vec::new(),
                shutdown: CancellationToken::new(),
                abort: CancellationToken::new(),
                started_at: None,
            }),
        }
    }

    /// Spawns the configured number of workers. A no-op when already
    /// running.
    pub fn start(&self) {
        let mut state = self.state.lock();

        if state.started_at.is_some() {
            debug!("Executor manager already running");
            return;
        }

        state.shutdown = CancellationToken::new();
        state.abort = CancellationToken::new();
        state.started_at = Some(Instant::now());
        let _resumed = self.pause.send(false);

        for _ in 0..self.config.workers.max(1) {
            let worker = self.spawn_worker(&state.shutdown, &state.abort);
            state.workers.push(worker);
        }

        let workers = state.workers.len();
        info!(workers, "Executor manager started");
        self.bus.emit(ReactorEvent::ExecutorStarted { workers });
    }

    /// Stops the pool. A graceful stop lets in-flight jobs finish within
    /// the grace period; a hard stop cancels them immediately.
    pub async fn stop(&self, graceful: bool) {
        let (workers, shutdown, abort) = {
            let mut state = self.state.lock();

            if state.started_at.take().is_none() {
                return;
            }

            (
                std::mem::take(&mut state.workers),
                state.shutdown.clone(),
                state.abort.clone(),
            )
        };

        shutdown.cancel();
        if !graceful {
            abort.cancel();
        }

        for worker in workers {
            worker.token.cancel();

            if graceful {
                if tokio::time::timeout(self.config.shutdown_grace, worker.handle)
                    .await
                    .is_err()
                {
                    warn!("Worker did not stop within the grace period, aborting");
                    abort.cancel();
                }
            } else {
                let _joined = worker.handle.await;
            }
        }

        info!(graceful, "Executor manager stopped");
        self.bus.emit(ReactorEvent::ExecutorStopped { graceful });
    }

    /// Resizes the pool to `target` workers. Shrinking cancels the newest
    /// workers after their current job; growing spawns fresh ones.
    pub fn scale(&self, target: usize) {
        let target = target.max(1);
        let mut state = self.state.lock();

        if state.started_at.is_none() {
            warn!("Cannot scale a stopped executor manager");
            return;
        }

        while state.workers.len() > target {
            if let Some(worker) = state.workers.pop() {
                worker.token.cancel();
            }
        }

        while state.workers.len() < target {
            let worker = self.spawn_worker(&state.shutdown, &state.abort);
            state.workers.push(worker);
        }

        info!(workers = state.workers.len(), "Executor pool scaled");
    }

    /// Pauses job pickup. In-flight jobs run to completion.
    pub fn pause(&self) {
        let _changed = self.pause.send(true);
        info!("Executor pool paused");
    }

    pub fn resume(&self) {
        let _changed = self.pause.send(false);
        info!("Executor pool resumed");
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        let state = self.state.lock();

        ExecutorStats {
            is_running: state.started_at.is_some(),
            workers: state.workers.len(),
            active_jobs: self.counters.active.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            uptime: state
                .started_at
                .map_or(Duration::ZERO, |started| started.elapsed()),
            backlog: self.queue.total_size(),
        }
    }

    fn spawn_worker(&self, shutdown: &CancellationToken, abort: &CancellationToken) -> Worker {
        let token = CancellationToken::new();

        let handle = tokio::spawn(worker_loop(
            Arc::clone(&self.executor),
            self.queue.clone(),
            self.bus.subscribe(),
            shutdown.clone(),
            abort.clone(),
            token.clone(),
            self.pause.subscribe(),
            Arc::clone(&self.counters),
        ));

        Worker { token, handle }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    executor: Arc<JobExecutor>,
    queue: JobQueue,
    mut events: broadcast::Receiver<ReactorEvent>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    token: CancellationToken,
    mut pause: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    loop {
        if shutdown.is_cancelled() || token.is_cancelled() {
            break;
        }

        // Paused: park until resumed or stopped.
        while *pause.borrow() {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = token.cancelled() => return,
                changed = pause.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        if let Some(job) = queue.dequeue_next() {
            let _active = counters.active.fetch_add(1, Ordering::Relaxed);

            let outcome = executor.execute_job(job, Some(&abort)).await;

            let _active = counters.active.fetch_sub(1, Ordering::Relaxed);
            let _processed = counters.processed.fetch_add(1, Ordering::Relaxed);
            if outcome.success {
                let _n = counters.succeeded.fetch_add(1, Ordering::Relaxed);
            } else {
                let _n = counters.failed.fetch_add(1, Ordering::Relaxed);
            }

            continue;
        }

        // Idle: wake on the next enqueue rather than polling.
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = token.cancelled() => break,
            changed = pause.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(ReactorEvent::JobAvailable { .. }) => {}
                Ok(_) => {}
                // Lagging only means we missed wakeups; the queue is
                // re-checked at the top of the loop anyway.
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
