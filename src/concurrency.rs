//! Worker pools and fan-out/fan-in helpers for telebuf.
//!
//! Pools are plain values owned by whoever builds the buffer and are injected
//! through [`BufferPools`]. Several buffers may share the same pools, in which
//! case their segment tasks compete for the same threads.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::{Result, TelebufError};

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs, possibly on other threads.
pub trait TaskExecutor: Send + Sync {
    /// Schedules a job. The job is dropped without running if this fails.
    fn execute(&self, job: Job) -> Result<()>;

    /// Stops accepting jobs and waits for queued ones to finish.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs every job on the calling thread. Deterministic, meant for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Inline job panicked");
        }
        Ok(())
    }
}

/// A fixed-size pool of worker threads fed by a bounded queue.
pub struct WorkerPool {
    name: String,
    workers: Mutex<Vec<Worker>>,
    sender: Sender<Message>,
    shutdown: AtomicBool,
    in_flight_tasks: Arc<AtomicUsize>,
    inline_fallback: bool,
}

enum Message {
    Task(Job),
    Shutdown,
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a new worker pool with the specified number of workers.
    pub fn new(name: impl Into<String>, num_workers: usize) -> Self {
        let name = name.into();
        let num_workers = if num_workers == 0 {
            warn!(pool = %name, "WorkerPool::new called with 0 workers; defaulting to 1");
            1
        } else {
            num_workers
        };

        let queue_capacity = num_workers.saturating_mul(2).max(1);
        let (sender, receiver) = bounded::<Message>(queue_capacity);
        let in_flight_tasks = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let receiver = receiver.clone();
            let in_flight_tasks = Arc::clone(&in_flight_tasks);
            let pool_name = name.clone();

            let thread_result = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || {
                    debug!(pool = %pool_name, "Worker {} started", id);

                    loop {
                        let message = match receiver.recv_timeout(Duration::from_millis(100)) {
                            Ok(msg) => msg,
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => {
                                debug!(pool = %pool_name, "Worker {} channel disconnected", id);
                                break;
                            }
                        };

                        match message {
                            Message::Task(job) => {
                                let result = catch_unwind(AssertUnwindSafe(job));
                                in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
                                if result.is_err() {
                                    error!(pool = %pool_name, "Worker {} job panicked", id);
                                }
                            }
                            Message::Shutdown => {
                                debug!(pool = %pool_name, "Worker {} received shutdown signal", id);
                                break;
                            }
                        }
                    }
                });

            match thread_result {
                Ok(thread) => workers.push(Worker {
                    id,
                    thread: Some(thread),
                }),
                Err(e) => {
                    error!(pool = %name, "Failed to spawn worker thread {}: {}", id, e);
                    break;
                }
            }
        }

        let inline_fallback = workers.is_empty();
        if inline_fallback {
            warn!(
                pool = %name,
                "WorkerPool failed to spawn workers; jobs will execute inline on the caller thread"
            );
        }

        Self {
            name,
            workers: Mutex::new(workers),
            sender,
            shutdown: AtomicBool::new(false),
            in_flight_tasks,
            inline_fallback,
        }
    }

    /// Returns the number of in-flight jobs (queued or currently running).
    pub fn active_tasks(&self) -> usize {
        self.in_flight_tasks.load(Ordering::Acquire)
    }

    /// Returns the number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Waits for all in-flight jobs to complete with a timeout.
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        while self.in_flight_tasks.load(Ordering::Acquire) > 0 {
            if start.elapsed() > timeout {
                return Err(TelebufError::Timeout {
                    operation: format!("{} drain", self.name),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(Duration::from_millis(10));
        }

        Ok(())
    }
}

impl TaskExecutor for WorkerPool {
    #[instrument(skip(self, job), fields(pool = %self.name))]
    fn execute(&self, job: Job) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(TelebufError::BufferShuttingDown);
        }

        if self.inline_fallback {
            return InlineExecutor.execute(job);
        }

        self.in_flight_tasks.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send(Message::Task(job))
            .map_err(|_| TelebufError::ChannelSend {
                channel: self.name.clone(),
            })
            .inspect_err(|_| {
                self.in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
            })?;

        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(pool = %self.name, "Shutting down worker pool");

        // Drain queued jobs before sending shutdown so enqueued work is not dropped.
        self.wait_for_completion(Duration::from_secs(30))?;

        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.sender.send(Message::Shutdown);
        }

        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                match thread.join() {
                    Ok(_) => debug!(pool = %self.name, "Worker {} shut down", worker.id),
                    Err(_) => error!(pool = %self.name, "Worker {} panicked during shutdown", worker.id),
                }
            }
        }

        Ok(())
    }
}

/// A pool that grows on demand up to `max_workers` threads and lets idle
/// threads exit after `keep_alive`.
pub struct ElasticPool {
    inner: Arc<ElasticInner>,
}

struct ElasticInner {
    name: String,
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    max_workers: usize,
    keep_alive: Duration,
    state: Mutex<ElasticState>,
    shutdown: AtomicBool,
}

#[derive(Default)]
struct ElasticState {
    live: usize,
    idle: usize,
    next_id: usize,
}

impl ElasticPool {
    /// Creates an empty pool. Threads are only spawned when jobs arrive.
    pub fn new(name: impl Into<String>, max_workers: usize, keep_alive: Duration) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            inner: Arc::new(ElasticInner {
                name: name.into(),
                sender,
                receiver,
                max_workers: max_workers.max(1),
                keep_alive,
                state: Mutex::new(ElasticState::default()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Threads currently alive.
    pub fn live_workers(&self) -> usize {
        self.inner.state.lock().live
    }

    /// Threads currently waiting for work.
    pub fn idle_workers(&self) -> usize {
        self.inner.state.lock().idle
    }

    fn ensure_worker(&self) {
        let mut state = self.inner.state.lock();
        if state.idle > 0 || state.live >= self.inner.max_workers {
            return;
        }

        let id = state.next_id;
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.inner.name, id))
            .spawn(move || elastic_worker(inner, id));

        match spawned {
            Ok(_) => {
                state.live += 1;
                state.next_id += 1;
            }
            Err(e) => error!(pool = %self.inner.name, "Failed to spawn worker thread {}: {}", id, e),
        }
    }
}

fn elastic_worker(inner: Arc<ElasticInner>, id: usize) {
    debug!(pool = %inner.name, "Elastic worker {} started", id);
    loop {
        inner.state.lock().idle += 1;
        let received = inner.receiver.recv_timeout(inner.keep_alive);

        let mut state = inner.state.lock();
        state.idle -= 1;
        match received {
            Ok(job) => {
                drop(state);
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(pool = %inner.name, "Elastic worker {} job panicked", id);
                }
            }
            // A job queued while this worker was timing out must not be stranded.
            Err(RecvTimeoutError::Timeout) if !inner.receiver.is_empty() => continue,
            Err(_) => {
                state.live -= 1;
                debug!(pool = %inner.name, "Elastic worker {} exiting", id);
                return;
            }
        }
    }
}

impl TaskExecutor for ElasticPool {
    #[instrument(skip(self, job), fields(pool = %self.inner.name))]
    fn execute(&self, job: Job) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TelebufError::BufferShuttingDown);
        }

        self.inner.sender.send(job).map_err(|_| TelebufError::ChannelSend {
            channel: self.inner.name.clone(),
        })?;
        self.ensure_worker();

        if self.live_workers() == 0 {
            // Spawning failed and nothing will pick the job up.
            if let Ok(job) = self.inner.receiver.try_recv() {
                return InlineExecutor.execute(job);
            }
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.store(true, Ordering::Release);
        info!(pool = %self.inner.name, "Shutting down elastic pool");
        let deadline = Instant::now() + Duration::from_secs(30);
        while !self.inner.receiver.is_empty() {
            if Instant::now() >= deadline {
                return Err(TelebufError::Timeout {
                    operation: format!("{} drain", self.inner.name),
                    timeout_ms: 30_000,
                });
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

/// Write and read executors shared by every partition of a buffer.
#[derive(Clone)]
pub struct BufferPools {
    pub write: Arc<dyn TaskExecutor>,
    pub read: Arc<dyn TaskExecutor>,
}

pub const DEFAULT_WRITE_WORKERS: usize = 4;
pub const DEFAULT_READ_WORKERS: usize = 10;
pub const DEFAULT_READ_KEEP_ALIVE: Duration = Duration::from_secs(60);

impl BufferPools {
    /// Creates a fixed write pool and an elastic read pool.
    pub fn new(write_workers: usize, read_workers: usize, read_keep_alive: Duration) -> Self {
        Self {
            write: Arc::new(WorkerPool::new("telebuf-write", write_workers)),
            read: Arc::new(ElasticPool::new(
                "telebuf-read",
                read_workers,
                read_keep_alive,
            )),
        }
    }

    /// Runs all segment tasks on the calling thread.
    pub fn inline() -> Self {
        Self {
            write: Arc::new(InlineExecutor),
            read: Arc::new(InlineExecutor),
        }
    }

    /// Shuts down both executors.
    pub fn shutdown(&self) -> Result<()> {
        self.write.shutdown()?;
        self.read.shutdown()
    }
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new(
            DEFAULT_WRITE_WORKERS,
            DEFAULT_READ_WORKERS,
            DEFAULT_READ_KEEP_ALIVE,
        )
    }
}

/// Result of one task dispatched by [`fan_out`].
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// The task ran to completion.
    Done(T),
    /// The task panicked or could not be scheduled.
    Lost,
}

/// A task that produces a value on a worker thread.
pub type FanTask<T> = Box<dyn FnOnce() -> T + Send + 'static>;

/// Dispatches every task to `executor` and blocks until all of them have
/// reported back. Outcomes are returned in task order.
///
/// With a timeout, a join that has not completed by the deadline fails with
/// [`TelebufError::Timeout`]. Tasks still running at that point keep running.
pub fn fan_out<T: Send + 'static>(
    executor: &dyn TaskExecutor,
    tasks: Vec<FanTask<T>>,
    timeout: Option<Duration>,
    operation: &str,
) -> Result<Vec<TaskOutcome<T>>> {
    let total = tasks.len();
    let mut outcomes: Vec<TaskOutcome<T>> = (0..total).map(|_| TaskOutcome::Lost).collect();
    if total == 0 {
        return Ok(outcomes);
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let (tx, rx) = bounded::<(usize, T)>(total);
    let mut pending = 0usize;

    for (idx, task) in tasks.into_iter().enumerate() {
        let tx = tx.clone();
        let job: Job = Box::new(move || {
            let value = task();
            let _ = tx.send((idx, value));
        });
        match executor.execute(job) {
            Ok(()) => pending += 1,
            Err(e) => error!(operation, task = idx, "Failed to schedule task: {}", e),
        }
    }
    // Only tasks hold senders now, so a panicked task disconnects instead of hanging.
    drop(tx);

    while pending > 0 {
        let received = match deadline {
            Some(deadline) => match rx.recv_deadline(deadline) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => {
                    let timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                    warn!(operation, pending, timeout_ms, "Fan-out timed out");
                    return Err(TelebufError::Timeout {
                        operation: operation.to_string(),
                        timeout_ms,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
            None => rx.recv().ok(),
        };

        match received {
            Some((idx, value)) => {
                outcomes[idx] = TaskOutcome::Done(value);
                pending -= 1;
            }
            None => {
                error!(operation, lost = pending, "Tasks ended without reporting a result");
                break;
            }
        }
    }

    Ok(outcomes)
}
