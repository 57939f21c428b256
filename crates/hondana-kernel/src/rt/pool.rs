//! The worker pool and its admission scheduler.
//!
//! One process-wide pool executes every long-running job from both queues.
//! Admission is governed by three resources: idle workers, a soft memory
//! budget, and per-provider concurrency caps keyed by `"<provider>:<op>"`.
//! A completing worker's memory slot stays claimed until the consumer of
//! its result calls [`MemoryLease::release`], because the main thread may
//! still be writing the result to storage; dropping the lease is the
//! backstop.

use std::collections::{HashMap, VecDeque};

use culprit::Culprit;
use futures::future::BoxFuture;
use hondana_core::ByteUnit;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::{
    err::EngineErr,
    rt::work::{self, WorkProgress, WorkReply, WorkRequest},
};

#[derive(Debug, thiserror::Error)]
pub enum PoolErr {
    #[error("worker panicked")]
    WorkerPanic,

    #[error("worker pool is shut down")]
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on concurrent workers. The effective count is host
    /// parallelism clamped to `[2, max_workers]`.
    pub max_workers: usize,
    /// Soft budget for summed in-flight memory requirements, claimed slots
    /// pending release included.
    pub memory_budget: ByteUnit,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_workers: 8,
            memory_budget: ByteUnit::from_mb(512),
        }
    }
}

impl PoolConfig {
    fn effective_workers(&self) -> usize {
        let host = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        host.clamp(2, self.max_workers.max(2))
    }
}

/// Admission parameters for one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub memory: ByteUnit,
    /// Concurrency bucket, e.g. `"drive:download"`.
    pub provider_key: String,
    /// Maximum in-flight tasks for the bucket; `0` means unlimited.
    pub provider_limit: usize,
}

type PrepareFn = BoxFuture<'static, Result<WorkRequest, Culprit<EngineErr>>>;

struct QueuedTask {
    id: TaskId,
    spec: TaskSpec,
    prepare: PrepareFn,
    progress: mpsc::UnboundedSender<WorkProgress>,
    done: oneshot::Sender<TaskResult>,
}

/// What a completed task hands back: the outcome plus the memory lease the
/// consumer must release once the result is fully processed.
pub struct TaskResult {
    pub result: Result<WorkReply, Culprit<EngineErr>>,
    pub lease: MemoryLease,
}

/// Claim against the pool's memory budget. Held by the worker while
/// running, then by the result consumer until release.
pub struct MemoryLease {
    pool: Option<Arc<PoolShared>>,
    memory: ByteUnit,
}

impl MemoryLease {
    fn noop() -> Self {
        MemoryLease { pool: None, memory: ByteUnit::ZERO }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(pool) = self.pool.take() {
            {
                let mut state = pool.state.lock();
                state.memory_in_flight = state.memory_in_flight.saturating_sub(self.memory);
            }
            WorkerPool::pump(&pool);
        }
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Handle to one submitted task.
pub struct TaskHandle {
    pub id: TaskId,
    pub progress: mpsc::UnboundedReceiver<WorkProgress>,
    done: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// Waits for the task. The caller owns the returned lease.
    pub async fn join(self) -> TaskResult {
        match self.done.await {
            Ok(result) => result,
            // pool dropped mid-task
            Err(_) => TaskResult {
                result: Err(Culprit::new(EngineErr::Pool(PoolErr::Shutdown))),
                lease: MemoryLease::noop(),
            },
        }
    }

    /// Waits for the task while forwarding its progress events.
    pub async fn join_with(mut self, mut on_progress: impl FnMut(WorkProgress)) -> TaskResult {
        let mut progress_open = true;
        loop {
            tokio::select! {
                event = self.progress.recv(), if progress_open => {
                    match event {
                        Some(event) => on_progress(event),
                        None => progress_open = false,
                    }
                }
                result = &mut self.done => {
                    // drain whatever progress is still buffered
                    while let Ok(event) = self.progress.try_recv() {
                        on_progress(event);
                    }
                    return match result {
                        Ok(result) => result,
                        Err(_) => TaskResult {
                            result: Err(Culprit::new(EngineErr::Pool(PoolErr::Shutdown))),
                            lease: MemoryLease::noop(),
                        },
                    };
                }
            }
        }
    }
}

struct PoolState {
    queue: VecDeque<QueuedTask>,
    running: usize,
    memory_in_flight: ByteUnit,
    provider_counts: HashMap<String, usize>,
    next_id: u64,
}

struct PoolShared {
    config: PoolConfig,
    workers: usize,
    state: Mutex<PoolState>,
}

/// The process-wide pool. Cloning the `Arc` is the usage counter; the pool
/// and its queue die when the last handle drops.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let workers = config.effective_workers();
        debug!(workers, budget = %config.memory_budget, "worker pool ready");
        WorkerPool {
            shared: Arc::new(PoolShared {
                config,
                workers,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    running: 0,
                    memory_in_flight: ByteUnit::ZERO,
                    provider_counts: HashMap::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.shared.workers
    }

    /// Queues a task. `prepare` runs only when the scheduler is about to
    /// start the task, so credentials are fetched at the last moment.
    pub fn submit(&self, spec: TaskSpec, prepare: PrepareFn) -> TaskHandle {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let id = {
            let mut state = self.shared.state.lock();
            state.next_id += 1;
            let id = TaskId(state.next_id);
            state.queue.push_back(QueuedTask {
                id,
                spec,
                prepare,
                progress: progress_tx,
                done: done_tx,
            });
            id
        };
        trace!(%id, "task queued");
        Self::pump(&self.shared);

        TaskHandle { id, progress: progress_rx, done: done_rx }
    }

    /// Removes a task that has not started yet. A started task runs to
    /// completion. Returns true when the task was dequeued.
    pub fn cancel(&self, id: TaskId) -> bool {
        let task = {
            let mut state = self.shared.state.lock();
            state
                .queue
                .iter()
                .position(|t| t.id == id)
                .and_then(|at| state.queue.remove(at))
        };
        match task {
            Some(task) => {
                let _ = task.done.send(TaskResult {
                    result: Err(Culprit::new(EngineErr::Cancelled)),
                    lease: MemoryLease::noop(),
                });
                true
            }
            None => false,
        }
    }

    /// Starts every queued task the admission policy allows, in submission
    /// order.
    fn pump(shared: &Arc<PoolShared>) {
        loop {
            let task = {
                let mut state = shared.state.lock();
                let Some(at) = Self::find_admissible(shared, &state) else {
                    return;
                };
                let task = state.queue.remove(at).expect("index in bounds");
                state.running += 1;
                state.memory_in_flight += task.spec.memory;
                *state
                    .provider_counts
                    .entry(task.spec.provider_key.clone())
                    .or_insert(0) += 1;
                task
            };
            Self::start(shared.clone(), task);
        }
    }

    /// First queued task that passes admission:
    /// 1. a worker is idle;
    /// 2. the memory budget holds it, except that a single task is always
    ///    admitted into an idle pool (better a slow success than a stall);
    /// 3. its provider bucket is below its cap.
    fn find_admissible(shared: &PoolShared, state: &PoolState) -> Option<usize> {
        if state.running >= shared.workers {
            return None;
        }
        for (at, task) in state.queue.iter().enumerate() {
            let fits_budget = state.memory_in_flight + task.spec.memory
                <= shared.config.memory_budget
                || (state.running == 0 && state.memory_in_flight == ByteUnit::ZERO);
            if !fits_budget {
                continue;
            }
            let in_bucket = state
                .provider_counts
                .get(&task.spec.provider_key)
                .copied()
                .unwrap_or(0);
            if task.spec.provider_limit > 0 && in_bucket >= task.spec.provider_limit {
                continue;
            }
            return Some(at);
        }
        None
    }

    fn start(shared: Arc<PoolShared>, task: QueuedTask) {
        let QueuedTask { id, spec, prepare, progress, done } = task;
        trace!(%id, key = %spec.provider_key, memory = %spec.memory, "task starting");

        tokio::spawn(async move {
            let result = match prepare.await {
                Ok(request) => work::execute(request, progress).await,
                Err(err) => Err(err),
            };

            let lease = {
                let mut state = shared.state.lock();
                state.running -= 1;
                if let Some(count) = state.provider_counts.get_mut(&spec.provider_key) {
                    *count = count.saturating_sub(1);
                }
                MemoryLease { pool: Some(shared.clone()), memory: spec.memory }
            };

            // worker and provider slots are free; the memory slot travels
            // with the lease until the consumer releases it
            if done.send(TaskResult { result, lease }).is_err() {
                trace!(%id, "task result dropped by caller");
            }
            Self::pump(&shared);
        });
    }

    #[cfg(test)]
    pub(crate) fn debug_counts(&self) -> (usize, usize, u64) {
        let state = self.shared.state.lock();
        (
            state.queue.len(),
            state.running,
            state.memory_in_flight.as_u64(),
        )
    }
}
