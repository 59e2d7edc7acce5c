//! In-process reference host
//!
//! [`LoopbackHost`] plays the part of an embedding engine: it owns one OS
//! thread per configured named thread plus a small pool serving the
//! any-thread sentinel, and delivers tokens through a [`HandleRegistry`].
//! Each thread has a main and a local queue, and each queue has a normal and
//! a high-priority lane; lanes are FIFO and high-priority lanes are drained
//! first. Tests, benchmarks and demos use it in place of a real engine.

use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};
use crate::dispatcher::{DispatchConfig, Dispatcher};
use crate::error::{Error, Result};
use crate::registry::{DispatchToken, HandleRegistry};
use crate::thread_id::{QueueIndex, TaskPriority, ThreadId, ThreadIndex};
use super::{ExecutionContext, HostDispatcher};

static HOST_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    // (host id, thread code) of the loopback worker running on this thread
    static CURRENT_WORKER: Cell<Option<(usize, i32)>> = const { Cell::new(None) };
}

/// Loopback host configuration
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Named threads to start, one OS thread each
    pub named_threads: Vec<ThreadIndex>,
    /// Workers serving the any-thread sentinel (0 = number of CPU cores)
    pub any_thread_workers: usize,
    /// Thread name prefix
    pub thread_name_prefix: String,
    /// Artificial latency added before each delivered callback
    pub dispatch_delay: Option<Duration>,
    /// Park timeout for idle workers in milliseconds
    pub park_timeout_ms: u64,
    /// Execution context the host starts in
    pub execution_context: ExecutionContext,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            named_threads: vec![ThreadIndex::RHI, ThreadIndex::GAME, ThreadIndex::ACTUAL_RENDERING],
            any_thread_workers: 0,
            thread_name_prefix: "loopback".to_string(),
            dispatch_delay: None,
            park_timeout_ms: 10,
            execution_context: ExecutionContext(1),
        }
    }
}

/// Snapshot of loopback host counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    /// Tokens accepted by `run_on_thread`
    pub tasks_queued: usize,
    /// Tokens handed to the registry
    pub tasks_executed: usize,
    /// Invocations the registry reported as failed
    pub tasks_failed: usize,
    /// Tokens refused or released without running
    pub tasks_dropped: usize,
}

#[derive(Default)]
struct Counters {
    tasks_queued: AtomicUsize,
    tasks_executed: AtomicUsize,
    tasks_failed: AtomicUsize,
    tasks_dropped: AtomicUsize,
}

struct PendingTask {
    token: DispatchToken,
    ready_at: Option<Instant>,
}

/// Queues of one named thread, indexed by [queue][task priority]
#[derive(Default)]
struct LaneSet {
    lanes: [[VecDeque<PendingTask>; 2]; 2],
}

impl LaneSet {
    fn push(&mut self, queue: QueueIndex, priority: TaskPriority, task: PendingTask) {
        self.lanes[queue as usize][priority as usize].push_back(task);
    }

    fn pop(&mut self) -> Option<PendingTask> {
        let high = TaskPriority::High as usize;
        let normal = TaskPriority::Normal as usize;
        let main = QueueIndex::Main as usize;
        let local = QueueIndex::Local as usize;

        [(main, high), (local, high), (main, normal), (local, normal)]
            .into_iter()
            .find_map(|(queue, priority)| self.lanes[queue][priority].pop_front())
    }

    fn drain(&mut self) -> Vec<PendingTask> {
        self.lanes
            .iter_mut()
            .flat_map(|queue| queue.iter_mut())
            .flat_map(|lane| lane.drain(..))
            .collect()
    }
}

struct NamedThreadQueue {
    code: i32,
    pending: Mutex<LaneSet>,
    condvar: Condvar,
}

/// Reference host with its own named threads
pub struct LoopbackHost {
    id: usize,
    config: LoopbackConfig,
    registry: Arc<HandleRegistry>,
    queues: HashMap<ThreadIndex, Arc<NamedThreadQueue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    execution_context: AtomicUsize,
    live_worlds: Mutex<HashSet<usize>>,
    should_stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl LoopbackHost {
    /// Start a host with a private registry
    pub fn start(config: LoopbackConfig) -> Result<Arc<Self>> {
        Self::with_registry(config, Arc::new(HandleRegistry::new()))
    }

    /// Start a host that delivers tokens through `registry`
    pub fn with_registry(config: LoopbackConfig, registry: Arc<HandleRegistry>) -> Result<Arc<Self>> {
        let any_workers = if config.any_thread_workers == 0 {
            num_cpus::get()
        } else {
            config.any_thread_workers
        };

        let mut queues = HashMap::new();
        for &thread in config.named_threads.iter().filter(|thread| !thread.is_any()) {
            queues.insert(thread, Self::new_queue(thread));
        }
        queues.insert(ThreadIndex::ANY, Self::new_queue(ThreadIndex::ANY));

        let host = Arc::new(Self {
            id: HOST_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            execution_context: AtomicUsize::new(config.execution_context.as_raw()),
            live_worlds: Mutex::new(HashSet::from([config.execution_context.as_raw()])),
            config,
            registry,
            queues,
            workers: Mutex::new(Vec::new()),
            should_stop: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        });

        log::info!(
            "Starting loopback host {} with {} named threads and {} any-thread workers",
            host.id,
            host.queues.len() - 1,
            any_workers
        );

        let mut workers = Vec::new();
        for (&thread, queue) in &host.queues {
            let count = if thread.is_any() { any_workers } else { 1 };
            for i in 0..count {
                let name = if thread.is_any() {
                    format!("{}-{}-{}", host.config.thread_name_prefix, thread, i)
                } else {
                    format!("{}-{}", host.config.thread_name_prefix, thread)
                };
                match host.spawn_worker(name, Arc::clone(queue)) {
                    Ok(handle) => workers.push(handle),
                    Err(e) => {
                        *host.workers.lock() = workers;
                        host.shutdown();
                        return Err(e);
                    }
                }
            }
        }
        *host.workers.lock() = workers;

        Ok(host)
    }

    fn new_queue(thread: ThreadIndex) -> Arc<NamedThreadQueue> {
        Arc::new(NamedThreadQueue {
            code: ThreadId::named(thread).code(),
            pending: Mutex::new(LaneSet::default()),
            condvar: Condvar::new(),
        })
    }

    fn spawn_worker(&self, name: String, queue: Arc<NamedThreadQueue>) -> Result<JoinHandle<()>> {
        let host_id = self.id;
        let registry = Arc::clone(&self.registry);
        let should_stop = Arc::clone(&self.should_stop);
        let counters = Arc::clone(&self.counters);
        let park_timeout = Duration::from_millis(self.config.park_timeout_ms);

        thread::Builder::new()
            .name(name)
            .spawn(move || {
                CURRENT_WORKER.with(|cell| cell.set(Some((host_id, queue.code))));
                worker_loop(queue, registry, should_stop, counters, park_timeout);
            })
            .map_err(|e| Error::HostError {
                reason: format!("Failed to spawn loopback thread: {}", e),
            })
    }

    /// Dispatcher wired to this host's registry
    pub fn dispatcher(self: &Arc<Self>) -> Dispatcher {
        self.dispatcher_with_config(DispatchConfig::default())
    }

    /// Dispatcher wired to this host's registry with custom configuration
    pub fn dispatcher_with_config(self: &Arc<Self>, config: DispatchConfig) -> Dispatcher {
        let host: Arc<dyn HostDispatcher> = Arc::clone(self) as Arc<dyn HostDispatcher>;
        Dispatcher::with_registry(host, Arc::clone(&self.registry), config)
    }

    /// Registry tokens are delivered through
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Switch to a new world; tokens addressed to the old one are refused
    pub fn switch_execution_context(&self, context: ExecutionContext) {
        let mut live = self.live_worlds.lock();
        let previous = self.execution_context.swap(context.as_raw(), Ordering::AcqRel);
        live.remove(&previous);
        live.insert(context.as_raw());
    }

    /// Accept tokens for `context` alongside the current world
    pub fn open_execution_context(&self, context: ExecutionContext) {
        self.live_worlds.lock().insert(context.as_raw());
    }

    /// Stop accepting tokens for `context`
    pub fn close_execution_context(&self, context: ExecutionContext) {
        self.live_worlds.lock().remove(&context.as_raw());
    }

    /// Whether tokens addressed to `context` are accepted
    pub fn is_live(&self, context: ExecutionContext) -> bool {
        self.live_worlds.lock().contains(&context.as_raw())
    }

    /// Get host statistics
    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            tasks_queued: self.counters.tasks_queued.load(Ordering::Relaxed),
            tasks_executed: self.counters.tasks_executed.load(Ordering::Relaxed),
            tasks_failed: self.counters.tasks_failed.load(Ordering::Relaxed),
            tasks_dropped: self.counters.tasks_dropped.load(Ordering::Relaxed),
        }
    }

    /// Check if the host is shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    /// Stop all workers and release tokens that were never delivered.
    ///
    /// Queued tokens are cancelled, which wakes any `send` waiting on them.
    pub fn shutdown(&self) {
        if self.should_stop.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Shutting down loopback host {}", self.id);

        for queue in self.queues.values() {
            queue.condvar.notify_all();
        }

        let current = thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            // A worker can end up dropping the last reference to its own host
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::warn!("loopback worker panicked during shutdown");
            }
        }

        // run_on_thread checks the stop flag under the same lock, so nothing
        // lands in a queue after it was drained
        for queue in self.queues.values() {
            let leftover = queue.pending.lock().drain();
            let released = self.registry.cancel_many(leftover.into_iter().map(|task| task.token));
            self.counters.tasks_dropped.fetch_add(released, Ordering::Relaxed);
        }
    }
}

impl HostDispatcher for LoopbackHost {
    fn run_on_thread(&self, context: ExecutionContext, thread_code: i32, token: DispatchToken) -> Result<()> {
        let refuse = |reason: String| {
            self.counters.tasks_dropped.fetch_add(1, Ordering::Relaxed);
            Err(Error::DispatchFailure { reason })
        };

        if !self.is_live(context) {
            return refuse(format!("{:?} is not live", context));
        }
        let thread = match ThreadId::from_code(thread_code) {
            Ok(thread) => thread,
            Err(e) => return refuse(e.to_string()),
        };
        let queue = match self.queues.get(&thread.thread_index()) {
            Some(queue) => queue,
            None => return refuse(format!("{} is not hosted here", thread.thread_index())),
        };

        let task = PendingTask {
            token,
            ready_at: self.config.dispatch_delay.map(|delay| Instant::now() + delay),
        };
        {
            let mut pending = queue.pending.lock();
            if self.is_shutting_down() {
                drop(pending);
                return refuse("loopback host is shut down".to_string());
            }
            pending.push(thread.queue_index(), thread.task_priority(), task);
        }
        self.counters.tasks_queued.fetch_add(1, Ordering::Relaxed);
        queue.condvar.notify_one();

        Ok(())
    }

    fn current_named_thread(&self) -> i32 {
        CURRENT_WORKER.with(|cell| match cell.get() {
            Some((host_id, code)) if host_id == self.id => code,
            _ => ThreadId::ANY_THREAD.code(),
        })
    }

    fn current_execution_context(&self) -> ExecutionContext {
        ExecutionContext(self.execution_context.load(Ordering::Acquire))
    }
}

impl Drop for LoopbackHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Main loop of a loopback worker thread
fn worker_loop(
    queue: Arc<NamedThreadQueue>,
    registry: Arc<HandleRegistry>,
    should_stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    park_timeout: Duration,
) {
    while !should_stop.load(Ordering::Acquire) {
        let task = {
            let mut pending = queue.pending.lock();
            match pending.pop() {
                Some(task) => Some(task),
                None => {
                    if !should_stop.load(Ordering::Acquire) {
                        let _timeout = queue.condvar.wait_for(&mut pending, park_timeout);
                    }
                    None
                }
            }
        };

        let Some(task) = task else { continue };

        if let Some(ready_at) = task.ready_at {
            let now = Instant::now();
            if ready_at > now {
                thread::sleep(ready_at - now);
            }
        }

        counters.tasks_executed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = registry.invoke_and_release(task.token) {
            counters.tasks_failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("loopback delivery of {:?} failed: {}", task.token, e);
        }
    }
}
