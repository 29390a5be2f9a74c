//! Runtime construction and lifecycle.

use crate::context::{self, Core};
use crate::poller::Poller;
use crate::runtime::pool::ThreadPool;
use crate::runtime::queue;
use crate::runtime::shared::{Handle, Shared};
use crate::runtime::worker::Worker;
use crate::task::JoinHandle;
use anyhow::{Result, anyhow};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::cell::Cell;
use std::future::Future;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Wake, Waker};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Default ticks between forced completion drains and between global-queue
/// visits. Coprime-ish with small cycle lengths so the two periodic checks
/// do not phase-lock.
const CHECK_IO_INTERVAL: u32 = 61;
const CHECK_GLOBAL_INTERVAL: u32 = 61;

/// Default capacity of each worker's submission/completion ring pair.
const RING_ENTRIES: u32 = 1024;

bitflags! {
    /// Kernel flags applied at ring setup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoUringFlags: u32 {
        /// Kernel-side submission polling (`IORING_SETUP_SQPOLL`).
        const SQPOLL = 1;

        /// Promise a single submitting thread per ring
        /// (`IORING_SETUP_SINGLE_ISSUER`). Each poller already is.
        const SINGLE_ISSUER = 1 << 1;

        /// Cooperative task-work scheduling (`IORING_SETUP_COOP_TASKRUN`).
        const COOP_TASKRUN = 1 << 2;

        /// Defer task-work to `io_uring_enter` (`IORING_SETUP_DEFER_TASKRUN`);
        /// requires `SINGLE_ISSUER`.
        const DEFER_TASKRUN = 1 << 3;
    }
}

/// Builds a [`Runtime`].
///
/// ```no_run
/// let runtime = vortio::runtime::Builder::new()
///     .num_workers(4)
///     .try_build()
///     .unwrap();
/// let out = runtime.block_on(async { 2 + 2 });
/// assert_eq!(out, 4);
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Worker thread count; defaults to the hardware parallelism.
    num_workers: Option<usize>,

    /// Ticks between forced completion drains.
    check_io_interval: u32,

    /// Ticks between global-queue visits.
    check_global_interval: u32,

    /// Submission ring capacity per worker.
    ring_entries: u32,

    io_uring_flags: IoUringFlags,

    thread_name: String,

    thread_stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            num_workers: None,
            check_io_interval: CHECK_IO_INTERVAL,
            check_global_interval: CHECK_GLOBAL_INTERVAL,
            ring_entries: RING_ENTRIES,
            io_uring_flags: IoUringFlags::empty(),
            thread_name: "vortio-worker".into(),
            thread_stack_size: None,
        }
    }

    /// Sets the number of worker threads. The thread that builds the
    /// runtime is worker 0; `val - 1` threads are spawned.
    #[track_caller]
    pub fn num_workers(mut self, val: usize) -> Self {
        assert!(val > 0, "num_workers must be greater than 0");
        self.num_workers = Some(val);
        self
    }

    /// Ticks between forced completion drains on each worker.
    #[track_caller]
    pub fn check_io_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "check_io_interval must be greater than 0");
        self.check_io_interval = val;
        self
    }

    /// Ticks between global-queue visits on each worker. Lower values trade
    /// throughput for fairness to newly spawned tasks.
    #[track_caller]
    pub fn check_global_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "check_global_interval must be greater than 0");
        self.check_global_interval = val;
        self
    }

    /// Capacity of each worker's submission/completion ring pair.
    pub fn ring_entries(mut self, val: u32) -> Self {
        self.ring_entries = val;
        self
    }

    /// Raw kernel flags applied when each worker's ring is set up.
    pub fn io_uring_flags(mut self, flags: IoUringFlags) -> Self {
        self.io_uring_flags = flags;
        self
    }

    /// Name prefix for spawned worker threads ("{name}-{index}").
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = val.into();
        self
    }

    /// Stack size for spawned worker threads.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured [`Runtime`]: worker 0's ring on the calling
    /// thread, the remaining workers on their own threads, all idle until
    /// tasks arrive.
    pub fn try_build(self) -> Result<Runtime> {
        IS_RUNTIME_ACTIVE.with(|active| {
            if active.get() {
                Err(anyhow!(
                    "cannot build a runtime: one is already active on this thread"
                ))
            } else {
                active.set(true);
                Ok(())
            }
        })?;

        match self.try_build_inner() {
            Ok(runtime) => Ok(runtime),
            Err(err) => {
                context::clear_core();
                IS_RUNTIME_ACTIVE.with(|active| active.set(false));
                Err(err)
            }
        }
    }

    fn try_build_inner(self) -> Result<Runtime> {
        let cfg: RuntimeConfig = self.try_into()?;

        let mut steals = Vec::with_capacity(cfg.num_workers);
        let mut locals = Vec::with_capacity(cfg.num_workers);
        for _ in 0..cfg.num_workers {
            let (steal, local) = queue::local();
            steals.push(steal);
            locals.push(local);
        }

        let handle = Handle {
            shared: Arc::new(Shared::new(cfg, steals)?),
        };

        // Worker 0 is this thread.
        let mut locals = locals.into_iter();
        let root_queue = locals.next().expect("num_workers is at least 1");
        let root_unpark = handle.shared.remotes[0].unpark.clone();
        let poller = Poller::try_new(&handle.shared.cfg, 0, root_unpark)?;
        context::init_core(Core {
            index: 0,
            handle: handle.clone(),
            run_queue: std::cell::RefCell::new(root_queue),
            poller: std::cell::RefCell::new(poller),
            current_task: std::cell::RefCell::new(None),
        })?;

        let pool = ThreadPool::spawn(&handle, locals.collect())?;

        Ok(Runtime {
            root_worker: Mutex::new(Worker::new(0, handle.clone())),
            root_thread: thread::current().id(),
            handle,
            pool,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// One runtime per thread: worker 0's ring and queue live in this thread's
// context for the runtime's whole lifetime.
thread_local! {
    static IS_RUNTIME_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Validated, immutable runtime configuration shared by every worker.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) num_workers: usize,
    pub(crate) check_io_interval: u32,
    pub(crate) check_global_interval: u32,
    pub(crate) ring_entries: u32,
    pub(crate) io_uring_flags: IoUringFlags,
    pub(crate) thread_name: String,
    pub(crate) thread_stack_size: Option<usize>,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.ring_entries == 0 || !self.ring_entries.is_power_of_two() {
            return Err(anyhow!("ring_entries must be a non-zero power of two"));
        }
        if self.io_uring_flags.contains(IoUringFlags::DEFER_TASKRUN)
            && !self.io_uring_flags.contains(IoUringFlags::SINGLE_ISSUER)
        {
            return Err(anyhow!("DEFER_TASKRUN requires SINGLE_ISSUER"));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            num_workers: 1,
            check_io_interval: 4,
            check_global_interval: 4,
            ring_entries: 64,
            io_uring_flags: IoUringFlags::empty(),
            thread_name: "vortio-test".into(),
            thread_stack_size: None,
        }
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self> {
        let num_workers = match builder.num_workers {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = RuntimeConfig {
            num_workers,
            check_io_interval: builder.check_io_interval,
            check_global_interval: builder.check_global_interval,
            ring_entries: builder.ring_entries,
            io_uring_flags: builder.io_uring_flags,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// A handle to a running vortio runtime.
///
/// Dropping the runtime shuts it down: workers drain their rings, every
/// unfinished task's JoinHandle resolves as cancelled, and the worker
/// threads are joined.
pub struct Runtime {
    pub(crate) handle: Handle,
    pool: ThreadPool,
    root_worker: Mutex<Worker>,
    root_thread: ThreadId,
}

impl Runtime {
    /// Runs `future` to completion on this runtime and returns its output.
    ///
    /// The future becomes an ordinary task enqueued on worker 0's local
    /// queue; the calling thread runs worker 0's event loop until the task
    /// resolves. Must be called on the thread that built the runtime.
    #[track_caller]
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        assert_eq!(
            thread::current().id(),
            self.root_thread,
            "block_on must be called on the thread that built the runtime"
        );

        let join_handle = self.handle.spawn(future);

        // Root completion may happen on a peer worker; this waker makes sure
        // a parked worker 0 hears about it.
        let root_waker = Waker::from(Arc::new(RootWaker {
            shared: self.handle.shared.clone(),
        }));
        join_handle.install_waker(&root_waker);

        {
            let mut worker = self.root_worker.lock();
            let mut done = || join_handle.is_finished();
            if let Err(err) = worker.run(Some(&mut done)) {
                panic!("worker 0 event loop failed: {err:?}");
            }
        }

        // If the loop exited through shutdown rather than root completion,
        // give the shutdown path a moment to resolve the handle.
        let deadline = Instant::now() + Duration::from_secs(1);
        while !join_handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        match join_handle
            .try_take_result()
            .expect("root task did not resolve")
        {
            Ok(output) => output,
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(err) => panic!("root task failed: {err}"),
        }
    }

    /// Spawns a task onto the runtime. Works from any thread.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Shuts the runtime down. Idempotent.
    ///
    /// Sets the shutdown flag and unparks every worker; each worker cancels
    /// its in-flight operations, drains its ring within a bounded window,
    /// resolves its queued tasks, and exits. Whatever remains registered
    /// afterwards resolves as cancelled.
    pub fn shutdown(&self) {
        let shared = &self.handle.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("runtime shutdown initiated");

        shared.owned.close();
        shared.unpark_all();

        if let Err(err) = self.pool.join_all() {
            tracing::error!(%err, "worker threads panicked during shutdown");
        }

        // Worker 0 never runs its loop outside block_on; drain it here if we
        // are on its thread.
        if thread::current().id() == self.root_thread {
            self.root_worker.lock().shutdown();
        }

        while let Some(task) = shared.injector.pop() {
            task.resolve_shutdown();
        }
        tracing::debug!(remaining = shared.owned.len(), "resolving registered tasks");
        shared.owned.shutdown_all();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
        if thread::current().id() == self.root_thread {
            context::clear_core();
            IS_RUNTIME_ACTIVE.with(|active| active.set(false));
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("num_workers", &self.handle.shared.cfg.num_workers)
            .finish()
    }
}

struct RootWaker {
    shared: Arc<Shared>,
}

impl Wake for RootWaker {
    fn wake(self: Arc<Self>) {
        self.shared.unpark_worker(0);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.unpark_worker(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);
    assert_impl_all!(Runtime: Send);

    #[test]
    fn test_builder_rejects_bad_config() {
        assert!(
            Builder::new()
                .ring_entries(100)
                .try_build()
                .is_err()
        );
        assert!(
            Builder::new()
                .io_uring_flags(IoUringFlags::DEFER_TASKRUN)
                .try_build()
                .is_err()
        );
    }

    #[test]
    #[should_panic(expected = "num_workers must be greater than 0")]
    fn test_builder_rejects_zero_workers() {
        let _ = Builder::new().num_workers(0);
    }
}
