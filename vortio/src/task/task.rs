use crate::context;
use crate::runtime::shared::Handle;
use crate::task::error::JoinError;
use crate::task::id::Id;
use crate::task::join::Completable;
use crate::task::state::{State, Suspend, Wake as WakeOutcome};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::task::{Context, Poll, Wake, Waker};

/// Sentinel home index for a task that has not yet run on any worker.
pub(crate) const NO_HOME: usize = usize::MAX;

/// Identifies one in-flight kernel operation: the worker whose ring carries
/// it and the tag in that worker's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpRef {
    pub(crate) worker: usize,
    pub(crate) tag: usize,
}

/// The heap-resident task cell. One allocation per task; the task's `Waker`
/// is this cell, so the waker stays stable (`will_wake`) across polls.
pub(crate) struct TaskCell {
    id: Id,
    state: State,

    /// The erased user computation. `None` once the task reached a terminal
    /// state and the frame was released.
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,

    /// Type-erased join slot, for resolving the handle on cancellation,
    /// shutdown and panic.
    join: Arc<dyn Completable>,

    handle: Handle,

    /// Index of the worker that last ran this task. Completions always fire
    /// on this worker's thread; wakes from there go to its local queue.
    home: AtomicUsize,

    /// Kernel operations submitted for this task that have not yet produced
    /// their terminal completion. A cancelled task is only short-circuited
    /// once this reaches zero, so a suspension frame is never destroyed with
    /// a live kernel operation pointing into it.
    pending_ops: AtomicU32,

    /// The (worker, tag) pairs behind `pending_ops`, for targeted
    /// cancellation.
    in_flight: Mutex<SmallVec<[OpRef; 1]>>,
}

impl Wake for TaskCell {
    fn wake(self: Arc<Self>) {
        Task { cell: self }.wake();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Task { cell: self.clone() }.wake();
    }
}

/// A reference to a task cell. Clones are cheap; the cell is dropped when the
/// last queue slot, registry entry, waker and handle let go of it.
#[derive(Clone)]
pub(crate) struct Task {
    cell: Arc<TaskCell>,
}

impl Task {
    pub(crate) fn new(
        id: Id,
        future: Pin<Box<dyn Future<Output = ()> + Send>>,
        join: Arc<dyn Completable>,
        handle: Handle,
    ) -> Self {
        Self {
            cell: Arc::new(TaskCell {
                id,
                state: State::new(),
                future: Mutex::new(Some(future)),
                join,
                handle,
                home: AtomicUsize::new(NO_HOME),
                pending_ops: AtomicU32::new(0),
                in_flight: Mutex::new(SmallVec::new()),
            }),
        }
    }

    pub(crate) fn id(&self) -> Id {
        self.cell.id
    }

    pub(crate) fn state(&self) -> &State {
        &self.cell.state
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::from(self.cell.clone())
    }

    pub(crate) fn set_home(&self, worker: usize) {
        self.cell.home.store(worker, Ordering::Relaxed);
    }

    /// Drives the task one step: to completion, to a suspension point, or
    /// straight to `Cancelled` if a cancellation request is observable and no
    /// kernel operation is still in flight.
    pub(crate) fn run(&self) {
        if self.cell.state.is_cancel_requested()
            && self.cell.pending_ops.load(Ordering::Acquire) == 0
        {
            self.finish(JoinError::cancelled());
            return;
        }

        if !self.cell.state.transition_to_running() {
            // Stale queue entry; the task reached a terminal state elsewhere.
            return;
        }

        let waker = self.waker();
        let mut cx = Context::from_waker(&waker);

        let mut frame = self.cell.future.lock();
        let Some(future) = frame.as_mut() else {
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => {
                // The wrapped future stored its output in the join slot.
                *frame = None;
                drop(frame);
                self.cell.state.transition_to_completed();
                self.cell.handle.shared.owned.remove(&self.cell.id);
            }
            Ok(Poll::Pending) => {
                drop(frame);
                if let Suspend::Reschedule = self.cell.state.transition_to_suspended() {
                    self.schedule();
                }
            }
            Err(payload) => {
                // The panic poisons only this task; the join slot carries the
                // payload and the worker keeps running.
                *frame = None;
                drop(frame);
                self.cell.state.transition_to_completed();
                self.cell.join.complete_err(JoinError::panic(payload));
                self.cell.handle.shared.owned.remove(&self.cell.id);
                tracing::debug!(task = %self.cell.id, "task panicked");
            }
        }
    }

    /// Idempotent. `SuspendedOnIo -> Scheduled` plus an enqueue; a no-op in
    /// every other state.
    pub(crate) fn wake(&self) {
        if let WakeOutcome::Enqueue = self.cell.state.wake() {
            self.schedule();
        }
    }

    /// Enqueues the task: into the home worker's local queue when invoked on
    /// that worker's thread (the completion path), otherwise into the global
    /// queue with an unpark.
    pub(crate) fn schedule(&self) {
        let home = self.cell.home.load(Ordering::Relaxed);
        let pushed_local = context::try_with_core(|core| {
            if core.index == home && Arc::ptr_eq(&core.handle.shared, &self.cell.handle.shared) {
                core.run_queue
                    .borrow_mut()
                    .push_back(self.clone(), &*self.cell.handle.shared);
                true
            } else {
                false
            }
        })
        .unwrap_or(false);

        if !pushed_local {
            self.cell.handle.shared.push_remote(self.clone());
        }
    }

    /// Requests cooperative cancellation: sets the flag, submits a
    /// cancellation for any in-flight kernel operation, and wakes the task so
    /// the next resume observes the flag.
    pub(crate) fn cancel(&self) {
        if !self.cell.state.request_cancel() {
            return;
        }
        let ops: SmallVec<[OpRef; 1]> = self.cell.in_flight.lock().clone();
        for op in ops {
            self.cell.handle.shared.cancel_op(op);
        }
        self.wake();
    }

    /// Shutdown-path resolution: the task never runs again; its handle
    /// resolves `Cancelled`. The frame is released lazily with the last
    /// reference.
    pub(crate) fn resolve_shutdown(&self) {
        if self.cell.state.is_terminal() {
            return;
        }
        self.cell.state.transition_to_cancelled();
        self.cell.join.complete_err(JoinError::cancelled());
    }

    /// Spawn-after-shutdown: refused before ever being enqueued.
    pub(crate) fn reject_shutdown(&self) {
        self.cell.state.transition_to_cancelled();
        self.cell.join.complete_err(JoinError::shutdown());
    }

    fn finish(&self, err: JoinError) {
        let frame = self.cell.future.lock().take();
        // Dropping the frame releases any completed-but-unconsumed
        // descriptors before the terminal state is published.
        drop(frame);
        self.cell.state.transition_to_cancelled();
        self.cell.join.complete_err(err);
        self.cell.handle.shared.owned.remove(&self.cell.id);
    }

    // --- in-flight operation bookkeeping (called from the op module) ---

    pub(crate) fn op_registered(&self, op: OpRef) {
        self.cell.pending_ops.fetch_add(1, Ordering::AcqRel);
        self.cell.in_flight.lock().push(op);
    }

    /// The descriptor no longer references the operation (consumed or
    /// dropped). The pending count is owned by the completion path.
    pub(crate) fn op_detached(&self, op: OpRef) {
        let mut in_flight = self.cell.in_flight.lock();
        if let Some(pos) = in_flight.iter().position(|o| *o == op) {
            in_flight.swap_remove(pos);
        }
    }

    /// The kernel posted the terminal completion for `op` on its home ring.
    pub(crate) fn op_completed(&self, op: OpRef) {
        self.op_detached(op);
        let prev = self.cell.pending_ops.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pending op count underflow");
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.cell.id)
            .field("state", &self.cell.state.lifecycle())
            .finish()
    }
}
