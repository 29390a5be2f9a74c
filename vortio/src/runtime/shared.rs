//! State shared by every worker of one runtime, plus the cross-thread
//! channels into a worker: the eventfd unparker and the cancel mailbox.
//!
//! A worker's poller is single-owner; peers interact with it only through
//! these two channels.

use crate::context;
use crate::runtime::RuntimeConfig;
use crate::runtime::injector::GlobalQueue;
use crate::runtime::queue::{self, Overflow};
use crate::runtime::registry::{BindResult, OwnedTasks};
use crate::task::{self, JoinHandle, OpRef, Task};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cheap cloneable reference to a runtime's shared state. The thread-local
/// worker context carries one, which is how `spawn` finds its runtime.
#[derive(Clone)]
pub(crate) struct Handle {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,

    /// The global injector queue.
    pub(crate) injector: GlobalQueue,

    /// One entry per worker: its steal handle, unparker and cancel mailbox.
    pub(crate) remotes: Box<[Remote]>,

    /// Every live task, for shutdown resolution.
    pub(crate) owned: OwnedTasks,

    pub(crate) shutdown: AtomicBool,

    /// Indices of currently parked workers.
    parked: Mutex<Vec<usize>>,
}

pub(crate) struct Remote {
    pub(crate) steal: queue::Steal<Task>,
    pub(crate) unpark: Unparker,

    /// Tags whose cancellation must be submitted on this worker's ring.
    /// Only the owning worker submits SQEs, so peers post here and unpark.
    cancels: Mutex<Vec<u64>>,
}

impl Shared {
    pub(crate) fn new(cfg: RuntimeConfig, steals: Vec<queue::Steal<Task>>) -> io::Result<Self> {
        let remotes = steals
            .into_iter()
            .map(|steal| {
                Ok(Remote {
                    steal,
                    unpark: Unparker::new()?,
                    cancels: Mutex::new(Vec::new()),
                })
            })
            .collect::<io::Result<Vec<_>>>()?
            .into_boxed_slice();

        Ok(Self {
            cfg,
            injector: GlobalQueue::new(),
            remotes,
            owned: OwnedTasks::new(),
            shutdown: AtomicBool::new(false),
            parked: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Global enqueue with the happens-before edge the spec requires: the
    /// push precedes the unpark, so the woken worker observes the task.
    pub(crate) fn push_remote(&self, task: Task) {
        self.injector.push(task);
        self.unpark_one();
    }

    pub(crate) fn unpark_one(&self) {
        let idx = self.parked.lock().pop();
        if let Some(idx) = idx {
            self.remotes[idx].unpark.unpark();
        }
    }

    pub(crate) fn unpark_worker(&self, index: usize) {
        self.parked.lock().retain(|&i| i != index);
        self.remotes[index].unpark.unpark();
    }

    pub(crate) fn unpark_all(&self) {
        self.parked.lock().clear();
        for remote in &self.remotes {
            remote.unpark.unpark();
        }
    }

    pub(crate) fn park_enter(&self, index: usize) {
        self.parked.lock().push(index);
    }

    pub(crate) fn park_exit(&self, index: usize) {
        self.parked.lock().retain(|&i| i != index);
    }

    /// Routes a cancellation for an in-flight operation to the ring that
    /// carries it: directly when called on that worker, via its mailbox
    /// otherwise.
    pub(crate) fn cancel_op(&self, op: OpRef) {
        let direct = context::try_with_core(|core| {
            if core.index == op.worker && std::ptr::eq(Arc::as_ptr(&core.handle.shared), self) {
                core.poller.borrow_mut().push_cancel(op.tag as u64);
                true
            } else {
                false
            }
        })
        .unwrap_or(false);

        if !direct {
            self.remotes[op.worker].cancels.lock().push(op.tag as u64);
            self.unpark_worker(op.worker);
        }
    }

    pub(crate) fn take_cancels(&self, index: usize) -> Vec<u64> {
        std::mem::take(&mut *self.remotes[index].cancels.lock())
    }
}

// Local-queue overflow lands in the global queue; like any global enqueue it
// wakes a parked worker so the detached batch is picked up promptly.
impl Overflow<Task> for Shared {
    fn push_batch(&self, batch: impl Iterator<Item = Task>) {
        for task in batch {
            self.injector.push(task);
        }
        self.unpark_one();
    }
}

impl Handle {
    /// Creates and enqueues a task for `future`, returning its join handle.
    ///
    /// Called on a worker thread of this runtime, the task lands in that
    /// worker's local queue (overflowing into the global queue); from any
    /// other thread it lands in the global queue and one parked worker is
    /// woken. After shutdown the task is refused and the handle resolves
    /// with a shutdown error.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (task, join_handle) = task::new_task(future, self.clone());

        if let BindResult::Shutdown = self.shared.owned.bind(task.clone()) {
            tracing::warn!(task = %task.id(), "refusing spawn after shutdown");
            task.reject_shutdown();
            return join_handle;
        }

        task.state().transition_to_scheduled();

        let pushed_local = context::try_with_core(|core| {
            if Arc::ptr_eq(&core.handle.shared, &self.shared) {
                task.set_home(core.index);
                core.run_queue
                    .borrow_mut()
                    .push_back(task.clone(), &*self.shared);
                true
            } else {
                false
            }
        })
        .unwrap_or(false);

        if !pushed_local {
            self.shared.push_remote(task);
        }

        join_handle
    }
}

/// Cross-thread nudge for a parked worker. The worker keeps a read of this
/// eventfd armed on its ring; writing the counter completes that read, which
/// the poller treats as a no-op completion.
#[derive(Clone)]
pub(crate) struct Unparker {
    fd: Arc<OwnedFd>,
}

impl Unparker {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }),
        })
    }

    pub(crate) fn unpark(&self) {
        let one: u64 = 1;
        let res = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                std::ptr::from_ref(&one).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            // A saturated counter still wakes the reader.
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(%err, "eventfd unpark write failed");
            }
        }
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Handle: Send, Sync, Clone);
    assert_impl_all!(Shared: Send, Sync);

    #[test]
    fn test_unparker_write_and_drain() {
        let unparker = Unparker::new().unwrap();
        unparker.unpark();
        unparker.unpark();

        // The eventfd counter accumulated both nudges.
        let mut buf = 0u64;
        let res = unsafe {
            libc::read(
                unparker.as_raw_fd(),
                std::ptr::from_mut(&mut buf).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(res, 8);
        assert_eq!(buf, 2);
    }
}
