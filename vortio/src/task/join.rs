use crate::task::error::JoinError;
use crate::task::id::Id;
use crate::task::task::Task;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

/// Type-erased view of a task's join slot, used by the runtime to resolve a
/// handle without knowing the output type (cancellation, shutdown, panics).
pub(crate) trait Completable: Send + Sync + 'static {
    /// Resolves the handle with an error unless it already completed.
    /// Returns true if this call performed the resolution.
    fn complete_err(&self, err: JoinError) -> bool;

    fn is_complete(&self) -> bool;
}

/// Shared slot between a task and its [`JoinHandle`].
pub(crate) struct JoinState<T> {
    slot: Mutex<Option<Result<T, JoinError>>>,
    waker: Mutex<Option<Waker>>,
    done: AtomicBool,
}

impl<T> JoinState<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            waker: Mutex::new(None),
            done: AtomicBool::new(false),
        }
    }

    /// Stores the result and wakes the joiner. Only the first call wins; a
    /// cancellation racing a normal completion resolves exactly once.
    pub(crate) fn complete(&self, result: Result<T, JoinError>) -> bool {
        {
            let mut slot = self.slot.lock();
            if self.done.load(Ordering::Acquire) {
                return false;
            }
            *slot = Some(result);
            self.done.store(true, Ordering::Release);
        }
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
        true
    }

    fn register_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match slot.as_ref() {
            Some(existing) if existing.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }
}

impl<T: Send + 'static> Completable for JoinState<T> {
    fn complete_err(&self, err: JoinError) -> bool {
        self.complete(Err(err))
    }

    fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// An owned handle to a spawned task.
///
/// Awaiting the handle yields the task's output, or a [`JoinError`] if the
/// task was cancelled, refused at shutdown, or panicked. Dropping the handle
/// detaches the task; it keeps running.
pub struct JoinHandle<T> {
    state: Arc<JoinState<T>>,
    task: Task,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(state: Arc<JoinState<T>>, task: Task) -> Self {
        Self { state, task }
    }

    /// The id of the task this handle joins.
    pub fn id(&self) -> Id {
        self.task.id()
    }

    /// Requests cooperative cancellation of the task.
    ///
    /// If the task is suspended on an in-flight kernel operation, a
    /// cancellation is submitted for it; the handle then resolves with
    /// [`JoinError::is_cancelled`] once the task observes the request. A task
    /// that already completed is unaffected.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Returns true once the task has reached a terminal state and the
    /// handle would resolve without suspending.
    pub fn is_finished(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    /// Registers an out-of-band completion waker (the root-task path).
    pub(crate) fn install_waker(&self, waker: &Waker) {
        self.state.register_waker(waker);
    }

    /// Takes the result without awaiting. Only valid once
    /// [`is_finished`](Self::is_finished) returns true.
    pub(crate) fn try_take_result(&self) -> Option<Result<T, JoinError>> {
        if !self.is_finished() {
            return None;
        }
        self.state.slot.lock().take()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.state.done.load(Ordering::Acquire) {
            self.state.register_waker(cx.waker());
            // Re-check after registering: the task may have completed between
            // the first load and the waker install.
            if !self.state.done.load(Ordering::Acquire) {
                return Poll::Pending;
            }
        }

        let result = self
            .state
            .slot
            .lock()
            .take()
            .expect("JoinHandle polled after completion");
        Poll::Ready(result)
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.task.id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_resolves_once() {
        let state: JoinState<u32> = JoinState::new();
        assert!(state.complete(Ok(7)));
        assert!(!state.complete(Ok(8)));
        assert!(!state.complete_err(JoinError::cancelled()));

        let result = state.slot.lock().take().unwrap();
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_complete_wakes_registered_waker() {
        let state: JoinState<()> = JoinState::new();
        let (waker, count) = crate::test_utils::mock_waker();
        state.register_waker(&waker);

        state.complete(Ok(()));
        assert_eq!(count.count(), 1);

        // Late error resolution neither re-wakes nor overwrites.
        assert!(!state.complete_err(JoinError::cancelled()));
        assert_eq!(count.count(), 1);
    }
}
