//! The task lifecycle: spawn, schedule, run, suspend, resume, join.

use crate::runtime::shared::Handle;
use std::future::Future;
use std::sync::Arc;

// Public API
mod error;
pub use self::error::JoinError;

mod join;
pub use self::join::JoinHandle;
pub(crate) use self::join::JoinState;

pub mod id;
pub use self::id::Id;

mod state;

pub(crate) mod task;
pub(crate) use self::task::{OpRef, Task};

/// Builds a task from a user future. Two references come back: the `Task`
/// that goes to a queue and the registry, and the `JoinHandle` given to the
/// caller. The future is wrapped so its output lands in the shared join slot
/// on normal completion; error resolutions (cancel, shutdown, panic) go
/// through the type-erased join slot instead.
pub(crate) fn new_task<F>(future: F, handle: Handle) -> (Task, JoinHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let id = Id::next();
    let join = Arc::new(JoinState::new());

    let join_slot = join.clone();
    let wrapped = Box::pin(async move {
        let output = future.await;
        join_slot.complete(Ok(output));
    });

    let task = Task::new(id, wrapped, join.clone(), handle);
    let join_handle = JoinHandle::new(join, task.clone());
    (task, join_handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Task: Send, Sync);
    assert_impl_all!(JoinHandle<usize>: Send, Sync);
    assert_impl_all!(JoinError: Send, Sync);
}
