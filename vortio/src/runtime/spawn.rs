//! Free-function spawning.

use crate::context;
use crate::task::JoinHandle;
use std::future::Future;

/// Spawns a new task onto the current runtime.
///
/// Called from a worker thread, the task lands in that worker's local queue
/// and overflows into the global queue; the runtime is discovered through
/// the thread-local worker context.
///
/// # Panics
///
/// Panics when called from a thread that is not a vortio worker. Use
/// [`Runtime::spawn`](crate::Runtime::spawn) to spawn from foreign threads.
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let handle = context::current_handle()
        .expect("spawn called from outside a vortio runtime; use Runtime::spawn");
    handle.spawn(future)
}
