//! Registry of live tasks.
//!
//! Tasks are bound at spawn and released on completion. Its job is the
//! shutdown path: once closed, new spawns are refused, and every task still
//! registered (queued anywhere or suspended on I/O) can be resolved
//! `Cancelled` so no JoinHandle is left dangling.

use crate::task::{Id, Task};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindResult {
    Ok,
    Shutdown,
}

pub(crate) struct OwnedTasks {
    tasks: DashMap<Id, Task>,
    closed: AtomicBool,
}

impl OwnedTasks {
    pub(crate) fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn bind(&self, task: Task) -> BindResult {
        if self.closed.load(Ordering::Acquire) {
            return BindResult::Shutdown;
        }
        let id = task.id();
        self.tasks.insert(id, task);
        // Close may have raced the insert; make the close win.
        if self.closed.load(Ordering::Acquire) {
            self.tasks.remove(&id);
            return BindResult::Shutdown;
        }
        BindResult::Ok
    }

    pub(crate) fn remove(&self, id: &Id) -> Option<Task> {
        self.tasks.remove(id).map(|(_, task)| task)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves every task still registered. Call after the workers have
    /// exited; `close()` must already have happened.
    pub(crate) fn shutdown_all(&self) {
        debug_assert!(self.is_closed());
        loop {
            let ids: Vec<Id> = self.tasks.iter().map(|entry| *entry.key()).collect();
            if ids.is_empty() {
                return;
            }
            for id in ids {
                if let Some((_, task)) = self.tasks.remove(&id) {
                    task.resolve_shutdown();
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}
