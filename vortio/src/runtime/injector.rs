//! The shared global queue.
//!
//! Many-producer, many-consumer FIFO. Workers visit it every
//! `check_global_interval` ticks and never drain it in one visit; fairness
//! caps each visit at `ceil(len / num_workers)` entries.

use crate::task::Task;
use crossbeam_deque::{Injector, Steal};

pub(crate) struct GlobalQueue {
    queue: Injector<Task>,
}

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Injector::new(),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        self.queue.push(task);
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        loop {
            match self.queue.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(GlobalQueue: Send, Sync);
}
