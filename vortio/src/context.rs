//! Thread-local worker core.
//!
//! Each worker thread owns exactly one `Core`: its local run queue, its
//! poller, and the task currently being polled. Everything here is
//! single-thread state behind `RefCell`s; cross-thread interaction goes
//! through `runtime::shared` instead.

// Keep unused context accessors around as API for future modules.
#![allow(dead_code)]

use crate::poller::Poller;
use crate::runtime::queue::Local;
use crate::runtime::shared::Handle;
use crate::task::{OpRef, Task};
use anyhow::{Result, bail};
use std::cell::RefCell;

pub(crate) struct Core {
    /// This worker's index. Worker 0 is the thread that built the runtime.
    pub(crate) index: usize,

    pub(crate) handle: Handle,

    pub(crate) run_queue: RefCell<Local<Task>>,

    pub(crate) poller: RefCell<Poller>,

    /// The task currently being polled on this thread, if any.
    pub(crate) current_task: RefCell<Option<Task>>,
}

thread_local! {
    static CORE: RefCell<Option<Core>> = const { RefCell::new(None) };
}

pub(crate) fn init_core(core: Core) -> Result<()> {
    CORE.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            bail!("a runtime worker context is already active on this thread");
        }
        *slot = Some(core);
        Ok(())
    })
}

/// Tears down this thread's core. Called when a runtime built on this thread
/// is dropped, so the thread can host another runtime later.
pub(crate) fn clear_core() {
    CORE.with(|slot| {
        slot.borrow_mut().take();
    });
}

#[track_caller]
pub(crate) fn with_core<F, R>(f: F) -> R
where
    F: FnOnce(&Core) -> R,
{
    CORE.with(|slot| {
        let slot = slot.borrow();
        let core = slot
            .as_ref()
            .expect("not on a vortio runtime worker thread");
        f(core)
    })
}

pub(crate) fn try_with_core<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Core) -> R,
{
    CORE.with(|slot| slot.borrow().as_ref().map(f))
}

#[track_caller]
pub(crate) fn with_poller_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut Poller) -> R,
{
    with_core(|core| f(&mut core.poller.borrow_mut()))
}

pub(crate) fn worker_index() -> Option<usize> {
    try_with_core(|core| core.index)
}

pub(crate) fn current_handle() -> Option<Handle> {
    try_with_core(|core| core.handle.clone())
}

pub(crate) fn current_task() -> Option<Task> {
    try_with_core(|core| core.current_task.borrow().clone()).flatten()
}

pub(crate) fn set_current_task(task: Option<Task>) -> Option<Task> {
    with_core(|core| core.current_task.replace(task))
}

/// Routes a cancellation for an in-flight operation: straight onto the ring
/// when invoked on the owning worker, through its mailbox otherwise. Outside
/// any runtime thread the request is dropped; the operation's terminal
/// completion still retires its tag.
pub(crate) fn cancel_on(op: OpRef) {
    let routed = try_with_core(|core| {
        if core.index == op.worker {
            core.poller.borrow_mut().push_cancel(op.tag as u64);
        } else {
            core.handle.shared.cancel_op(op);
        }
    });
    if routed.is_none() {
        tracing::debug!(?op, "dropping cancel request outside runtime context");
    }
}
