//! The per-worker event loop.
//!
//! One pass per tick, in a fixed order: forced completion drain on the io
//! interval, a global-queue visit on the global interval, then local pop →
//! global batch → steal sweep. A worker with nothing to run flushes its
//! submissions and parks on its completion ring.

use crate::context;
use crate::runtime::queue;
use crate::runtime::shared::Handle;
use crate::runtime::ticker::{Ticker, TickerEvents};
use crate::task::Task;
use anyhow::Result;
use std::time::{Duration, Instant};

/// Upper bound on a park so a missed unpark can only delay shutdown, never
/// wedge it.
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a worker keeps draining in-flight completions at shutdown after
/// submitting cancel-all.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) struct Worker {
    index: usize,
    handle: Handle,

    /// Peer steal handles, shuffled at construction so the workers' sweep
    /// orders differ and contention spreads.
    stealers: Vec<queue::Steal<Task>>,

    ticker: Ticker,
    check_io_interval: u32,
    check_global_interval: u32,

    /// Set on the global interval; consumed by the next `find_task`.
    pop_global: bool,
}

impl Worker {
    pub(crate) fn new(index: usize, handle: Handle) -> Self {
        let mut stealers: Vec<_> = handle
            .shared
            .remotes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, remote)| remote.steal.clone())
            .collect();
        fastrand::shuffle(&mut stealers);

        let cfg = &handle.shared.cfg;
        let (check_io_interval, check_global_interval) =
            (cfg.check_io_interval, cfg.check_global_interval);

        Self {
            index,
            handle,
            stealers,
            ticker: Ticker::new(),
            check_io_interval,
            check_global_interval,
            pop_global: false,
        }
    }

    /// Runs the event loop until shutdown, or until `until` reports done
    /// (the root-task path on worker 0, which leaves the runtime alive).
    pub(crate) fn run(&mut self, mut until: Option<&mut dyn FnMut() -> bool>) -> Result<()> {
        tracing::debug!(worker = self.index, "worker loop started");
        loop {
            if let Some(until) = until.as_mut()
                && until()
            {
                return Ok(());
            }

            let events = self.tick();
            if events.contains(TickerEvents::SHUTDOWN) {
                break;
            }

            if events.contains(TickerEvents::POLL_COMPLETIONS) {
                self.process_cancel_mailbox();
                context::with_core(|core| {
                    let mut poller = core.poller.borrow_mut();
                    if let Err(err) = poller.flush() {
                        tracing::warn!(worker = self.index, %err, "submission flush failed");
                    }
                    poller.drain(None);
                });
            }
            if events.contains(TickerEvents::POP_GLOBAL) {
                self.pop_global = true;
            }

            if let Some(task) = self.find_task() {
                self.run_task(task);
                continue;
            }

            // Full sweep came up empty: flush and block on the ring.
            if self.handle.shared.is_shutdown() {
                break;
            }
            self.park()?;
        }

        self.shutdown();
        Ok(())
    }

    fn tick(&mut self) -> TickerEvents {
        if self.handle.shared.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        let tick = self.ticker.next();
        let mut events = TickerEvents::empty();
        if tick.is_multiple_of(self.check_io_interval) {
            events |= TickerEvents::POLL_COMPLETIONS;
        }
        if tick.is_multiple_of(self.check_global_interval) {
            events |= TickerEvents::POP_GLOBAL;
        }
        events
    }

    fn run_task(&self, task: Task) {
        task.set_home(self.index);
        let prev = context::set_current_task(Some(task.clone()));
        task.run();
        context::set_current_task(prev);
    }

    /// Task selection order: the periodic global visit, then the local
    /// queue, then a global batch, then one steal attempt per peer.
    fn find_task(&mut self) -> Option<Task> {
        if std::mem::take(&mut self.pop_global)
            && let Some(task) = self.pull_from_global()
        {
            return Some(task);
        }

        context::with_core(|core| core.run_queue.borrow_mut().pop())
            .or_else(|| self.pull_from_global())
            .or_else(|| self.steal_from_peers())
    }

    /// Takes at most `ceil(len / num_workers)` tasks from the global queue,
    /// bounded by local spare capacity: one to run, the rest enqueued
    /// locally.
    fn pull_from_global(&self) -> Option<Task> {
        let shared = &self.handle.shared;
        let len = shared.injector.len();
        if len == 0 {
            return None;
        }
        let quota = len.div_ceil(shared.cfg.num_workers);

        context::with_core(|core| {
            let mut queue = core.run_queue.borrow_mut();
            let quota = quota.min(queue.spare_capacity()).max(1);

            let first = shared.injector.pop()?;
            for _ in 1..quota {
                match shared.injector.pop() {
                    Some(task) => queue.push_back(task, &**shared),
                    None => break,
                }
            }
            Some(first)
        })
    }

    /// Tries each peer at most once, starting at a random position.
    fn steal_from_peers(&self) -> Option<Task> {
        if self.stealers.is_empty() {
            return None;
        }
        context::with_core(|core| {
            let mut queue = core.run_queue.borrow_mut();
            let start = fastrand::usize(..self.stealers.len());
            for i in 0..self.stealers.len() {
                let stealer = &self.stealers[(start + i) % self.stealers.len()];
                if let Some(task) = stealer.steal_into(&mut queue) {
                    tracing::trace!(worker = self.index, "stole work from a peer");
                    return Some(task);
                }
            }
            None
        })
    }

    fn park(&self) -> Result<()> {
        let shared = &self.handle.shared;
        shared.park_enter(self.index);

        // Re-check after publishing the parked state: a task enqueued
        // between our sweep and here would otherwise miss its unpark.
        let res = if shared.injector.is_empty() && !shared.is_shutdown() {
            context::with_core(|core| core.poller.borrow_mut().park(Some(PARK_TIMEOUT)))
        } else {
            Ok(())
        };

        shared.park_exit(self.index);
        self.process_cancel_mailbox();
        res
    }

    /// Submits the async-cancels peers have posted for this ring.
    fn process_cancel_mailbox(&self) {
        let tags = self.handle.shared.take_cancels(self.index);
        if tags.is_empty() {
            return;
        }
        context::with_core(|core| {
            let mut poller = core.poller.borrow_mut();
            for tag in tags {
                poller.push_cancel(tag);
            }
            if let Err(err) = poller.flush() {
                tracing::warn!(worker = self.index, %err, "cancel flush failed");
            }
        });
    }

    /// Shutdown path: cancel what is still in flight, drain until the ring
    /// quiesces or the deadline passes, then resolve every task left in the
    /// local queue.
    pub(crate) fn shutdown(&self) {
        self.process_cancel_mailbox();
        context::with_core(|core| {
            {
                let mut poller = core.poller.borrow_mut();
                poller.cancel_all();
                let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
                while poller.in_flight() > 0 && Instant::now() < deadline {
                    if poller.park(Some(Duration::from_millis(10))).is_err() {
                        break;
                    }
                }
                if poller.in_flight() > 0 {
                    tracing::warn!(
                        worker = self.index,
                        in_flight = poller.in_flight(),
                        "abandoning unfinished operations at shutdown"
                    );
                }

                // Retire the armed unpark read before the ring goes away.
                self.handle.shared.remotes[self.index].unpark.unpark();
                let _ = poller.park(Some(Duration::from_millis(10)));
            }

            let mut queue = core.run_queue.borrow_mut();
            while let Some(task) = queue.pop() {
                task.resolve_shutdown();
            }
        });
        tracing::debug!(worker = self.index, "worker exited");
    }
}
