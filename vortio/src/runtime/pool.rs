//! Worker thread spawning.

use crate::context::{self, Core};
use crate::poller::Poller;
use crate::runtime::queue::Local;
use crate::runtime::shared::Handle;
use crate::runtime::worker::Worker;
use crate::task::Task;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::{Arc, Barrier};
use std::thread;

pub(crate) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns workers `1..num_workers`; the caller's thread is worker 0.
    /// Returns once every spawned worker has initialized its ring and is
    /// inside its event loop barrier.
    pub(crate) fn spawn(handle: &Handle, locals: Vec<Local<Task>>) -> Result<ThreadPool> {
        let num_spawned = locals.len();
        let barrier = Arc::new(Barrier::new(num_spawned + 1));

        let handles = locals
            .into_iter()
            .enumerate()
            .map(|(i, local)| {
                // Worker 0's queue was consumed by the root core.
                let index = i + 1;
                spawn_worker_thread(handle.clone(), index, local, barrier.clone())
            })
            .collect::<Result<Vec<_>>>()?;

        // Thread startup is asynchronous; wait until every ring exists so
        // spawns and steals observe a fully formed pool.
        barrier.wait();

        Ok(ThreadPool {
            handles: Mutex::new(handles),
        })
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let panicked = handles
            .into_iter()
            .map(|handle| handle.join())
            .filter(|result| result.is_err())
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{panicked} worker thread(s) panicked"))
        }
    }
}

fn spawn_worker_thread(
    handle: Handle,
    index: usize,
    run_queue: Local<Task>,
    barrier: Arc<Barrier>,
) -> Result<thread::JoinHandle<()>> {
    let cfg = &handle.shared.cfg;
    let mut builder = thread::Builder::new().name(format!("{}-{index}", cfg.thread_name));
    if let Some(stack_size) = cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let join = builder.spawn(move || {
        let unpark = handle.shared.remotes[index].unpark.clone();
        let poller = match Poller::try_new(&handle.shared.cfg, index, unpark) {
            Ok(poller) => poller,
            Err(err) => {
                tracing::error!(worker = index, %err, "failed to create worker ring");
                barrier.wait();
                return;
            }
        };

        let core = Core {
            index,
            handle: handle.clone(),
            run_queue: RefCell::new(run_queue),
            poller: RefCell::new(poller),
            current_task: RefCell::new(None),
        };
        if let Err(err) = context::init_core(core) {
            tracing::error!(worker = index, %err, "failed to initialize worker context");
            barrier.wait();
            return;
        }
        barrier.wait();

        if let Err(err) = Worker::new(index, handle).run(None) {
            tracing::error!(worker = index, %err, "worker event loop failed");
            debug_assert!(false, "worker event loop failed");
        }
    })?;

    Ok(join)
}
