//! The per-worker poller: one `io_uring` instance, its tag table, and the
//! eventfd unpark channel.
//!
//! Only the owning worker submits to or drains this ring. Submissions are
//! flushed lazily: entries accumulate in the submission queue until the
//! worker parks, the ring fills, or an interval tick forces a flush.

use crate::op::IoError;
use crate::runtime::RuntimeConfig;
use crate::runtime::runtime::IoUringFlags;
use crate::runtime::shared::Unparker;
use crate::task::{OpRef, Task};
use anyhow::Result;
use io_uring::squeue::Entry;
use io_uring::types::{SubmitArgs, Timespec};
use io_uring::{IoUring, opcode, types};
use std::io;
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

pub(crate) mod slots;
pub(crate) use slots::{OpCompletion, OpSlot, OpSlots};

/// user_data of the armed eventfd read; never a table tag.
const UNPARK_TOKEN: u64 = u64::MAX;

/// Reserved sparse fixed-file table registered at ring setup.
const FIXED_FILES_NUM: u32 = 10;

pub(crate) struct Poller {
    ring: IoUring,
    slots: OpSlots,

    /// This worker's index, stamped into every registered op.
    worker: usize,

    unpark: Unparker,

    /// Read target of the armed eventfd op. Boxed so its address survives
    /// the poller being moved.
    unpark_buf: Box<u64>,
    unpark_armed: bool,
}

impl Poller {
    pub(crate) fn try_new(cfg: &RuntimeConfig, worker: usize, unpark: Unparker) -> Result<Self> {
        let mut builder = IoUring::builder();
        // Keep submitting remaining entries when one fails mid-batch; errors
        // come back as CQEs and are handled at the descriptor.
        builder.setup_submit_all();

        let flags = cfg.io_uring_flags;
        if flags.contains(IoUringFlags::SQPOLL) {
            builder.setup_sqpoll(2_000);
        }
        if flags.contains(IoUringFlags::SINGLE_ISSUER) {
            builder.setup_single_issuer();
        }
        if flags.contains(IoUringFlags::COOP_TASKRUN) {
            builder.setup_coop_taskrun();
        }
        if flags.contains(IoUringFlags::DEFER_TASKRUN) {
            builder.setup_defer_taskrun();
        }

        let ring = builder.build(cfg.ring_entries)?;

        if !ring.params().is_feature_nodrop() {
            tracing::warn!(
                "IORING_FEAT_NODROP is not available; the kernel may drop completions when the CQ ring is full"
            );
        }

        // Reserved table for fixed-file registration.
        if let Err(err) = ring.submitter().register_files_sparse(FIXED_FILES_NUM) {
            tracing::debug!(%err, "sparse fixed-file registration unavailable");
        }

        Ok(Self {
            ring,
            slots: OpSlots::new(cfg.ring_entries as usize),
            worker,
            unpark,
            unpark_buf: Box::new(0),
            unpark_armed: false,
        })
    }

    /// Registers a prepared operation: reserves a tag, installs the waker
    /// and result slot, and pushes the SQE. On any failure the tag is
    /// released before the error is returned, so failed submissions never
    /// leak table entries.
    pub(crate) fn register(
        &mut self,
        entry: Entry,
        waker: &Waker,
        task: Option<Task>,
    ) -> Result<(OpRef, Arc<OpCompletion>), IoError> {
        let completion = Arc::new(OpCompletion::new());
        let tag = self.slots.insert(OpSlot::Wake {
            completion: completion.clone(),
            waker: waker.clone(),
            task,
        })?;

        let entry = entry.user_data(tag as u64);
        if let Err(err) = self.push(&entry) {
            self.slots.remove(tag);
            return Err(err);
        }

        Ok((
            OpRef {
                worker: self.worker,
                tag,
            },
            completion,
        ))
    }

    /// Pushes an entry, flushing the ring once if it is full. A ring that is
    /// full after a flush fails the push without reaching the kernel.
    fn push(&mut self, entry: &Entry) -> Result<(), IoError> {
        if unsafe { self.ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }
        self.flush()?;
        unsafe { self.ring.submission().push(entry) }.map_err(|_| IoError::SubmissionFull)
    }

    /// Queues an async-cancel for `target_tag` on this ring. Best effort:
    /// cancellation entries take their own (headroom) tag, and the terminal
    /// completion of the target operation is what retires the target tag.
    pub(crate) fn push_cancel(&mut self, target_tag: u64) {
        if self.slots.is_full() {
            tracing::debug!(target_tag, "tag table full, skipping cancel entry");
            return;
        }
        let Ok(tag) = self.slots.insert(OpSlot::Ignore) else {
            return;
        };
        let entry = opcode::AsyncCancel::new(target_tag)
            .build()
            .user_data(tag as u64);
        if self.push(&entry).is_err() {
            self.slots.remove(tag);
            tracing::debug!(target_tag, "submission full, skipping cancel entry");
        }
    }

    /// Submits every queued async-cancel it can for the tags still waiting.
    pub(crate) fn cancel_all(&mut self) {
        for tag in self.slots.waiting_tags() {
            self.push_cancel(tag as u64);
        }
        let _ = self.flush();
    }

    /// Flushes pending submissions without waiting for completions.
    pub(crate) fn flush(&mut self) -> Result<(), IoError> {
        let to_submit = {
            let mut sq = self.ring.submission();
            if sq.is_empty() {
                return Ok(());
            }
            sq.sync();
            sq.len()
        };

        match self.ring.submitter().submit() {
            Ok(submitted) => {
                tracing::trace!(worker = self.worker, submitted, queued = to_submit, "flushed");
                Ok(())
            }
            Err(err) if err.raw_os_error() == Some(libc::EBUSY) => Ok(()),
            Err(err) => Err(IoError::Io(err)),
        }
    }

    /// Processes ready completions: writes each raw result into its
    /// descriptor's slot, settles the owning task's in-flight count, fires
    /// the waker, and releases the tag. One pass over the queue; the kernel's
    /// posting order is preserved. Returns the number of descriptor
    /// completions handled.
    pub(crate) fn drain(&mut self, budget: Option<usize>) -> usize {
        let budget = budget.unwrap_or(usize::MAX);
        let mut handled = 0;

        let mut cq = self.ring.completion();
        cq.sync();

        for cqe in &mut cq {
            if cqe.user_data() == UNPARK_TOKEN {
                self.unpark_armed = false;
                continue;
            }

            let tag = cqe.user_data() as usize;
            match self.slots.remove(tag) {
                Some(OpSlot::Wake {
                    completion,
                    waker,
                    task,
                }) => {
                    completion.fulfill(cqe.result());
                    if let Some(task) = task {
                        task.op_completed(OpRef {
                            worker: self.worker,
                            tag,
                        });
                    }
                    waker.wake();
                    handled += 1;
                    if handled >= budget {
                        break;
                    }
                }
                Some(OpSlot::Ignore) => {}
                None => {
                    tracing::warn!(tag, result = cqe.result(), "completion for unknown tag");
                }
            }
        }

        handled
    }

    /// Flushes submissions and blocks until at least one completion is
    /// available, an unpark nudge arrives, or the timeout elapses; then
    /// drains whatever is ready.
    pub(crate) fn park(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.arm_unpark();

        {
            let mut sq = self.ring.submission();
            sq.sync();
        }

        let res = if let Some(timeout) = timeout {
            let ts = Timespec::from(timeout);
            let args = SubmitArgs::new().timespec(&ts);
            self.ring.submitter().submit_with_args(1, &args)
        } else {
            self.ring.submitter().submit_and_wait(1)
        };

        match res {
            Ok(_) => {}
            Err(err) if is_wait_interrupted(&err) => {}
            Err(err) => return Err(err.into()),
        }

        self.drain(None);
        Ok(())
    }

    /// Keeps a read of the unpark eventfd in flight so peers can interrupt a
    /// blocked `park`. Its completion is a no-op carrying `UNPARK_TOKEN`.
    fn arm_unpark(&mut self) {
        if self.unpark_armed {
            return;
        }
        let buf: *mut u64 = &mut *self.unpark_buf;
        let entry = opcode::Read::new(
            types::Fd(self.unpark.as_raw_fd()),
            buf.cast::<u8>(),
            std::mem::size_of::<u64>() as u32,
        )
        .build()
        .user_data(UNPARK_TOKEN);

        match self.push(&entry) {
            Ok(()) => self.unpark_armed = true,
            // The park timeout bounds the damage of a missed arm.
            Err(err) => tracing::warn!(%err, "failed to arm unpark read"),
        }
    }

    /// Tags still awaiting their terminal completion.
    pub(crate) fn in_flight(&self) -> usize {
        self.slots.in_flight()
    }
}

fn is_wait_interrupted(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_waker;
    use rstest::rstest;

    fn test_poller(ring_entries: u32) -> Poller {
        let cfg = RuntimeConfig {
            ring_entries,
            ..RuntimeConfig::for_tests()
        };
        Poller::try_new(&cfg, 0, Unparker::new().unwrap()).unwrap()
    }

    #[test]
    fn test_nop_completes_and_wakes_once() {
        let mut poller = test_poller(8);
        let (waker, count) = mock_waker();

        let (op, completion) = poller
            .register(opcode::Nop::new().build(), &waker, None)
            .unwrap();
        assert_eq!(op.worker, 0);
        assert_eq!(poller.in_flight(), 1);
        assert!(!completion.is_ready());

        poller.park(Some(Duration::from_secs(1))).unwrap();

        assert!(completion.is_ready());
        assert_eq!(completion.result(), 0);
        assert_eq!(count.count(), 1);
        // The tag was released at completion time.
        assert_eq!(poller.in_flight(), 0);
    }

    #[rstest]
    #[case::one_op(1)]
    #[case::batch(5)]
    fn test_drain_handles_all_ready_completions(#[case] n: usize) {
        let mut poller = test_poller(16);
        let (waker, count) = mock_waker();

        let completions: Vec<_> = (0..n)
            .map(|_| {
                poller
                    .register(opcode::Nop::new().build(), &waker, None)
                    .unwrap()
                    .1
            })
            .collect();

        for _ in 0..10 {
            if completions.iter().all(|c| c.is_ready()) {
                break;
            }
            poller.park(Some(Duration::from_millis(100))).unwrap();
        }
        assert!(completions.iter().all(|c| c.is_ready()));
        assert_eq!(count.count(), n);
    }

    #[test]
    fn test_park_times_out_when_idle() {
        let mut poller = test_poller(8);
        let start = std::time::Instant::now();
        poller.park(Some(Duration::from_millis(20))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_unpark_interrupts_park() {
        let mut poller = test_poller(8);
        let unparker = poller.unpark.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            unparker.unpark();
        });

        let start = std::time::Instant::now();
        poller.park(Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_failed_registration_releases_tag() {
        let mut poller = test_poller(8);
        let (waker, _count) = mock_waker();

        // A bogus fd read fails at completion, not submission; fill the
        // table instead to exercise the error path.
        let mut held = Vec::new();
        loop {
            match poller.register(opcode::Nop::new().build(), &waker, None) {
                Ok(pair) => held.push(pair),
                Err(err) => {
                    assert_eq!(err, IoError::TagTableFull);
                    break;
                }
            }
        }
        let saturated = poller.in_flight();

        // Failing registration did not leak a tag.
        assert!(matches!(
            poller.register(opcode::Nop::new().build(), &waker, None),
            Err(IoError::TagTableFull)
        ));
        assert_eq!(poller.in_flight(), saturated);
    }
}
