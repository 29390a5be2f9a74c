use std::sync::atomic::{AtomicU32, Ordering};

/// The task lifecycle, packed into the low bits of one atomic word.
///
/// ```text
/// Idle ──spawn──▶ Scheduled ──pop──▶ Running ──suspend──▶ SuspendedOnIo
///                    ▲                  │                      │
///                    └───── wake ───────┼──────────────────────┘
///                                       └──complete──▶ Completed / Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum Lifecycle {
    Idle = 0,
    Scheduled = 1,
    Running = 2,
    SuspendedOnIo = 3,
    Completed = 4,
    Cancelled = 5,
}

const LIFECYCLE_MASK: u32 = 0b111;

/// The task's waker fired while it was `Running`; re-enqueue instead of
/// suspending when the poll returns Pending.
const NOTIFIED: u32 = 1 << 3;

/// Cancellation was requested; observed by the worker before the next poll.
const CANCELLED: u32 = 1 << 4;

/// Outcome of a wake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The caller won the `SuspendedOnIo -> Scheduled` transition and must
    /// enqueue the task. At most one concurrent waker observes this.
    Enqueue,
    /// The wake was absorbed (already queued, running, or terminal).
    Ignored,
}

/// Outcome of a `Running -> SuspendedOnIo` transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspend {
    Parked,
    /// A wake arrived during the poll; the caller must re-enqueue the task.
    Reschedule,
}

#[derive(Debug)]
pub(crate) struct State(AtomicU32);

impl State {
    pub(crate) fn new() -> Self {
        Self(AtomicU32::new(Lifecycle::Idle as u32))
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        decode(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self.lifecycle(),
            Lifecycle::Completed | Lifecycle::Cancelled
        )
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.0.load(Ordering::Acquire) & CANCELLED != 0
    }

    /// `Idle -> Scheduled`, performed exactly once by spawn before the first
    /// enqueue.
    pub(crate) fn transition_to_scheduled(&self) {
        let prev = self.0.swap(Lifecycle::Scheduled as u32, Ordering::AcqRel);
        debug_assert_eq!(decode(prev), Lifecycle::Idle);
    }

    /// `Scheduled -> Running`. Returns false if the task reached a terminal
    /// state in the meantime (a stale queue entry).
    pub(crate) fn transition_to_running(&self) -> bool {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if decode(cur) != Lifecycle::Scheduled {
                return false;
            }
            let next = (cur & CANCELLED) | Lifecycle::Running as u32;
            match self
                .0
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// `Running -> SuspendedOnIo`, unless a wake arrived during the poll, in
    /// which case the task goes straight back to `Scheduled`.
    pub(crate) fn transition_to_suspended(&self) -> Suspend {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            // A shutdown racing the poll may have stored a terminal state;
            // leave it in place.
            if matches!(decode(cur), Lifecycle::Completed | Lifecycle::Cancelled) {
                return Suspend::Parked;
            }
            debug_assert_eq!(decode(cur), Lifecycle::Running);
            let (next, outcome) = if cur & NOTIFIED != 0 {
                (
                    (cur & CANCELLED) | Lifecycle::Scheduled as u32,
                    Suspend::Reschedule,
                )
            } else {
                (
                    (cur & CANCELLED) | Lifecycle::SuspendedOnIo as u32,
                    Suspend::Parked,
                )
            };
            match self
                .0
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return outcome,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Terminal transition. Monotonic: once stored, every later wake is a
    /// no-op.
    pub(crate) fn transition_to_completed(&self) {
        self.0
            .store(Lifecycle::Completed as u32, Ordering::Release);
    }

    pub(crate) fn transition_to_cancelled(&self) {
        self.0
            .store(CANCELLED | Lifecycle::Cancelled as u32, Ordering::Release);
    }

    /// Idempotent wake. Exactly one concurrent caller observes
    /// [`Wake::Enqueue`] per suspension.
    pub(crate) fn wake(&self) -> Wake {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let next = match decode(cur) {
                Lifecycle::SuspendedOnIo => (cur & CANCELLED) | Lifecycle::Scheduled as u32,
                Lifecycle::Running if cur & NOTIFIED == 0 => cur | NOTIFIED,
                _ => return Wake::Ignored,
            };
            match self
                .0
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return if decode(next) == Lifecycle::Scheduled {
                        Wake::Enqueue
                    } else {
                        Wake::Ignored
                    };
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Sets the cancellation request bit. Returns false if the task is
    /// already terminal, in which case the request has no effect.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if matches!(decode(cur), Lifecycle::Completed | Lifecycle::Cancelled) {
                return false;
            }
            match self.0.compare_exchange(
                cur,
                cur | CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}

fn decode(bits: u32) -> Lifecycle {
    match bits & LIFECYCLE_MASK {
        0 => Lifecycle::Idle,
        1 => Lifecycle::Scheduled,
        2 => Lifecycle::Running,
        3 => Lifecycle::SuspendedOnIo,
        4 => Lifecycle::Completed,
        5 => Lifecycle::Cancelled,
        bits => unreachable!("invalid lifecycle bits: {bits}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_run_suspend_wake_cycle() {
        let state = State::new();
        assert_eq!(state.lifecycle(), Lifecycle::Idle);

        state.transition_to_scheduled();
        assert!(state.transition_to_running());
        assert_eq!(state.transition_to_suspended(), Suspend::Parked);
        assert_eq!(state.lifecycle(), Lifecycle::SuspendedOnIo);

        // Exactly one wake wins; the second is absorbed.
        assert_eq!(state.wake(), Wake::Enqueue);
        assert_eq!(state.wake(), Wake::Ignored);
        assert_eq!(state.lifecycle(), Lifecycle::Scheduled);
    }

    #[test]
    fn test_wake_during_poll_forces_reschedule() {
        let state = State::new();
        state.transition_to_scheduled();
        assert!(state.transition_to_running());

        // Completion arrives while the task is mid-poll.
        assert_eq!(state.wake(), Wake::Ignored);
        assert_eq!(state.transition_to_suspended(), Suspend::Reschedule);
        assert_eq!(state.lifecycle(), Lifecycle::Scheduled);
    }

    #[test]
    fn test_terminal_is_monotonic() {
        let state = State::new();
        state.transition_to_scheduled();
        assert!(state.transition_to_running());
        state.transition_to_completed();

        assert_eq!(state.wake(), Wake::Ignored);
        assert!(!state.transition_to_running());
        assert!(!state.request_cancel());
        assert_eq!(state.lifecycle(), Lifecycle::Completed);
    }

    #[test]
    fn test_cancel_request_survives_transitions() {
        let state = State::new();
        state.transition_to_scheduled();
        assert!(state.request_cancel());
        assert!(state.is_cancel_requested());

        assert!(state.transition_to_running());
        assert!(state.is_cancel_requested());
        assert_eq!(state.transition_to_suspended(), Suspend::Parked);
        assert!(state.is_cancel_requested());

        state.transition_to_cancelled();
        assert_eq!(state.lifecycle(), Lifecycle::Cancelled);
        assert_eq!(state.wake(), Wake::Ignored);
    }
}
