//! The tag table: maps each in-flight operation's tag to the waker and
//! result slot of the descriptor that submitted it.

use crate::op::IoError;
use crate::task::Task;
use slab::Slab;
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;

/// Headroom above `ring_entries` so cancellation entries can always be
/// tagged even when the table is saturated with regular operations.
const CANCEL_HEADROOM: usize = 64;

/// The descriptor-side completion cell. The poller (on the submitting
/// worker's thread) writes the raw kernel result exactly once and flips the
/// flag; the descriptor reads it after being woken, possibly on another
/// worker. The flag's release/acquire pair orders the result write.
pub(crate) struct OpCompletion {
    ready: AtomicBool,
    raw: UnsafeCell<i32>,
}

unsafe impl Send for OpCompletion {}
unsafe impl Sync for OpCompletion {}

impl OpCompletion {
    pub(crate) fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            raw: UnsafeCell::new(0),
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Reads the raw kernel result. Only valid after `is_ready()`.
    pub(crate) fn result(&self) -> i32 {
        debug_assert!(self.is_ready());
        unsafe { *self.raw.get() }
    }

    pub(crate) fn fulfill(&self, raw: i32) {
        unsafe {
            *self.raw.get() = raw;
        }
        self.ready.store(true, Ordering::Release);
    }
}

pub(crate) enum OpSlot {
    /// A live descriptor is waiting on this tag.
    Wake {
        completion: Arc<OpCompletion>,
        waker: Waker,
        /// The owning task, for in-flight accounting. Absent when an op is
        /// driven outside a task (tests, internal plumbing).
        task: Option<Task>,
    },
    /// The completion only retires the tag (cancellation entries).
    Ignore,
}

pub(crate) struct OpSlots {
    slots: Slab<OpSlot>,
    capacity: usize,
}

impl OpSlots {
    pub(crate) fn new(ring_entries: usize) -> Self {
        let capacity = ring_entries + CANCEL_HEADROOM;
        Self {
            slots: Slab::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn insert(&mut self, slot: OpSlot) -> Result<usize, IoError> {
        if self.slots.len() == self.capacity {
            return Err(IoError::TagTableFull);
        }
        Ok(self.slots.insert(slot))
    }

    pub(crate) fn remove(&mut self, tag: usize) -> Option<OpSlot> {
        self.slots.try_remove(tag)
    }

    /// Number of tags still awaiting their terminal completion.
    pub(crate) fn in_flight(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    /// Tags with a live descriptor attached, for shutdown's cancel-all pass.
    pub(crate) fn waiting_tags(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, OpSlot::Wake { .. }))
            .map(|(tag, _)| tag)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_waker;

    #[test]
    fn test_completion_cell_round_trip() {
        let cell = OpCompletion::new();
        assert!(!cell.is_ready());
        cell.fulfill(-libc::ETIME);
        assert!(cell.is_ready());
        assert_eq!(cell.result(), -libc::ETIME);
    }

    #[test]
    fn test_table_capacity_and_release() {
        let mut slots = OpSlots::new(2);
        let (waker, _count) = mock_waker();

        let tags: Vec<usize> = (0..2 + CANCEL_HEADROOM)
            .map(|_| {
                slots
                    .insert(OpSlot::Wake {
                        completion: Arc::new(OpCompletion::new()),
                        waker: waker.clone(),
                        task: None,
                    })
                    .unwrap()
            })
            .collect();

        assert!(slots.is_full());
        assert!(matches!(
            slots.insert(OpSlot::Ignore),
            Err(IoError::TagTableFull)
        ));

        // Releasing a tag makes room again.
        assert!(slots.remove(tags[0]).is_some());
        assert!(slots.insert(OpSlot::Ignore).is_ok());
        assert_eq!(slots.in_flight(), 2 + CANCEL_HEADROOM);
    }
}
