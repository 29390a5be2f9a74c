//! Shared test helpers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

/// A waker that counts its invocations.
pub(crate) struct WakeCount {
    count: AtomicUsize,
}

impl WakeCount {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Wake for WakeCount {
    fn wake(self: Arc<Self>) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) fn mock_waker() -> (Waker, Arc<WakeCount>) {
    let data = Arc::new(WakeCount {
        count: AtomicUsize::new(0),
    });
    (Waker::from(data.clone()), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_waker_counts_every_wake() {
        let (waker, count) = mock_waker();
        waker.wake_by_ref();
        assert_eq!(count.count(), 1);

        let cloned = waker.clone();
        cloned.wake();
        assert_eq!(count.count(), 2);

        drop(waker);
        assert_eq!(count.count(), 2);
    }
}
