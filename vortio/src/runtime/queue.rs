//! The per-worker bounded run queue.
//!
//! Single owner, many stealers. The owner pushes at the tail and pops at the
//! head; stealers claim a batch from the head with a two-phase CAS. The head
//! word packs two `u32` indices: the `steal` component marks the start of an
//! in-progress steal claim, the `real` component is the live head. Indices
//! wrap as `u32`s, which is what distinguishes a full ring from an empty one.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 256;

const MASK: u32 = LOCAL_QUEUE_CAPACITY as u32 - 1;

/// Receives the detached older half of a full local queue.
pub(crate) trait Overflow<T> {
    fn push_batch(&self, batch: impl Iterator<Item = T>);
}

/// Creates the two halves of a local queue.
pub(crate) fn local<T>() -> (Steal<T>, Local<T>) {
    let inner = Arc::new(Inner {
        head: AtomicU64::new(0),
        tail: AtomicU32::new(0),
        buffer: (0..LOCAL_QUEUE_CAPACITY)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect(),
    });

    (
        Steal {
            inner: inner.clone(),
        },
        Local { inner },
    )
}

/// Owner half: push and pop. Not `Clone`; exactly one owner per queue.
pub(crate) struct Local<T> {
    inner: Arc<Inner<T>>,
}

/// Stealer half, handed to every peer worker.
pub(crate) struct Steal<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Steal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    /// Packed `(steal, real)` head indices.
    head: AtomicU64,

    /// Written only by the owner.
    tail: AtomicU32,

    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Entries move across threads only after a successful claim CAS, which also
// transfers ownership of the copied slots.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Local<T> {
    /// Number of queued entries, as observed by the owner.
    pub(crate) fn len(&self) -> usize {
        let (_, real) = unpack(self.inner.head.load(Ordering::Acquire));
        let tail = self.inner.tail.load(Ordering::Relaxed);
        tail.wrapping_sub(real) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots the owner may still fill before overflowing.
    pub(crate) fn spare_capacity(&self) -> usize {
        LOCAL_QUEUE_CAPACITY - self.len()
    }

    /// Owner-only push. When the ring is full, the older half is detached
    /// into `overflow` first, then `task` is pushed locally; that detach is
    /// the only path on which this queue touches the global queue.
    pub(crate) fn push_back<O: Overflow<T>>(&mut self, mut task: T, overflow: &O) {
        let tail = loop {
            let head = self.inner.head.load(Ordering::Acquire);
            let (steal, real) = unpack(head);
            let tail = self.inner.tail.load(Ordering::Relaxed);

            // Slots under an in-progress steal claim still count as occupied.
            if tail.wrapping_sub(steal) < LOCAL_QUEUE_CAPACITY as u32 {
                break tail;
            }

            if steal != real {
                // Full while a stealer holds a claim: the claim will free
                // half the ring shortly, so just hand this one task over.
                overflow.push_batch(std::iter::once(task));
                return;
            }

            match self.push_overflow(task, real, overflow) {
                Ok(()) => return,
                // Lost the detach race to a stealer; the ring has room now.
                Err(t) => task = t,
            }
        };

        let idx = (tail & MASK) as usize;
        unsafe {
            (*self.inner.buffer[idx].get()).write(task);
        }
        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
    }

    /// Detaches the older half of a full ring into `overflow`, then pushes
    /// `task`. Fails if a stealer claimed entries between the caller's load
    /// and the CAS.
    fn push_overflow<O: Overflow<T>>(&mut self, task: T, head: u32, overflow: &O) -> Result<(), T> {
        const BATCH: u32 = (LOCAL_QUEUE_CAPACITY / 2) as u32;

        let prev = pack(head, head);
        let next_head = head.wrapping_add(BATCH);
        if self
            .inner
            .head
            .compare_exchange(prev, pack(next_head, next_head), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(task);
        }

        // The claimed slots are exclusively ours; move them out lazily as the
        // overflow sink consumes the iterator.
        let inner = &self.inner;
        overflow.push_batch((0..BATCH).map(|i| {
            let idx = (head.wrapping_add(i) & MASK) as usize;
            unsafe { inner.buffer[idx].get().read().assume_init() }
        }));

        let tail = self.inner.tail.load(Ordering::Relaxed);
        let idx = (tail & MASK) as usize;
        unsafe {
            (*self.inner.buffer[idx].get()).write(task);
        }
        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Owner-only pop from the head. Competes with stealers on the head CAS.
    pub(crate) fn pop(&mut self) -> Option<T> {
        let mut head = self.inner.head.load(Ordering::Acquire);
        loop {
            let (steal, real) = unpack(head);
            let tail = self.inner.tail.load(Ordering::Relaxed);
            if real == tail {
                return None;
            }

            let next_real = real.wrapping_add(1);
            // Advance the steal component too when no claim is in progress.
            let next = if steal == real {
                pack(next_real, next_real)
            } else {
                pack(steal, next_real)
            };

            match self
                .inner
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let idx = (real & MASK) as usize;
                    return Some(unsafe { self.inner.buffer[idx].get().read().assume_init() });
                }
                Err(actual) => head = actual,
            }
        }
    }
}

impl<T> Steal<T> {
    /// Number of queued entries, as observed by a stealer. Racy; a heuristic.
    pub(crate) fn len(&self) -> usize {
        let (_, real) = unpack(self.inner.head.load(Ordering::Acquire));
        let tail = self.inner.tail.load(Ordering::Acquire);
        tail.wrapping_sub(real) as usize
    }

    /// Claims half of the victim's entries, rounded up. All but the last
    /// land in `dst`; the last is returned for the thief to run immediately.
    ///
    /// Returns `None` when the victim is empty, another steal is in
    /// progress, or `dst` lacks room for half a ring.
    pub(crate) fn steal_into(&self, dst: &mut Local<T>) -> Option<T> {
        let dst_tail = dst.inner.tail.load(Ordering::Relaxed);
        let (dst_steal, _) = unpack(dst.inner.head.load(Ordering::Acquire));
        if dst_tail.wrapping_sub(dst_steal) > (LOCAL_QUEUE_CAPACITY / 2) as u32 {
            return None;
        }

        // Phase one: claim the batch by advancing the real head while the
        // steal component pins the claimed range.
        let mut prev_packed = self.inner.head.load(Ordering::Acquire);
        let (first, n) = loop {
            let (steal, real) = unpack(prev_packed);
            if steal != real {
                return None;
            }

            let tail = self.inner.tail.load(Ordering::Acquire);
            let len = tail.wrapping_sub(real);
            let n = len - len / 2;
            if n == 0 {
                return None;
            }

            let next = pack(steal, real.wrapping_add(n));
            match self.inner.head.compare_exchange(
                prev_packed,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break (real, n),
                Err(actual) => prev_packed = actual,
            }
        };

        // The claimed slots are exclusively ours until the release CAS.
        for i in 0..n - 1 {
            let src = (first.wrapping_add(i) & MASK) as usize;
            let dst_idx = (dst_tail.wrapping_add(i) & MASK) as usize;
            unsafe {
                let entry = self.inner.buffer[src].get().read();
                *dst.inner.buffer[dst_idx].get() = entry;
            }
        }
        let last = (first.wrapping_add(n - 1) & MASK) as usize;
        let task = unsafe { self.inner.buffer[last].get().read().assume_init() };

        // Phase two: release the claim. The owner may have popped past our
        // range meanwhile, so only the steal component is ours to move.
        let claimed_to = first.wrapping_add(n);
        let mut prev = pack(first, claimed_to);
        loop {
            let (_, real) = unpack(prev);
            match self.inner.head.compare_exchange(
                prev,
                pack(claimed_to, real),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }

        if n > 1 {
            dst.inner
                .tail
                .store(dst_tail.wrapping_add(n - 1), Ordering::Release);
        }
        Some(task)
    }
}

impl<T> Drop for Local<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

fn pack(steal: u32, real: u32) -> u64 {
    (u64::from(steal) << 32) | u64::from(real)
}

fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    impl<T> Overflow<T> for RefCell<Vec<T>> {
        fn push_batch(&self, batch: impl Iterator<Item = T>) {
            self.borrow_mut().extend(batch);
        }
    }

    #[test]
    fn test_fifo_push_pop() {
        let (_steal, mut local) = local::<usize>();
        let sink = RefCell::new(Vec::new());

        for i in 0..10 {
            local.push_back(i, &sink);
        }
        assert_eq!(local.len(), 10);

        for i in 0..10 {
            assert_eq!(local.pop(), Some(i));
        }
        assert_eq!(local.pop(), None);
        assert!(sink.borrow().is_empty());
    }

    #[test]
    fn test_overflow_detaches_older_half() {
        let (_steal, mut local) = local::<usize>();
        let sink = RefCell::new(Vec::new());

        for i in 0..=LOCAL_QUEUE_CAPACITY {
            local.push_back(i, &sink);
        }

        // The 257th push detached the older half into the sink.
        assert_eq!(sink.borrow().len(), LOCAL_QUEUE_CAPACITY / 2);
        assert_eq!(*sink.borrow(), (0..LOCAL_QUEUE_CAPACITY / 2).collect::<Vec<_>>());
        assert!(local.len() <= LOCAL_QUEUE_CAPACITY / 2 + 1);

        // The survivors keep FIFO order.
        assert_eq!(local.pop(), Some(LOCAL_QUEUE_CAPACITY / 2));
    }

    #[test]
    fn test_sustained_overflow_stays_bounded() {
        let (_steal, mut local) = local::<usize>();
        let sink = RefCell::new(Vec::new());

        for i in 0..300 {
            local.push_back(i, &sink);
        }

        assert!(local.len() <= LOCAL_QUEUE_CAPACITY);
        assert!(sink.borrow().len() >= 44);

        // Conservation: nothing lost, nothing duplicated.
        let mut all: Vec<usize> = sink.borrow().clone();
        while let Some(v) = local.pop() {
            all.push(v);
        }
        all.sort_unstable();
        assert_eq!(all, (0..300).collect::<Vec<_>>());
    }

    #[test]
    fn test_steal_half_rounded_up() {
        let (victim_steal, mut victim) = local::<usize>();
        let (_thief_steal, mut thief) = local::<usize>();
        let sink = RefCell::new(Vec::new());

        for i in 0..10 {
            victim.push_back(i, &sink);
        }

        let got = victim_steal.steal_into(&mut thief);
        assert_eq!(got, Some(4));
        assert_eq!(victim.len(), 5);
        assert_eq!(victim_steal.len(), 5);
        assert_eq!(thief.len(), 4);

        // Nothing duplicated or lost across the claim.
        let mut all = vec![got.unwrap()];
        while let Some(v) = victim.pop() {
            all.push(v);
        }
        while let Some(v) = thief.pop() {
            all.push(v);
        }
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_steal_single_entry() {
        let (victim_steal, mut victim) = local::<usize>();
        let (_ts, mut thief) = local::<usize>();
        let sink = RefCell::new(Vec::new());

        victim.push_back(7, &sink);
        assert_eq!(victim_steal.steal_into(&mut thief), Some(7));
        assert!(victim.is_empty());
        assert!(thief.is_empty());
        assert_eq!(victim_steal.steal_into(&mut thief), None);
    }

    #[test]
    fn test_concurrent_steal_conservation() {
        use std::sync::atomic::AtomicUsize;

        const TOTAL: usize = 4096;
        const THIEVES: usize = 3;

        let (steal, mut owner) = local::<usize>();
        let sink = RefCell::new(Vec::new());
        let seen = std::sync::Mutex::new(vec![0u8; TOTAL]);
        let produced = AtomicUsize::new(0);
        let consumed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..THIEVES {
                let steal = steal.clone();
                let seen = &seen;
                let consumed = &consumed;
                let produced = &produced;
                scope.spawn(move || {
                    let (_s, mut dst) = local::<usize>();
                    while consumed.load(Ordering::Acquire) < TOTAL {
                        if let Some(v) = steal.steal_into(&mut dst) {
                            let mut count = 1;
                            seen.lock().unwrap()[v] += 1;
                            while let Some(v) = dst.pop() {
                                seen.lock().unwrap()[v] += 1;
                                count += 1;
                            }
                            consumed.fetch_add(count, Ordering::AcqRel);
                        } else if produced.load(Ordering::Acquire) == TOTAL {
                            // Owner is done producing; whatever is left is the
                            // owner's to pop.
                            break;
                        } else {
                            std::thread::yield_now();
                        }
                    }
                });
            }

            // Owner produces and pops concurrently with the thieves.
            for i in 0..TOTAL {
                owner.push_back(i, &sink);
                produced.fetch_add(1, Ordering::AcqRel);
                if i % 3 == 0
                    && let Some(v) = owner.pop()
                {
                    seen.lock().unwrap()[v] += 1;
                    consumed.fetch_add(1, Ordering::AcqRel);
                }
            }
            while let Some(v) = owner.pop() {
                seen.lock().unwrap()[v] += 1;
                consumed.fetch_add(1, Ordering::AcqRel);
            }
            for v in sink.borrow().iter() {
                seen.lock().unwrap()[*v] += 1;
                consumed.fetch_add(1, Ordering::AcqRel);
            }
        });

        // Every entry consumed exactly once.
        assert!(seen.lock().unwrap().iter().all(|&c| c == 1));
    }
}
