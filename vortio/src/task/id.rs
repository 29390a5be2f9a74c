use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque, process-unique identifier for a spawned task.
///
/// Ids are stable for the lifetime of the task and exist for debugging and
/// registry bookkeeping only; no scheduling decision depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(u64);

impl Id {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = Id::next();
        let b = Id::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }
}
