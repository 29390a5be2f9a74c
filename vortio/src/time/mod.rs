//! Timer primitives over the kernel timeout operation.

use crate::op::Op;
use crate::op::single::TimeoutOp;
use std::time::Duration;

/// Suspends the current task for at least `duration`.
///
/// Backed by a one-shot kernel timeout on the worker's ring; an elapsed
/// timer resolves `Ok(())`. Richer timeout composition is done by racing a
/// sleep against another operation.
pub fn sleep(duration: Duration) -> Op<TimeoutOp> {
    Op::new(TimeoutOp::new(duration))
}
