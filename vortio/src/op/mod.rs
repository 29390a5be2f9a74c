//! One-shot `io_uring` operation descriptors.
//!
//! Every I/O operation has the same shape: a payload carrying the bound
//! kernel preparation and its captured arguments, wrapped in an [`Op`]
//! future. The first poll registers with the current worker's poller
//! (reserving a tag, installing the task waker, pushing the SQE) and
//! suspends; the completion path writes the raw result into the
//! descriptor's slot and wakes the task; the resuming poll interprets the
//! result. The payload carries no policy; the poller is its only
//! collaborator.

use crate::context;
use crate::poller::OpCompletion;
use crate::task::OpRef;
use pin_project::{pin_project, pinned_drop};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pub(crate) mod errors;
pub use errors::IoError;

pub mod single;

pub(crate) mod parse;

/// Contract between an operation payload and the [`Op`] driver.
///
/// `create_entry` is the preparation thunk: it writes the opcode and
/// arguments into a submission entry. Pointers handed to the kernel must
/// stay valid for the payload's lifetime, which pinning guarantees for
/// self-referential payloads.
///
/// `into_output` interprets the raw kernel result: `raw >= 0` became
/// `Ok(raw)`, `raw < 0` became an error of kind `-raw`. It is called exactly
/// once, when the operation resolves.
pub trait OpPayload {
    type Output;

    fn create_entry(self: Pin<&mut Self>) -> io_uring::squeue::Entry;

    fn into_output(self: Pin<&mut Self>, result: Result<i32, IoError>)
    -> Result<Self::Output, IoError>;
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Unsubmitted,
    InFlight(OpRef),
    Done,
}

/// A suspendable one-shot operation. Created in place on the suspension
/// frame, registered with a poller exactly once, destroyed when the task
/// resumes past the await.
#[pin_project(PinnedDrop)]
pub struct Op<T: OpPayload> {
    #[pin]
    data: T,

    /// Shared with the poller's tag table while in flight; the completion
    /// path fills it and releases the tag.
    completion: Option<Arc<OpCompletion>>,

    lifecycle: Lifecycle,
}

impl<T: OpPayload> Op<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            completion: None,
            lifecycle: Lifecycle::Unsubmitted,
        }
    }
}

impl<T: OpPayload> Future for Op<T> {
    type Output = Result<T::Output, IoError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        match *this.lifecycle {
            Lifecycle::Unsubmitted => {
                let entry = this.data.as_mut().create_entry();
                let task = context::current_task();

                let registered =
                    context::with_poller_mut(|poller| poller.register(entry, cx.waker(), task.clone()));

                match registered {
                    Ok((op, completion)) => {
                        if let Some(task) = &task {
                            task.op_registered(op);
                        }
                        *this.completion = Some(completion);
                        *this.lifecycle = Lifecycle::InFlight(op);
                        Poll::Pending
                    }
                    Err(err) => {
                        // Never reached the kernel; fail at the await site.
                        *this.lifecycle = Lifecycle::Done;
                        Poll::Ready(this.data.as_mut().into_output(Err(err)))
                    }
                }
            }
            Lifecycle::InFlight(op) => {
                let completion = this
                    .completion
                    .as_ref()
                    .expect("in-flight op without a completion slot");
                if !completion.is_ready() {
                    // The task waker is stable, and the one installed at
                    // registration already points at this task; a spurious
                    // poll needs no re-registration.
                    return Poll::Pending;
                }

                let raw = completion.result();
                if let Some(task) = context::current_task() {
                    task.op_detached(op);
                }
                *this.lifecycle = Lifecycle::Done;

                let result = if raw >= 0 {
                    Ok(raw)
                } else {
                    Err(IoError::from_raw_os_error(-raw))
                };
                Poll::Ready(this.data.as_mut().into_output(result))
            }
            Lifecycle::Done => panic!("Op polled after completion"),
        }
    }
}

#[pinned_drop]
impl<T: OpPayload> PinnedDrop for Op<T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        let Lifecycle::InFlight(op) = *this.lifecycle else {
            return;
        };

        if let Some(task) = context::current_task() {
            task.op_detached(op);
        }

        // Dropped before resolving: withdraw the submission. The result slot
        // is shared with the tag table, so a completion racing this drop
        // still has a live write target; the terminal completion retires the
        // tag either way.
        if this.completion.as_ref().is_some_and(|c| !c.is_ready()) {
            context::cancel_on(op);
        }
    }
}
