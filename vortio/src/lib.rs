//! vortio: a multi-threaded, work-stealing async runtime built on `io_uring`.
//!
//! Linux-only. Each worker thread owns one submission/completion ring; tasks
//! suspend on kernel-submitted operations and are resumed by the worker
//! whose ring saw the completion, migrating between workers through stealing
//! and global-queue hand-offs.
//!
//! ```no_run
//! #[vortio::main]
//! async fn main() {
//!     let handle = vortio::spawn(async { 1 + 1 });
//!     assert_eq!(handle.await.unwrap(), 2);
//! }
//! ```

#[doc(inline)]
pub use vortio_macros::main;

#[doc(inline)]
pub use vortio_macros::test;

pub(crate) mod context;

pub mod net;

pub mod op;

pub(crate) mod poller;

pub mod runtime;
pub use runtime::{Builder, Runtime, spawn};

pub mod task;
pub use task::{JoinError, JoinHandle};

pub mod time;

#[cfg(test)]
pub(crate) mod test_utils;
