//! The multi-threaded, work-stealing scheduler core.

// Public API
pub mod runtime;
pub use runtime::{Builder, IoUringFlags, Runtime};

mod spawn;
pub use spawn::spawn;

// Internals
pub(crate) mod injector;
pub(crate) mod pool;
pub(crate) mod queue;
pub(crate) mod registry;
pub(crate) mod shared;
pub(crate) mod ticker;
pub(crate) mod worker;

pub(crate) use runtime::RuntimeConfig;

#[cfg(test)]
mod tests;
