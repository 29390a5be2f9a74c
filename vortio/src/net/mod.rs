//! Socket glue over the operation descriptors.

mod socket;
pub use socket::{Shutdown, Socket};
