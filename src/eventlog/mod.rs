//! Event log module.
//!
//! Newline-delimited JSON records, appended by a single owner and read
//! concurrently through snapshot-bounded cursors.

mod models;
mod reader;
mod store;

pub use models::*;
pub use reader::*;
pub use store::*;
