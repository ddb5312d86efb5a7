#![forbid(unsafe_code)]

mod error;
mod queue;
mod retry;

pub use error::StoreError;
pub use queue::{JobRow, QueueStore, StoreTuning};
