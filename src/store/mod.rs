//! Object storage behind the broker.
//!
//! The broker only depends on [`ObjectStore`]. Two adapters are provided:
//! an in-memory store and a log-backed durable store.

mod durable;
mod log;
mod memory;
mod retry;
mod traits;

pub use durable::{DurableStore, DurableStoreConfig};
pub use log::{LogEntry, LogOp, ObjectLog};
pub use memory::MemoryStore;
pub use retry::{ReadRetry, DEFAULT_READ_RETRIES, DEFAULT_RETRY_BACKOFF};
pub use traits::ObjectStore;
