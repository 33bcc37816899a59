//! State management module for the Topoform engine.
//!
//! This module persists the last-applied attributes of every materialized
//! resource, the apply history, and the advisory lock guarding both.

mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{
    HistoryEntry, HistoryOperation, ResourceRecord, StateSnapshot, MAX_HISTORY, STATE_VERSION,
};
