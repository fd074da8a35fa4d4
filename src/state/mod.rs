//! State management.
//!
//! This module provides persistent storage of stack snapshots, keyed by
//! stack and environment, with locking and an operation history.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    HistoryEntry, ResourceRecord, STATE_VERSION, StackOperation, StackSnapshot, state_key,
};
