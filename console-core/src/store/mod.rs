//! In-memory state for the chat console: the per-chat message log and the
//! chat roster. Both are plain structs with synchronous merge operations;
//! callers own the locking.

pub mod messages;
pub mod roster;

pub use messages::{
    AppendOutcome, DEFAULT_PENDING_CAPACITY, MessageStore, Reconciled, StatusOutcome, StoreError,
};
pub use roster::ChatRoster;
