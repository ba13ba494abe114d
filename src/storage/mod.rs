//! Normalized entity storage.
//!
//! The trait defines the contract; `InMemoryEntityStore` is the session-scoped
//! backend the client uses.

mod memory;
mod traits;

pub use memory::InMemoryEntityStore;
pub use traits::{EntityStore, StorageError};
