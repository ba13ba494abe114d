//! View binding: live query results for UI components.
//!
//! A watch pairs a selection with a root entity. After every store mutation the
//! client broadcasts the dirty key set and affected watches receive a fresh,
//! referentially stable result on their [`WatchStream`].

/// Watch registry and broadcast.
pub mod binding;
/// Subscriber stream handle.
pub mod stream;

pub use binding::{ViewBinding, ViewBindingConfig, WatchId, WatchRegistration, WatchUpdate};
pub use stream::WatchStream;
