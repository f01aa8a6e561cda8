//! Sorted key index
//!
//! - `KeyBlockLayout` / `KeyEntry`: fixed-size entries and their block encoding
//! - `KeyCursor`: position of an entry, repositioned per call
//! - `KeyBlockOperations`: put/get/remove/list over a block sequence

mod entry;
mod operations;

pub use entry::{KeyBlockLayout, KeyCursor, KeyEntry};
pub use operations::{KeyBlockOperations, KeyListing, PutOutcome};
