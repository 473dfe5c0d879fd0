//! Read-only query engines over the tick store.

pub mod range;
pub mod snapshot;
