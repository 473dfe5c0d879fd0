//! Durable tick storage: the SQLite store and the async persistence writer.

pub mod tick_store;
pub mod writer;
