//! Chainfeed Backend Library
//!
//! Exposes the ingestion, storage and query modules for use by binaries and
//! integration tests.

pub mod feed;
pub mod models;
pub mod query;
pub mod registry;
pub mod store;
