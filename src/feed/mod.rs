//! Streaming tick feed: authorization, wire codec, ingestion pipeline.

pub mod auth;
pub mod pipeline;
pub mod wire;
