//! HTTP API Module
//!
//! REST surface for document writes, shard status and reconciliation.

mod http;

pub use http::{AppState, HttpServer};
