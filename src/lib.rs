//! WebDAV ingest - staged, chunked and quota-checked file uploads over WebDAV
//!
//! This library provides the core functionality for the `webdav_ingest` server.

pub mod api;
pub mod config;
pub mod context;
pub mod dav;
pub mod error;
pub mod events;
pub mod metrics;
pub mod storage;
pub mod types;
