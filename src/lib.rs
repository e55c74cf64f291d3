//! Agent Arena: market resolution and agent settlement engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod feed;
pub mod engine;
pub mod storage;
pub mod api;
