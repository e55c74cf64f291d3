//! Core engine: classify → resolve → settle → refresh stats.

pub mod classifier;
pub mod settlement;
pub mod stats;
pub mod resolver;
