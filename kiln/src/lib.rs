//! Provides the job execution engine and latency measurement subsystem
//! behind the kiln CLI.
#![warn(missing_docs)]

pub mod burner;
pub mod client;
pub mod config;
pub mod indexer;
pub(crate) mod labels;
pub mod limiter;
pub mod measurements;
pub mod pool;
pub mod template;
pub mod wait;
pub mod watcher;
