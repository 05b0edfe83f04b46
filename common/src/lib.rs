//! Provides types that are common to the kiln engine and to consumers of its
//! indexed documents.
#![deny(missing_docs)]
pub mod config;
pub mod documents;
pub mod quantiles;
#[cfg(feature = "telemetry")]
pub mod telemetry;
