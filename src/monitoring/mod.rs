//! Monitoring Module
//!
//! Structured observability for pipeline runs.
//!
//! # Components
//!
//! - [`Journal`]: Shared lifecycle event journal with a machine-parsable
//!   line format

pub mod journal;

pub use journal::{EventKind, Journal, Level, Record, Scope};
