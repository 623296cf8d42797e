//! Observability
//!
//! Structured logging setup and span helpers for command execution and
//! processor state changes.

pub mod telemetry;

pub use telemetry::{init_tracing, sanitize_for_log};
