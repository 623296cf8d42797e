//! Stagehand - Production Pipeline Orchestrator
//!
//! Resolves which versioned plugin bundles satisfy a requested feature set,
//! organizes the work those plugins expose into dependency-ordered graphs of
//! actions and commands, and dispatches the leaf commands to local or remote
//! execution agents ("processors").
//!
//! - **Plugins**: `name@version` bundles discovered on disk, resolved by a
//!   backtracking constraint solver
//! - **Context**: the resolved plugin set and the environment it builds
//! - **Tools**: commands, actions, hooks and widgets; actions traverse their
//!   children concurrently while respecting upstream dependencies
//! - **Scheduling**: local subprocess clients and remote processors speaking
//!   a request/response and streaming protocol
//!
//! # Quick Start
//!
//! ```ignore
//! use stagehand::{config::Config, context::Context};
//!
//! let config = Config::load(None)?;
//! let context = Context::resolve("maya>=2024 arnold==7.2", &config.plugins)?;
//! for (key, value) in context.build_environment(true) {
//!     println!("{key}={value}");
//! }
//! ```

// ─── Core modules ─────────────────────────────────────────────────
pub mod config;
pub mod context;
pub mod errors;
pub mod plugin;
pub mod scheduling;
pub mod tools;

// ─── Infrastructure ───────────────────────────────────────────────
pub mod cli;
pub mod observability;

use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag, set by the signal handler in `main`.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Request a graceful shutdown of long-running loops (service, processors).
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Whether a shutdown was requested.
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
