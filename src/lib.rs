//! dory - client-side email synchronization agent
//!
//! dory sits between a UI layer and an out-of-process mail-protocol backend
//! that executes one operation per lane at a time. It serializes requested
//! operations, tracks multi-account sync runs and attachment downloads, and
//! turns backend activity into a stable event stream.
//!
//! ## Module Organization
//!
//! - `agent/`: the coordinator owning all mutable state
//! - `sync/`: actions, queueing, orchestration, connectivity gating
//! - `backend/`: calling contract of the external protocol engine
//! - `store/`: boundary to the external mail store
//! - `config/`: agent configuration
//! - `types/`: identifiers, statuses and the error type
//!
//! The agent owns nothing durable; on restart its queue and trackers are
//! rebuilt empty, and callers re-issue whatever work was dropped.

pub mod agent;
pub mod backend;
pub mod config;
pub mod store;
pub mod sync;
pub mod types;

pub use agent::{Agent, AgentEvent, AgentHandle, AgentStatus};
pub use config::AgentConfig;
pub use types::error::{AgentError, Result};

use tracing_subscriber::EnvFilter;

/// Initialize tracing for logging.
///
/// In debug builds, defaults to debug level for this crate. Can be
/// overridden with the RUST_LOG environment variable. Call at most once per
/// process.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("dory=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
