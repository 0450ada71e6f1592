//! Client side of the shared file cache.
//!
//! Provides:
//! - `ClientCacheAgent` - Local cache state machine for the one open file
//! - `AgentError` - Failures surfaced to the agent's caller

pub mod agent;

pub use agent::{AgentError, ClientCacheAgent};
