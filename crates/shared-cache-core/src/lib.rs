//! Core abstractions for the shared file cache coherence protocol.
//!
//! This crate provides the fundamental building blocks:
//! - `FileContents` - Immutable unit of transfer
//! - `AuthorityState` / `ClientCacheState` - The two per-file state machines
//! - `ContentStore`, `AuthorityService`, `ClientCallbacks` - Seams between components
//! - `AuthorityConfig` - Runtime configuration for the authority

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::AuthorityConfig;
pub use error::{CallbackError, CoherenceError, StoreError};
pub use traits::{AuthorityService, ClientCallbacks, ContentStore};
pub use types::{
    AccessMode, AuthorityState, CallbackOutcome, ClientCacheState, ClientId, CommitReport,
    FileContents,
};
