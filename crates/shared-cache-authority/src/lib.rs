//! Authority side of the shared file cache.
//!
//! Provides:
//! - `Coordinator` - Per-file state machines and the callback protocol
//! - `ClientDirectory` - Callback handles of connected clients

pub mod coordinator;
pub mod directory;
pub mod tracked;

pub use coordinator::Coordinator;
pub use directory::ClientDirectory;
pub use tracked::FileSnapshot;
