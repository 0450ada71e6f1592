//! Content store implementations.
//!
//! Provides:
//! - `MemoryStore` - In-process store for tests and single-process setups
//! - `FsStore` - Files on the authority's local disk

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "fs")]
pub mod fs;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "fs")]
pub use fs::FsStore;
