//! Error taxonomy for the coherence protocol.

use thiserror::Error;

use crate::{CallbackOutcome, ClientId};

/// Content store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Error raised while invoking a client callback.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Client unreachable: {0}")]
    Unreachable(ClientId),
    #[error("Callback transport error: {0}")]
    Transport(String),
}

/// Failure of an `acquire` or `commit` request.
///
/// Every variant means no state changed at the authority, except that a
/// failed acquire may still have de-registered the caller from other files.
#[derive(Debug, Error)]
pub enum CoherenceError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Client {client} does not own {filename}")]
    NotOwned { filename: String, client: ClientId },
    #[error("Ownership transfer of {filename} from {owner} failed: {outcome}")]
    OwnershipTransferFailed {
        filename: String,
        owner: ClientId,
        outcome: CallbackOutcome,
    },
    #[error("Failed to persist {filename}: {source}")]
    StoreWriteFailed {
        filename: String,
        #[source]
        source: StoreError,
    },
    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),
    #[error("Invalid access mode: {0}")]
    InvalidMode(String),
    #[error("Transport error: {0}")]
    Transport(String),
}
