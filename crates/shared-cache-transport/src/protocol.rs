//! Wire protocol for authority-client communication.
//!
//! Requests carry a `request_id` so replies and callbacks can be matched
//! up while several calls are in flight on one connection.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use shared_cache_core::{
    CallbackOutcome, ClientId, CoherenceError, CommitReport, FileContents, StoreError,
};
use uuid::Uuid;

/// Message from client to authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Identify the connection; must be the first message.
    Register { client_id: ClientId },
    /// Open a file. `mode` is `"r"` or `"w"`.
    Acquire {
        request_id: Uuid,
        filename: String,
        mode: String,
    },
    /// Upload new contents (base64 encoded).
    Commit {
        request_id: Uuid,
        filename: String,
        data: String,
    },
    /// Answer to an `invalidate` or `writeback` callback.
    CallbackResult { request_id: Uuid, ok: bool },
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Create a commit message from file contents.
    #[must_use]
    pub fn commit(request_id: Uuid, filename: impl Into<String>, contents: &FileContents) -> Self {
        Self::Commit {
            request_id,
            filename: filename.into(),
            data: BASE64.encode(contents),
        }
    }

    /// Decode commit data from base64.
    #[must_use]
    pub fn decode_commit(&self) -> Option<FileContents> {
        if let Self::Commit { data, .. } = self {
            BASE64.decode(data).ok().map(FileContents::from)
        } else {
            None
        }
    }
}

/// Message from authority to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration accepted.
    Registered { client_id: ClientId },
    /// File contents for an acquire (base64 encoded).
    Acquired { request_id: Uuid, data: String },
    /// Commit stored.
    Committed {
        request_id: Uuid,
        degraded: Vec<ClientId>,
    },
    /// Request failed.
    Failed { request_id: Uuid, error: WireError },
    /// Callback: discard the cached read copy.
    Invalidate { request_id: Uuid },
    /// Callback: write the owned copy back.
    Writeback { request_id: Uuid },
    /// Protocol-level error not tied to a request.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Create an acquire reply from file contents.
    #[must_use]
    pub fn acquired(request_id: Uuid, contents: &FileContents) -> Self {
        Self::Acquired {
            request_id,
            data: BASE64.encode(contents),
        }
    }

    /// Create a commit reply.
    #[must_use]
    pub fn committed(request_id: Uuid, report: CommitReport) -> Self {
        Self::Committed {
            request_id,
            degraded: report.degraded,
        }
    }

    /// Create a failure reply.
    #[must_use]
    pub fn failed(request_id: Uuid, error: &CoherenceError) -> Self {
        Self::Failed {
            request_id,
            error: error.into(),
        }
    }

    /// Decode acquire data from base64.
    #[must_use]
    pub fn decode_acquired(&self) -> Option<FileContents> {
        if let Self::Acquired { data, .. } = self {
            BASE64.decode(data).ok().map(FileContents::from)
        } else {
            None
        }
    }

    /// Request this message answers, if any.
    #[must_use]
    pub const fn reply_to(&self) -> Option<Uuid> {
        match self {
            Self::Acquired { request_id, .. }
            | Self::Committed { request_id, .. }
            | Self::Failed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

/// Serializable form of [`CoherenceError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireError {
    NotFound {
        filename: String,
    },
    NotOwned {
        filename: String,
        client: ClientId,
    },
    OwnershipTransferFailed {
        filename: String,
        owner: ClientId,
        outcome: CallbackOutcome,
    },
    StoreWriteFailed {
        filename: String,
        message: String,
    },
    UnknownClient {
        client: ClientId,
    },
    InvalidMode {
        mode: String,
    },
    Transport {
        message: String,
    },
}

impl From<&CoherenceError> for WireError {
    fn from(error: &CoherenceError) -> Self {
        match error {
            CoherenceError::NotFound(filename) => Self::NotFound {
                filename: filename.clone(),
            },
            CoherenceError::NotOwned { filename, client } => Self::NotOwned {
                filename: filename.clone(),
                client: client.clone(),
            },
            CoherenceError::OwnershipTransferFailed {
                filename,
                owner,
                outcome,
            } => Self::OwnershipTransferFailed {
                filename: filename.clone(),
                owner: owner.clone(),
                outcome: *outcome,
            },
            CoherenceError::StoreWriteFailed { filename, source } => Self::StoreWriteFailed {
                filename: filename.clone(),
                message: source.to_string(),
            },
            CoherenceError::UnknownClient(client) => Self::UnknownClient {
                client: client.clone(),
            },
            CoherenceError::InvalidMode(mode) => Self::InvalidMode { mode: mode.clone() },
            CoherenceError::Transport(message) => Self::Transport {
                message: message.clone(),
            },
        }
    }
}

impl From<WireError> for CoherenceError {
    fn from(error: WireError) -> Self {
        match error {
            WireError::NotFound { filename } => Self::NotFound(filename),
            WireError::NotOwned { filename, client } => Self::NotOwned { filename, client },
            WireError::OwnershipTransferFailed {
                filename,
                owner,
                outcome,
            } => Self::OwnershipTransferFailed {
                filename,
                owner,
                outcome,
            },
            WireError::StoreWriteFailed { filename, message } => Self::StoreWriteFailed {
                filename,
                source: StoreError::Internal(message),
            },
            WireError::UnknownClient { client } => Self::UnknownClient(client),
            WireError::InvalidMode { mode } => Self::InvalidMode(mode),
            WireError::Transport { message } => Self::Transport(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_roundtrip() {
        let original = FileContents::from("line one\nline two\n");
        let msg = ClientMessage::commit(Uuid::new_v4(), "report.txt", &original);
        assert_eq!(msg.decode_commit().unwrap(), original);
    }

    #[test]
    fn test_acquired_roundtrip() {
        let original = FileContents::new(vec![0_u8, 159, 146, 150]);
        let msg = ServerMessage::acquired(Uuid::new_v4(), &original);
        assert_eq!(msg.decode_acquired().unwrap(), original);
        assert!(ServerMessage::Pong.decode_acquired().is_none());
    }

    #[test]
    fn test_message_serialization() {
        let request_id = Uuid::new_v4();
        let msg = ClientMessage::Acquire {
            request_id,
            filename: "report.txt".to_string(),
            mode: "w".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"acquire\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_failure_keeps_error_kind() {
        let request_id = Uuid::new_v4();
        let error = CoherenceError::OwnershipTransferFailed {
            filename: "report.txt".to_string(),
            owner: ClientId::from("c1"),
            outcome: CallbackOutcome::Timeout,
        };
        let msg = ServerMessage::failed(request_id, &error);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"ownership_transfer_failed\""));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.reply_to(), Some(request_id));
        let ServerMessage::Failed { error, .. } = parsed else {
            panic!("Wrong message type");
        };
        assert!(matches!(
            CoherenceError::from(error),
            CoherenceError::OwnershipTransferFailed {
                outcome: CallbackOutcome::Timeout,
                ..
            }
        ));
    }
}
