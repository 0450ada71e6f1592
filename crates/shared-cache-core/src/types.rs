//! Data model shared by the authority and its clients.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::CoherenceError;

/// Opaque client identifier.
///
/// Clients choose their own identifier when they connect; the authority
/// uses it to key registrants and to find the client's callback handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Access requested by a client when it acquires a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// The client only intends to look at the file.
    Read,
    /// The client wants write ownership.
    Write,
}

impl AccessMode {
    /// Short wire token (`"r"` or `"w"`).
    #[must_use]
    pub const fn as_token(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
        }
    }
}

impl FromStr for AccessMode {
    type Err = CoherenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "r" | "read" => Ok(Self::Read),
            "w" | "write" => Ok(Self::Write),
            _ => Err(CoherenceError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Whole-file contents, the unit of transfer on acquire, commit and writeback.
///
/// Cloning is cheap; the bytes are shared and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileContents(Bytes);

impl FileContents {
    /// Wrap a byte buffer.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the blob holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for FileContents {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&'static [u8]> for FileContents {
    fn from(bytes: &'static [u8]) -> Self {
        Self::new(bytes)
    }
}

impl From<&'static str> for FileContents {
    fn from(s: &'static str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl AsRef<[u8]> for FileContents {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Sharing state of a tracked file, as seen by the authority.
///
/// Also used as a registrant's access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityState {
    /// Nobody holds the file.
    #[default]
    NotShared,
    /// Zero or more readers, no writer.
    ReadShared,
    /// Exactly one client owns the file for writing.
    WriteShared,
    /// The owner has been asked to write back so another client can take over.
    OwnershipChange,
}

impl AuthorityState {
    /// True for the two states that denote write ownership.
    #[must_use]
    pub const fn holds_write(self) -> bool {
        matches!(self, Self::WriteShared | Self::OwnershipChange)
    }
}

/// State of the single file cached by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCacheState {
    /// No usable copy.
    #[default]
    Invalid,
    /// A read-only copy, valid until invalidated.
    ReadShared,
    /// The client owns the file and may change it.
    WriteOwned,
    /// The authority asked for the contents back; ownership is being released.
    ReleasePending,
}

/// Result of a single outbound callback from the authority to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    /// The client accepted the request.
    Success,
    /// The client refused, or could not be reached.
    Failure,
    /// The client did not answer in time.
    Timeout,
}

impl CallbackOutcome {
    /// True only for [`CallbackOutcome::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for CallbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

/// Successful commit result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    /// File that was committed.
    pub filename: String,
    /// Registrants whose invalidation failed and were dropped anyway.
    pub degraded: Vec<ClientId>,
}
