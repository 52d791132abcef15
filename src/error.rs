//! Error types for the peer connection manager.

use thiserror::Error;

/// Result type alias using the manager's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a signaling operation can surface to its caller.
///
/// Parsing and validation failures never leave the session or stream tables
/// partially mutated: the operation is aborted before the first mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Inbound description or candidate is missing a required field
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Operation referenced a peer id with no registered session
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Bounded wait for a remote/local description elapsed
    #[error("negotiation timeout: {0}")]
    NegotiationTimeout(String),

    /// Transport declined a syntactically valid candidate
    #[error("candidate rejected: {0}")]
    CandidateRejected(String),

    /// Track factory failed; the stream label was not inserted
    #[error("stream construction failed: {0}")]
    StreamConstructionFailed(String),

    /// A stream label was constructed twice. Never expected at runtime.
    #[error("duplicate stream construction: {0}")]
    DuplicateConstruction(String),

    /// Connection layer failed to create or apply a description
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn malformed(msg: impl std::fmt::Display) -> Self {
        Self::MalformedMessage(msg.to_string())
    }

    pub fn session_not_found(peer_id: impl std::fmt::Display) -> Self {
        Self::SessionNotFound(peer_id.to_string())
    }

    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::NegotiationTimeout(msg.to_string())
    }

    pub fn candidate_rejected(msg: impl std::fmt::Display) -> Self {
        Self::CandidateRejected(msg.to_string())
    }

    pub fn stream_construction(msg: impl std::fmt::Display) -> Self {
        Self::StreamConstructionFailed(msg.to_string())
    }

    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// True when the failure means the peer id is (no longer) registered.
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedMessage(e.to_string())
    }
}
