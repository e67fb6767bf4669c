//! Network error types.

use std::fmt;
use std::time::Duration;

/// Why the accepting side turned a connection away during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A session with the presented name already exists.
    DuplicateName,
    /// The shared hub password did not match.
    BadPassword,
    /// The per-user credential check failed.
    BadLogin,
    /// The peer sent something other than the expected handshake value.
    Malformed,
}

impl RejectReason {
    /// Whether this rejection counts toward the remote address's failure
    /// counter (and therefore toward the blacklist).
    pub fn counts_as_failure(self) -> bool {
        matches!(self, Self::BadPassword | Self::BadLogin)
    }

    /// The acknowledgement string sent to the peer for this rejection.
    pub fn ack(self) -> &'static str {
        match self {
            Self::DuplicateName => "NAME_IN_USE",
            Self::BadPassword => "BAD_PASSWORD",
            Self::BadLogin => "BAD_LOGIN",
            Self::Malformed => "MALFORMED",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::DuplicateName => "peer name already in use",
            Self::BadPassword => "wrong shared password",
            Self::BadLogin => "login verification failed",
            Self::Malformed => "malformed handshake value",
        };
        f.write_str(text)
    }
}

/// Errors that can occur in the hive_link crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The requested peer was not found in the registry.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// A session with this name is already registered locally.
    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A frame header could not be parsed or exceeds the size limit.
    #[error("Frame error: {0}")]
    Frame(String),

    /// Sealing or opening a payload failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The remote hub refused our handshake with the given reason.
    #[error("Handshake rejected by remote: {0}")]
    HandshakeRejected(String),

    /// We refused an inbound handshake.
    #[error("Handshake rejected: {0}")]
    Rejected(RejectReason),

    /// An RPC call did not complete within its deadline.
    #[error("RPC '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// The remote handler reported a failure.
    #[error("RPC '{operation}' failed remotely: {message}")]
    Remote { operation: String, message: String },

    /// The hub or peer is not running.
    #[error("Endpoint not running")]
    NotRunning,

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// The handshake rejection reason, if this is one.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}
