//! Common error types for Relaylink.

use thiserror::Error;

/// Result type alias using Relaylink's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Relaylink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker credential issuance failed
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// No reachable signaling host
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Signaling connection failure
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Session negotiation failure
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// Malformed inbound frame
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

/// A broker credential call failed. No partial credential state survives one of these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential request to {endpoint} failed: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("credential request to {endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("malformed response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },

    #[error("broker rejected {endpoint}: {message}")]
    Broker { endpoint: String, message: String },
}

impl CredentialError {
    pub fn malformed(endpoint: &str, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short human-readable reason, without the endpoint prefix.
    pub fn reason(&self) -> String {
        match self {
            Self::Transport { reason, .. } | Self::Malformed { reason, .. } => reason.clone(),
            Self::Status { status, .. } => format!("status {status}"),
            Self::Broker { message, .. } => message.clone(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no reachable signaling host after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("invalid signaling endpoint `{url}`: {reason}")]
    InvalidEndpoint { url: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling connect failed: {0}")]
    Connect(String),

    #[error("signaling send failed: {0}")]
    Send(String),

    #[error("signaling receive failed: {0}")]
    Receive(String),

    #[error("signaling channel closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("media engine rejected {step}: {reason}")]
    Engine { step: &'static str, reason: String },

    #[error("no media session for {0}")]
    NoSession(&'static str),
}

impl NegotiationError {
    pub fn engine(step: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Engine {
            step,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),

    #[error("frame is missing `{0}`")]
    MissingField(&'static str),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("invalid message payload: {0}")]
    InvalidPayload(String),
}
