//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context for callers to decide how to handle the failure:
//! transport failures and rejected candidates are retried inside the
//! generation client, everything else reaches the caller untouched.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::llm::types::Role;
use crate::schema::{FieldViolation, describe_violations};

/// Unified error type for the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Contract errors -----------------------------------------------------
    /// A payload handed to the memory does not conform to the contract
    /// implied by its role.  This is a caller bug and is never retried.
    #[error("{role} payload does not match `{contract}`: {}", describe_violations(.violations))]
    SchemaMismatch {
        role: Role,
        contract: String,
        violations: Vec<FieldViolation>,
    },

    // -- Configuration errors ------------------------------------------------
    /// No registry entry exists for the requested provider.
    #[error("unsupported provider: {provider}")]
    UnsupportedProvider { provider: String },

    /// The provider requires a credential and none (or an empty one) was given.
    #[error("missing credential for provider: {provider}")]
    MissingCredential { provider: String },

    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Backend errors ------------------------------------------------------
    /// A single classified transport failure reported by a transport.
    #[error("transport failure ({failure}): {reason}")]
    Transport {
        failure: TransportFailure,
        reason: String,
    },

    /// Transient transport failures persisted through every retry.
    #[error("backend unavailable after {attempts} attempts: {reason}")]
    BackendUnavailable { attempts: u32, reason: String },

    /// The adapter could not turn the raw reply into any candidate value.
    #[error("could not decode model reply: {reason}")]
    Decode { reason: String, raw: String },

    /// Every attempt produced a candidate that failed validation.
    #[error(
        "reply violated `{contract}` after {attempts} attempts: {}",
        describe_violations(.violations)
    )]
    SchemaViolation {
        contract: String,
        attempts: u32,
        violations: Vec<FieldViolation>,
        raw_output: String,
    },

    /// The partial-event stream ended without a final event.
    #[error("stream ended before a final reply: {reason}")]
    IncompleteStream { reason: String },

    // -- Runtime errors ------------------------------------------------------
    /// A turn is already in flight against the same conversation memory.
    #[error("a turn is already in progress for this conversation")]
    TurnInProgress,

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Build a transport error.
    pub fn transport(failure: TransportFailure, reason: impl Into<String>) -> Self {
        Self::Transport {
            failure,
            reason: reason.into(),
        }
    }

    /// Returns `true` for transport failures worth another attempt.
    pub fn is_retryable_transport(&self) -> bool {
        matches!(self, Self::Transport { failure, .. } if failure.is_retryable())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        let failure = if err.is_timeout() {
            TransportFailure::Timeout
        } else if let Some(status) = err.status() {
            TransportFailure::from_status(status.as_u16(), "")
        } else {
            TransportFailure::Connection
        };
        Self::transport(failure, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Transport failure classification
// ---------------------------------------------------------------------------

/// Why a single backend invocation failed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// No reply within the invocation deadline.
    Timeout,
    /// The provider throttled the request (HTTP 429 or equivalent).
    RateLimited,
    /// The provider reported a server-side failure (5xx).
    Server,
    /// The connection could not be established or was dropped.
    Connection,
    /// The provider refused the request for a reason retrying will not fix.
    Rejected,
}

fn retryable_text_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(
            r"(?i)rate.?limit|overloaded|service.?unavailable|upstream.?connect|connection.?refused",
        )
        .expect("retry regex must compile")
    })
}

impl TransportFailure {
    /// Classify a non-success HTTP status together with its error body.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => Self::RateLimited,
            500..=599 => Self::Server,
            _ if retryable_text_regex().is_match(body) => Self::Server,
            _ => Self::Rejected,
        }
    }

    /// Returns `true` if another attempt may succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate limited",
            Self::Server => "server error",
            Self::Connection => "connection",
            Self::Rejected => "rejected",
        };
        f.write_str(label)
    }
}
