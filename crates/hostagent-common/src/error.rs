//! Error taxonomy for goal-state programming.
//!
//! Every data-driven failure maps onto one of these variants; only impossible
//! internal states are allowed to become process-level faults.

use hostagent_types::ParseError;
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors raised by the registry, the dataplane programmers and the
/// on-demand resolution engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// Malformed or empty required field, bad mac/ip syntax, tunnel id out of range.
    #[error("Invalid argument {field}: {message}")]
    InvalidArgument {
        /// The offending field.
        field: String,
        /// Error message.
        message: String,
    },

    /// Operation on an id with no in-memory entry.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Kind of object looked up (tunnel, router, subnet, ...).
        kind: String,
        /// The identifier.
        id: String,
    },

    /// State on this host contradicts the request.
    #[error("Conflict: {message}")]
    Conflict {
        /// Error message.
        message: String,
    },

    /// A switch or orchestrator collaborator failed.
    #[error("Upstream operation failed: {operation}: {message}")]
    Upstream {
        /// The collaborator call that failed.
        operation: String,
        /// Error message.
        message: String,
    },

    /// A time-bounded wait ran out.
    #[error("Timed out: {operation}")]
    Timeout {
        /// What was being waited for.
        operation: String,
    },

    /// Some items of a batch failed; the rest were applied.
    #[error("{operation}: {} of {total} items failed", .errors.len())]
    PartialFailure {
        /// The batch operation.
        operation: String,
        /// Number of items attempted.
        total: usize,
        /// The individual failures, in order.
        errors: Vec<AgentError>,
    },
}

impl AgentError {
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an error for a required field that arrived empty.
    pub fn empty_field(field: impl Into<String>) -> Self {
        Self::invalid_argument(field, "must not be empty")
    }

    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn upstream(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Wraps a parse failure for the named field.
    pub fn from_parse(field: impl Into<String>, err: ParseError) -> Self {
        Self::invalid_argument(field, err.to_string())
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Upstream { .. } | AgentError::Timeout { .. } => true,
            AgentError::PartialFailure { errors, .. } => errors.iter().all(|e| e.is_retryable()),
            _ => false,
        }
    }

    /// Returns true if the error was caused by malformed input only.
    pub fn is_invalid_argument(&self) -> bool {
        match self {
            AgentError::InvalidArgument { .. } => true,
            AgentError::PartialFailure { errors, .. } => {
                !errors.is_empty() && errors.iter().all(|e| e.is_invalid_argument())
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AgentError::NotFound { .. })
    }
}

impl From<ParseError> for AgentError {
    fn from(err: ParseError) -> Self {
        let field = match &err {
            ParseError::InvalidMacAddress(_) => "mac_address",
            ParseError::InvalidIpAddress(_) => "ip_address",
            ParseError::InvalidCidr(_) => "cidr",
            ParseError::InvalidLocalTag(_) => "local_tag",
            ParseError::InvalidTunnelId { .. } => "tunnel_id",
            ParseError::InvalidNetworkType(_) => "network_type",
        };
        Self::from_parse(field, err)
    }
}
