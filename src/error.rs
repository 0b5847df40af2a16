//! Error types for the signer

use thiserror::Error;

use crate::pki::IssueError;

/// Main error type for signer operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Status write lost an optimistic-concurrency race too many times
    #[error("conflict: {0}")]
    Conflict(String),

    /// Issuance for a request failed
    #[error("issuance failed: {0}")]
    Issue(#[from] IssueError),

    /// Invalid process configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// True for HTTP 409 from the API server or an exhausted conflict retry
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// True when the request itself is unacceptable and retrying soon is pointless
    pub fn is_request_invalid(&self) -> bool {
        matches!(self, Self::Issue(e) if e.is_request_invalid())
    }

    /// Short machine-readable label, used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Kube(_) => "KubeError",
            Self::Conflict(_) => "Conflict",
            Self::Issue(e) => e.reason(),
            Self::Configuration(_) => "Configuration",
        }
    }
}
