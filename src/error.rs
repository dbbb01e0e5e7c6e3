//! Error types for the hot-plug harness
//!
//! Provides structured error types for the command channel, the three
//! platform actors, the pod utility and the scenarios driving them.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Transport / Command Errors
    // =========================================================================
    #[error("Transport failure to {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("Command `{command}` on {endpoint} exited with {status}: {stderr}")]
    Command {
        endpoint: String,
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Operation `{operation}` timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("JSON-RPC method {method} failed with code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    #[error("Capacity exceeded: requested {requested} devices, ceiling is {ceiling}")]
    CapacityExceeded { requested: usize, ceiling: usize },

    // =========================================================================
    // Consistency Errors
    // =========================================================================
    #[error("Consistency check `{check}` failed: expected {expected}, observed {actual}")]
    Consistency {
        check: String,
        expected: String,
        actual: String,
    },

    #[error("Condition `{condition}` not met after {attempts} attempts")]
    PollTimeout { condition: String, attempts: u32 },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Startup failed for {component}: {reason}")]
    Startup { component: String, reason: String },

    #[error("Invalid transition for device {device}: {from} -> {to}")]
    InvalidTransition {
        device: String,
        from: String,
        to: String,
    },

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by scenarios and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Remote command or API call failed or timed out
    Transport,
    /// Sequential attach hit the capacity ceiling
    Capacity,
    /// Observed state disagrees with the expected post-condition
    Consistency,
    /// Bad configuration, never retried
    Configuration,
    /// Everything else
    Internal,
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Transport { .. }
            | Error::Command { .. }
            | Error::Timeout { .. }
            | Error::Rpc { .. }
            | Error::Http(_)
            | Error::Kube(_)
            | Error::Startup { .. } => ErrorCategory::Transport,

            Error::CapacityExceeded { .. } => ErrorCategory::Capacity,

            Error::Consistency { .. } | Error::PollTimeout { .. } => ErrorCategory::Consistency,

            Error::Configuration(_) | Error::YamlParse(_) => ErrorCategory::Configuration,

            _ => ErrorCategory::Internal,
        }
    }

    /// Check if this error came from the transport layer
    pub fn is_transport(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }

    /// Check if this error means the target object is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Build a consistency error from an expected/actual pair
    pub fn consistency(
        check: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Error::Consistency {
            check: check.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Result type alias for the harness
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = Error::CapacityExceeded {
            requested: 9,
            ceiling: 8,
        };
        assert_eq!(err.category(), ErrorCategory::Capacity);

        let err = Error::Command {
            endpoint: "storage".into(),
            command: "ss -ltn".into(),
            status: 1,
            stderr: "boom".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert!(err.is_transport());

        let err = Error::consistency("host device count", 2, 0);
        assert_eq!(err.category(), ErrorCategory::Consistency);
        assert_eq!(
            err.to_string(),
            "Consistency check `host device count` failed: expected 2, observed 0"
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.is_transport());
    }

    #[test]
    fn test_not_found_detection() {
        let missing = Error::ResourceNotFound {
            kind: "Pod".into(),
            name: "test-pod0".into(),
        };
        assert!(missing.is_not_found());

        let api = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "pods \"test-pod0\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        }));
        assert!(api.is_not_found());

        let timeout = Error::Timeout {
            operation: "ping".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(!timeout.is_not_found());
    }
}
