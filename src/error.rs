//! Error types for fwctl

use std::io;
use thiserror::Error;
use uuid::Uuid;

use crate::firewall::backend::EngineError;

#[derive(Debug, Error)]
pub enum FirewallError {
    /// The packet-filtering facility cannot be reached
    #[error("Filtering engine unavailable: {0}")]
    EngineUnavailable(String),
    /// Caller lacks the rights to manage filtering objects
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// Role name not present in the identity registry
    #[error("Unknown role: {0}")]
    UnknownRole(String),
    /// A pre-existing sublayer carries a weight this version does not expect
    #[error("Sublayer {role} ({id}) has weight {found}, expected {expected}")]
    WeightConflict {
        role: &'static str,
        id: Uuid,
        expected: u16,
        found: u16,
    },
    /// Transition requested without the parameters its state requires
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    /// The engine refused or failed the transaction; prior state is intact
    #[error("Transaction aborted: {reason}")]
    TransactionAborted { reason: String, roles: Vec<String> },
    /// An engine call did not return within the configured bound
    #[error("Engine call timed out: {operation} after {timeout_ms} ms")]
    EngineTimeout {
        operation: String,
        timeout_ms: u64,
        roles: Vec<String>,
    },
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FirewallError {
    /// Map an engine-level failure that happened outside of a filter diff.
    pub fn from_engine(error: EngineError, context: &str) -> Self {
        Self::from_engine_with_roles(error, context, Vec::new())
    }

    /// Map an engine-level failure, attaching the roles that were in flight.
    pub fn from_engine_with_roles(error: EngineError, context: &str, roles: Vec<String>) -> Self {
        match error {
            EngineError::Unavailable(msg) => {
                FirewallError::EngineUnavailable(format!("{}: {}", context, msg))
            }
            EngineError::AccessDenied(msg) => {
                FirewallError::PermissionDenied(format!("{}: {}", context, msg))
            }
            other => FirewallError::TransactionAborted {
                reason: format!("{}: {}", context, other),
                roles,
            },
        }
    }

    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FirewallError::TransactionAborted { .. } | FirewallError::EngineTimeout { .. }
        )
    }

    /// Whether the firewall cannot be established at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FirewallError::EngineUnavailable(_)
                | FirewallError::PermissionDenied(_)
                | FirewallError::UnknownRole(_)
                | FirewallError::WeightConflict { .. }
        )
    }

    /// Role names attached to a failed transaction, if any.
    pub fn roles(&self) -> &[String] {
        match self {
            FirewallError::TransactionAborted { roles, .. }
            | FirewallError::EngineTimeout { roles, .. } => roles,
            _ => &[],
        }
    }
}

impl From<ipnetwork::IpNetworkError> for FirewallError {
    fn from(error: ipnetwork::IpNetworkError) -> Self {
        FirewallError::InvalidParams(error.to_string())
    }
}

pub type FirewallResult<T> = Result<T, FirewallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_mapping() {
        let unavailable = EngineError::Unavailable("no service".into());
        let err = FirewallError::from_engine(unavailable, "open session");
        assert!(matches!(err, FirewallError::EngineUnavailable(_)));
        assert!(err.is_fatal());

        let denied = EngineError::AccessDenied("not admin".into());
        let err = FirewallError::from_engine(denied, "add provider");
        assert!(matches!(err, FirewallError::PermissionDenied(_)));

        let err = FirewallError::from_engine_with_roles(
            EngineError::Busy("locked".into()),
            "begin transaction",
            vec!["permit-vpn-relay".to_string()],
        );
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert_eq!(err.roles(), ["permit-vpn-relay".to_string()]);
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = FirewallError::EngineTimeout {
            operation: "add filter".to_string(),
            timeout_ms: 100,
            roles: vec![],
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("100 ms"));
    }
}
