use crate::models::OrderId;
use std::fmt;
use thiserror::Error;

/// Failure returned by a broker gateway call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("rejected by broker (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The payload could not be parsed. `order_id` is set when the broker
    /// accepted an order before the rest of the response went bad.
    #[error("malformed response: {message}")]
    Malformed {
        message: String,
        order_id: Option<OrderId>,
    },
}

impl GatewayError {
    pub fn malformed(message: impl Into<String>) -> Self {
        GatewayError::Malformed {
            message: message.into(),
            order_id: None,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            GatewayError::Transport(_) => FailureKind::Transport,
            GatewayError::Auth(_) => FailureKind::Auth,
            GatewayError::Rejected { status, .. } => FailureKind::Rejected(*status),
            GatewayError::Malformed { .. } => FailureKind::Malformed,
        }
    }

    /// Transport and auth failures may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transport(_) | GatewayError::Auth(_))
    }

    /// Id of an order the broker accepted despite the failure
    pub fn accepted_order_id(&self) -> Option<OrderId> {
        match self {
            GatewayError::Malformed { order_id, .. } => *order_id,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::malformed(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// Coarse failure category shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    Auth,
    Rejected(u16),
    Malformed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transport => f.write_str("transport"),
            FailureKind::Auth => f.write_str("auth"),
            FailureKind::Rejected(status) => write!(f, "rejected({})", status),
            FailureKind::Malformed => f.write_str("malformed"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("order {0} is already registered")]
    Duplicate(OrderId),

    #[error("order {0} is not registered")]
    Unknown(OrderId),
}

/// Errors the lifecycle manager cannot recover from
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition {from} -> {to}")]
    StateConflict { from: String, to: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(GatewayError::Transport("timeout".into()).is_retryable());
        assert!(GatewayError::Auth("expired".into()).is_retryable());
        assert!(!GatewayError::Rejected {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!GatewayError::malformed("junk").is_retryable());
    }

    #[test]
    fn test_failure_kind_display() {
        let err = GatewayError::Rejected {
            status: 422,
            message: "insufficient buying power".into(),
        };
        assert_eq!(err.kind().to_string(), "rejected(422)");
        assert_eq!(FailureKind::Transport.to_string(), "transport");
    }

    #[test]
    fn test_accepted_order_id_only_on_malformed() {
        let err = GatewayError::Malformed {
            message: "missing child".into(),
            order_id: Some(OrderId(42)),
        };
        assert_eq!(err.accepted_order_id(), Some(OrderId(42)));
        assert_eq!(
            GatewayError::Transport("reset".into()).accepted_order_id(),
            None
        );
    }
}
