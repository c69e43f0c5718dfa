use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Machine-readable failure classification retained in history.
/// User-visible failures are rendered as markdown; this kind never
/// travels on the event stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Permission,
    ToolTransient,
    ToolPermanent,
    Timeout,
    Cancelled,
    Model,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::ToolTransient => "tool_transient",
            Self::ToolPermanent => "tool_permanent",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Model => "model",
            Self::Internal => "internal",
        }
    }
}

/// Typed error hierarchy for model backend calls.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ModelError {
    // Fatal, never retried
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed agent action: {0}")]
    MalformedAction(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("backend overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::Overloaded | Self::Network(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::MalformedAction(_))
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::MalformedAction(_) => "malformed_action",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ModelError::RateLimited { retry_after: None }.is_retryable());
        assert!(ModelError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(ModelError::Overloaded.is_retryable());
        assert!(ModelError::Network("tcp".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(ModelError::InvalidRequest("bad".into()).is_fatal());
        assert!(ModelError::MalformedAction("not json".into()).is_fatal());
        assert!(!ModelError::Overloaded.is_fatal());
    }

    #[test]
    fn not_retryable_and_not_fatal() {
        let timeout = ModelError::Timeout(Duration::from_secs(30));
        assert!(!timeout.is_retryable());
        assert!(!timeout.is_fatal());

        let cancelled = ModelError::Cancelled;
        assert!(!cancelled.is_retryable());
        assert!(!cancelled.is_fatal());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = ModelError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(5)));
        assert_eq!(ModelError::Overloaded.suggested_delay(), None);
    }

    #[test]
    fn kind_mapping() {
        assert_eq!(ModelError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            ModelError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(ModelError::Overloaded.kind(), ErrorKind::Model);
    }

    #[test]
    fn error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::ToolPermanent).unwrap();
        assert_eq!(json, "\"tool_permanent\"");
        assert_eq!(ErrorKind::ToolPermanent.as_str(), "tool_permanent");
    }
}
