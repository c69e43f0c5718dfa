use relay_core::errors::{ErrorKind, ModelError};
use relay_core::plan::PlanError;
use relay_core::tools::ToolError;
use relay_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("validation: {0}")]
    Validation(String),

    #[error("permission: {0}")]
    Permission(String),

    #[error("session busy: {0}")]
    SessionBusy(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Model(e) => e.kind(),
            Self::Tool(e) => e.kind(),
            Self::Validation(_) | Self::SessionBusy(_) => ErrorKind::Validation,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Store(_) | Self::Plan(_) | Self::UnknownAgent(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kinds_propagate_from_sources() {
        assert_eq!(
            EngineError::from(ToolError::Transient("io".into())).kind(),
            ErrorKind::ToolTransient
        );
        assert_eq!(
            EngineError::from(ModelError::Timeout(Duration::from_secs(1))).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(EngineError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            EngineError::Validation("empty".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::Internal("invariant".into()).kind(),
            ErrorKind::Internal
        );
    }
}
