use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use relay_core::errors::ModelError;

/// One agent turn's worth of model input: the agent's system prompt plus
/// the rendered context bundle. The completion is the raw text the runner
/// parses into a structured action.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
        }
    }
}

/// Trait implemented by each model backend. Concrete API-backed
/// implementations live outside the core; the engine only sees this seam.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError>;
}

/// Placeholder backend used when no real model is configured: every call
/// fails with an invalid-request error instead of crashing at startup.
pub struct UnconfiguredBackend;

#[async_trait]
impl ModelBackend for UnconfiguredBackend {
    fn name(&self) -> &str {
        "unconfigured"
    }

    fn model(&self) -> &str {
        "none"
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, ModelError> {
        Err(ModelError::InvalidRequest(
            "no model backend configured".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_backend_always_errors() {
        let backend = UnconfiguredBackend;
        let cancel = CancellationToken::new();
        let result = backend
            .complete(&CompletionRequest::new("sys", "prompt"), &cancel)
            .await;
        assert!(matches!(result, Err(ModelError::InvalidRequest(_))));
        assert_eq!(backend.name(), "unconfigured");
    }
}
