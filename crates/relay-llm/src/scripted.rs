use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use relay_core::agent::AgentAction;
use relay_core::errors::ModelError;

use crate::backend::{CompletionRequest, ModelBackend};

/// Pre-programmed completions for deterministic testing without API calls.
pub enum ScriptedResponse {
    /// Return this text verbatim.
    Raw(String),
    /// Return the serialized form of a structured action.
    Action(AgentAction),
    /// Fail the call.
    Error(ModelError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<ScriptedResponse>),
}

impl ScriptedResponse {
    pub fn action(action: AgentAction) -> Self {
        Self::Action(action)
    }

    pub fn raw(text: impl Into<String>) -> Self {
        Self::Raw(text.into())
    }

    pub fn delayed(delay: Duration, inner: ScriptedResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock backend that serves scripted responses in sequence.
pub struct ScriptedBackend {
    responses: Vec<ScriptedResponse>,
    call_count: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Convenience: a script of structured actions only.
    pub fn actions(actions: Vec<AgentAction>) -> Self {
        Self::new(actions.into_iter().map(ScriptedResponse::Action).collect())
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError> {
        if cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }

        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let Some(response) = self.responses.get(idx) else {
            return Err(ModelError::InvalidRequest(format!(
                "ScriptedBackend: no response configured for call {idx}"
            )));
        };

        let mut current = response;
        loop {
            match current {
                ScriptedResponse::Raw(text) => return Ok(text.clone()),
                ScriptedResponse::Action(action) => {
                    return serde_json::to_string(action)
                        .map_err(|e| ModelError::InvalidRequest(e.to_string()));
                }
                ScriptedResponse::Error(e) => return Err(e.clone()),
                ScriptedResponse::Delay(duration, inner) => {
                    tokio::select! {
                        _ = tokio::time::sleep(*duration) => {}
                        _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                    }
                    current = inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> CompletionRequest {
        CompletionRequest::new("sys", "prompt")
    }

    #[tokio::test]
    async fn serves_actions_in_sequence() {
        let backend = ScriptedBackend::actions(vec![
            AgentAction::EmitMarkdown { text: "one".into() },
            AgentAction::FinishStep { output: json!({}) },
        ]);
        let cancel = CancellationToken::new();

        let first = backend.complete(&request(), &cancel).await.unwrap();
        assert_eq!(AgentAction::parse(&first).unwrap().action_str(), "emit_markdown");

        let second = backend.complete(&request(), &cancel).await.unwrap();
        assert_eq!(AgentAction::parse(&second).unwrap().action_str(), "finish_step");
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let backend = ScriptedBackend::actions(vec![]);
        let cancel = CancellationToken::new();
        let err = backend.complete(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, ModelError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn scripted_error_surfaces() {
        let backend = ScriptedBackend::new(vec![ScriptedResponse::Error(ModelError::Overloaded)]);
        let cancel = CancellationToken::new();
        let err = backend.complete(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, ModelError::Overloaded));
    }

    #[tokio::test]
    async fn delayed_response_waits() {
        let backend = ScriptedBackend::new(vec![ScriptedResponse::delayed(
            Duration::from_millis(50),
            ScriptedResponse::raw("late"),
        )]);
        let cancel = CancellationToken::new();

        let start = std::time::Instant::now();
        let result = backend.complete(&request(), &cancel).await.unwrap();
        assert_eq!(result, "late");
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn cancellation_interrupts_delay() {
        let backend = ScriptedBackend::new(vec![ScriptedResponse::delayed(
            Duration::from_secs(30),
            ScriptedResponse::raw("never"),
        )]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = backend.complete(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, ModelError::Cancelled));
    }
}
