use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use relay_core::agent::{AgentAction, AgentSpec};
use relay_core::errors::ModelError;
use relay_llm::{CompletionRequest, ModelRouter};

use crate::assembler::{render_bundle, ContextBundle};
use crate::error::EngineError;

/// Appended to every agent's system prompt so the model produces exactly
/// one structured action per turn.
const ACTION_INSTRUCTIONS: &str = "\n\nRespond with exactly one JSON object and nothing else. \
The object has an \"action\" field set to one of: emit_markdown, emit_progress, call_tool, \
call_tools, request_form, delegate, finish_step, fail_step, write_memory, with that action's \
fields alongside.";

const STRICT_RETRY_SUFFIX: &str = "\n\nYour previous reply was not a valid action object. \
Output ONLY the JSON object, with no prose and no code fences.";

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Retries for malformed model output before surfacing a permanent
    /// error.
    pub malformed_retries: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            malformed_retries: 1,
        }
    }
}

/// Runs one agent for one turn: prompt → model → structured action.
/// The model handle resolves at invocation time so sessions pick up model
/// swaps mid-flight.
pub struct AgentRunner {
    router: Arc<ModelRouter>,
    config: RunnerConfig,
}

impl AgentRunner {
    pub fn new(router: Arc<ModelRouter>, config: RunnerConfig) -> Self {
        Self { router, config }
    }

    #[instrument(skip(self, bundle, cancel), fields(agent = %spec.name, model = %spec.model))]
    pub async fn run_turn(
        &self,
        spec: &AgentSpec,
        bundle: &ContextBundle,
        cancel: &CancellationToken,
    ) -> Result<AgentAction, EngineError> {
        let backend = self.router.resolve(&spec.model)?;
        let prompt = render_bundle(bundle);
        let system = format!("{}{ACTION_INSTRUCTIONS}", spec.system_prompt);

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let request = if attempt == 0 {
                CompletionRequest::new(&system, &prompt)
            } else {
                CompletionRequest::new(format!("{system}{STRICT_RETRY_SUFFIX}"), &prompt)
            };

            let raw = backend.complete(&request, cancel).await.map_err(|e| {
                if matches!(e, ModelError::Cancelled) {
                    EngineError::Cancelled
                } else {
                    EngineError::Model(e)
                }
            })?;

            match AgentAction::parse(&raw) {
                Ok(action) => return Ok(action),
                Err(e) if attempt < self.config.malformed_retries => {
                    warn!(
                        agent = %spec.name,
                        attempt = attempt + 1,
                        "malformed agent action, retrying under stricter prompt"
                    );
                    attempt += 1;
                    let _ = e;
                }
                Err(e) => return Err(EngineError::Model(e)),
            }
        }
    }
}
