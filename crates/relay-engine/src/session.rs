use std::time::Instant;

use relay_core::checkpoint::Checkpoint;
use relay_core::forms::Form;
use relay_core::ids::SessionKey;
use relay_core::messages::{Message, MessageKind};
use relay_core::plan::Plan;
use relay_core::session::SessionState;

/// In-memory session state owned exclusively by the orchestrator while a
/// request is active. The durable copy lives with the checkpointer.
pub struct Session {
    pub key: SessionKey,
    pub history: Vec<Message>,
    pub plan: Plan,
    pub state: SessionState,
    pub pending_interrupt: Option<Form>,
    /// Version of the last committed checkpoint.
    pub version: u64,
    /// Sequence number of the last persisted history entry.
    pub history_hwm: u64,
    /// Step index stamped onto new messages.
    pub step_index: u32,
    /// Last committed transition, for idle TTL expiry.
    pub last_activity: Instant,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            history: Vec::new(),
            plan: Plan::default(),
            state: SessionState::Idle,
            pending_interrupt: None,
            version: 0,
            history_hwm: 0,
            step_index: 0,
            last_activity: Instant::now(),
        }
    }

    /// Rebuild a session from its latest checkpoint plus replayed history.
    pub fn from_checkpoint(key: SessionKey, checkpoint: Checkpoint, history: Vec<Message>) -> Self {
        let step_index = checkpoint.state.current_step().unwrap_or(0);
        Self {
            key,
            history,
            plan: checkpoint.plan,
            state: checkpoint.state,
            pending_interrupt: checkpoint.pending_interrupt,
            version: checkpoint.version,
            history_hwm: checkpoint.history_hwm,
            step_index,
            last_activity: Instant::now(),
        }
    }

    /// The user message that triggered the current cycle (latest user text).
    pub fn triggering_message(&self) -> Option<&Message> {
        self.history
            .iter()
            .rev()
            .find(|m| matches!(m.kind, MessageKind::UserText { .. }))
    }

    pub fn triggering_text(&self) -> &str {
        self.triggering_message().and_then(|m| m.text()).unwrap_or("")
    }

    /// Tool results produced earlier within the given step.
    pub fn step_tool_results(&self, step: u32) -> Vec<&Message> {
        self.history
            .iter()
            .filter(|m| m.step_index == step && matches!(m.kind, MessageKind::ToolResult { .. }))
            .collect()
    }

    /// Count of tool calls already issued in the given step, used to derive
    /// deterministic invocation ids for replay dedupe.
    pub fn tool_calls_in_step(&self, step: u32) -> u32 {
        self.history
            .iter()
            .filter(|m| m.step_index == step && matches!(m.kind, MessageKind::ToolCall { .. }))
            .count() as u32
    }

    /// The form request / reply pair for the current step, if present.
    pub fn current_form_pair(&self, step: u32) -> Vec<&Message> {
        self.history
            .iter()
            .filter(|m| {
                m.step_index == step
                    && matches!(
                        m.kind,
                        MessageKind::AgentFormRequest { .. } | MessageKind::UserFormReply { .. }
                    )
            })
            .collect()
    }
}
