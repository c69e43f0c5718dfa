use serde::{Deserialize, Serialize};

use crate::ids::FormId;

/// The per-session orchestration state machine. Every transition is
/// checkpointed before its events are published.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Session exists, no active request.
    Idle,
    /// Running the input validator agent.
    Validating,
    /// Running the planner agent; produces the plan.
    Planning,
    /// Running the agent bound to `plan[step]`.
    Executing { step: u32 },
    /// Suspended on an outbound form. No model calls happen here.
    AwaitingHuman { step: u32, form_id: FormId },
    /// Deciding whether to retry, skip, or abort after a step failure.
    Recovering { step: u32, reason: String },
    /// Running the synthesizer agent; emits the final markdown.
    Synthesizing,
    /// Plan complete; next user message starts a fresh cycle.
    Terminal,
}

impl SessionState {
    /// Tag persisted alongside checkpoints for indexed recovery queries.
    pub fn state_tag(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Planning => "planning",
            Self::Executing { .. } => "executing",
            Self::AwaitingHuman { .. } => "awaiting_human",
            Self::Recovering { .. } => "recovering",
            Self::Synthesizing => "synthesizing",
            Self::Terminal => "terminal",
        }
    }

    /// States with an agent or tool actively running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Validating | Self::Planning | Self::Executing { .. } | Self::Recovering { .. } | Self::Synthesizing
        )
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::AwaitingHuman { .. })
    }

    pub fn current_step(&self) -> Option<u32> {
        match self {
            Self::Executing { step }
            | Self::AwaitingHuman { step, .. }
            | Self::Recovering { step, .. } => Some(*step),
            _ => None,
        }
    }
}
