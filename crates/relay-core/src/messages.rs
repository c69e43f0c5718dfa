use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorKind;
use crate::forms::{Form, FormReply};
use crate::ids::{InvocationId, MessageId};

/// Who produced a history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    Tool,
    System,
}

/// One entry in a session's append-only history. History is the single
/// source of truth; user-visible events are derived from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub timestamp: String,
    pub role: Role,
    pub step_index: u32,
    /// Pinned entries survive context-window trimming.
    #[serde(default)]
    pub pinned: bool,
    #[serde(flatten)]
    pub kind: MessageKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    UserText {
        text: String,
    },
    UserFormReply {
        reply: FormReply,
    },
    UserAttachmentRef {
        attachment_kind: String,
        reference: String,
    },
    AgentMarkdown {
        text: String,
    },
    AgentProgress {
        status: String,
    },
    AgentStep {
        index: u32,
        total: u32,
        title: String,
    },
    AgentFormRequest {
        form: Form,
    },
    AgentWorkflowFinish,
    ToolCall {
        invocation_id: InvocationId,
        tool: String,
        inputs: Value,
    },
    ToolResult {
        invocation_id: InvocationId,
        tool: String,
        output: Value,
        is_error: bool,
    },
    SystemNote {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
    },
}

impl Message {
    fn new(role: Role, step_index: u32, kind: MessageKind) -> Self {
        Self {
            id: MessageId::new(),
            timestamp: Utc::now().to_rfc3339(),
            role,
            step_index,
            pinned: false,
            kind,
        }
    }

    pub fn user_text(step_index: u32, text: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::User, step_index, MessageKind::UserText { text: text.into() });
        msg.pinned = true;
        msg
    }

    pub fn user_form_reply(step_index: u32, reply: FormReply) -> Self {
        Self::new(Role::User, step_index, MessageKind::UserFormReply { reply })
    }

    pub fn user_attachment(
        step_index: u32,
        attachment_kind: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        Self::new(
            Role::User,
            step_index,
            MessageKind::UserAttachmentRef {
                attachment_kind: attachment_kind.into(),
                reference: reference.into(),
            },
        )
    }

    pub fn agent_markdown(step_index: u32, text: impl Into<String>) -> Self {
        Self::new(Role::Agent, step_index, MessageKind::AgentMarkdown { text: text.into() })
    }

    pub fn agent_progress(step_index: u32, status: impl Into<String>) -> Self {
        Self::new(Role::Agent, step_index, MessageKind::AgentProgress { status: status.into() })
    }

    pub fn agent_step(step_index: u32, index: u32, total: u32, title: impl Into<String>) -> Self {
        Self::new(
            Role::Agent,
            step_index,
            MessageKind::AgentStep {
                index,
                total,
                title: title.into(),
            },
        )
    }

    pub fn agent_form_request(step_index: u32, form: Form) -> Self {
        Self::new(Role::Agent, step_index, MessageKind::AgentFormRequest { form })
    }

    pub fn workflow_finish(step_index: u32) -> Self {
        Self::new(Role::Agent, step_index, MessageKind::AgentWorkflowFinish)
    }

    pub fn tool_call(
        step_index: u32,
        invocation_id: InvocationId,
        tool: impl Into<String>,
        inputs: Value,
    ) -> Self {
        Self::new(
            Role::Tool,
            step_index,
            MessageKind::ToolCall {
                invocation_id,
                tool: tool.into(),
                inputs,
            },
        )
    }

    pub fn tool_result(
        step_index: u32,
        invocation_id: InvocationId,
        tool: impl Into<String>,
        output: Value,
        is_error: bool,
    ) -> Self {
        Self::new(
            Role::Tool,
            step_index,
            MessageKind::ToolResult {
                invocation_id,
                tool: tool.into(),
                output,
                is_error,
            },
        )
    }

    pub fn system_note(step_index: u32, text: impl Into<String>) -> Self {
        Self::new(
            Role::System,
            step_index,
            MessageKind::SystemNote {
                text: text.into(),
                error_kind: None,
            },
        )
    }

    pub fn system_error(step_index: u32, text: impl Into<String>, kind: ErrorKind) -> Self {
        Self::new(
            Role::System,
            step_index,
            MessageKind::SystemNote {
                text: text.into(),
                error_kind: Some(kind),
            },
        )
    }

    pub fn kind_str(&self) -> &'static str {
        match &self.kind {
            MessageKind::UserText { .. } => "user_text",
            MessageKind::UserFormReply { .. } => "user_form_reply",
            MessageKind::UserAttachmentRef { .. } => "user_attachment_ref",
            MessageKind::AgentMarkdown { .. } => "agent_markdown",
            MessageKind::AgentProgress { .. } => "agent_progress",
            MessageKind::AgentStep { .. } => "agent_step",
            MessageKind::AgentFormRequest { .. } => "agent_form_request",
            MessageKind::AgentWorkflowFinish => "agent_workflow_finish",
            MessageKind::ToolCall { .. } => "tool_call",
            MessageKind::ToolResult { .. } => "tool_result",
            MessageKind::SystemNote { .. } => "system_note",
        }
    }

    /// Text content for relevance queries and prompt rendering, if any.
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::UserText { text }
            | MessageKind::AgentMarkdown { text }
            | MessageKind::SystemNote { text, .. } => Some(text),
            _ => None,
        }
    }
}
