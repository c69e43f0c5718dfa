use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ModelError;
use crate::forms::Form;

/// A named specialist agent, modeled as data: prompt, permitted tools,
/// model handle. Agents differ in configuration, not in code shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    #[serde(default)]
    pub permitted_tools: Vec<String>,
    pub model: String,
    /// Conversation window size for this agent's context bundles.
    #[serde(default = "default_context_turns")]
    pub context_turns: u32,
}

fn default_context_turns() -> u32 {
    12
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            system_prompt: String::new(),
            permitted_tools: Vec::new(),
            model: model.into(),
            context_turns: default_context_turns(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn permit_tools(mut self, tools: &[&str]) -> Self {
        self.permitted_tools = tools.iter().map(|t| (*t).to_string()).collect();
        self
    }

    pub fn permits_tool(&self, name: &str) -> bool {
        self.permitted_tools.iter().any(|t| t == name)
    }
}

/// One structured action per agent turn. The model is constrained to this
/// schema; anything else is rejected (one retry, then a permanent error).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentAction {
    EmitMarkdown {
        text: String,
    },
    EmitProgress {
        status: String,
    },
    CallTool {
        name: String,
        inputs: Value,
    },
    /// Explicit parallel batch: calls run concurrently, results commit to
    /// history in issue order.
    CallTools {
        calls: Vec<ToolCallRequest>,
    },
    RequestForm {
        form: Form,
    },
    Delegate {
        agent_name: String,
        inputs: Value,
    },
    FinishStep {
        output: Value,
    },
    FailStep {
        reason: String,
    },
    WriteMemory {
        key: String,
        content: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    pub inputs: Value,
}

impl AgentAction {
    /// Parse a raw model completion into an action. The completion must be
    /// a single JSON object with an `action` tag.
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let trimmed = strip_code_fence(raw.trim());
        serde_json::from_str(trimmed)
            .map_err(|e| ModelError::MalformedAction(format!("{e}: {}", truncate(trimmed, 200))))
    }

    pub fn action_str(&self) -> &'static str {
        match self {
            Self::EmitMarkdown { .. } => "emit_markdown",
            Self::EmitProgress { .. } => "emit_progress",
            Self::CallTool { .. } => "call_tool",
            Self::CallTools { .. } => "call_tools",
            Self::RequestForm { .. } => "request_form",
            Self::Delegate { .. } => "delegate",
            Self::FinishStep { .. } => "finish_step",
            Self::FailStep { .. } => "fail_step",
            Self::WriteMemory { .. } => "write_memory",
        }
    }

    /// Actions that end the current step.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinishStep { .. } | Self::FailStep { .. })
    }
}

/// Models often wrap JSON in a markdown fence despite instructions.
fn strip_code_fence(raw: &str) -> &str {
    let raw = raw
        .strip_prefix("```json")
        .or_else(|| raw.strip_prefix("```"))
        .unwrap_or(raw);
    raw.strip_suffix("```").unwrap_or(raw).trim()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_finish_step() {
        let action = AgentAction::parse(r#"{"action": "finish_step", "output": {"ok": true}}"#).unwrap();
        assert_eq!(action, AgentAction::FinishStep { output: json!({"ok": true}) });
        assert!(action.is_terminal());
    }

    #[test]
    fn parse_call_tool() {
        let action =
            AgentAction::parse(r#"{"action": "call_tool", "name": "order_search", "inputs": {"q": "acme"}}"#)
                .unwrap();
        assert_eq!(action.action_str(), "call_tool");
        assert!(!action.is_terminal());
    }

    #[test]
    fn parse_batch() {
        let action = AgentAction::parse(
            r#"{"action": "call_tools", "calls": [
                {"name": "order_search", "inputs": {"q": "a"}},
                {"name": "order_search", "inputs": {"q": "b"}}
            ]}"#,
        )
        .unwrap();
        match action {
            AgentAction::CallTools { calls } => assert_eq!(calls.len(), 2),
            other => panic!("expected call_tools, got {other:?}"),
        }
    }

    #[test]
    fn parse_strips_code_fence() {
        let raw = "```json\n{\"action\": \"emit_markdown\", \"text\": \"hi\"}\n```";
        let action = AgentAction::parse(raw).unwrap();
        assert_eq!(action, AgentAction::EmitMarkdown { text: "hi".into() });
    }

    #[test]
    fn malformed_output_is_rejected() {
        let err = AgentAction::parse("I think the answer is Paris.").unwrap_err();
        assert!(matches!(err, ModelError::MalformedAction(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = AgentAction::parse(r#"{"action": "launch_rocket"}"#).unwrap_err();
        assert!(matches!(err, ModelError::MalformedAction(_)));
    }

    #[test]
    fn agent_spec_tool_permissions() {
        let spec = AgentSpec::new("tool_executor", "default")
            .permit_tools(&["order_search", "create_po"]);
        assert!(spec.permits_tool("order_search"));
        assert!(!spec.permits_tool("delete_everything"));
    }

    #[test]
    fn agent_spec_deserializes_with_defaults() {
        let spec: AgentSpec = serde_json::from_value(json!({
            "name": "input_validator",
            "system_prompt": "Validate.",
            "model": "default"
        }))
        .unwrap();
        assert_eq!(spec.context_turns, 12);
        assert!(spec.permitted_tools.is_empty());
    }
}
