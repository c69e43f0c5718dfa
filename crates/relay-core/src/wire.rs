use serde::{Deserialize, Serialize};

use crate::forms::{FieldOption, Form, FormQuery, FormReply};
use crate::messages::{Message, MessageKind};

/// Sentinel progress status marking plan completion.
pub const WORKFLOW_FINISH: &str = "_workflow_finish";

/// The full-duplex event envelope. Everything on the wire, in both
/// directions, is `{type, payload}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireEvent {
    Markdown(String),
    Component(Component),
    UserMessage(UserMessagePayload),
    Control(ControlPayload),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "component", content = "data", rename_all = "snake_case")]
pub enum Component {
    Progress(ProgressData),
    UiInteraction(UiInteraction),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressData {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

/// Form traffic multiplexed under the `ui_interaction` component. The
/// variants are structurally disjoint: a request carries `form.fields`, a
/// reply carries `form.values`, lookups carry `query`/`results`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UiInteraction {
    FormReply { form: FormReply },
    FormRequest { form: Form },
    Query { query: FormQuery },
    QueryResults {
        results: Vec<FieldOption>,
        #[serde(rename = "hasMore")]
        has_more: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMessagePayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub action: ControlAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Cancel,
    Close,
}

impl WireEvent {
    pub fn markdown(text: impl Into<String>) -> Self {
        Self::Markdown(text.into())
    }

    pub fn progress(status: impl Into<String>) -> Self {
        Self::Component(Component::Progress(ProgressData {
            status: status.into(),
            step_index: None,
            total_steps: None,
        }))
    }

    pub fn step(status: impl Into<String>, step_index: u32, total_steps: u32) -> Self {
        Self::Component(Component::Progress(ProgressData {
            status: status.into(),
            step_index: Some(step_index),
            total_steps: Some(total_steps),
        }))
    }

    pub fn workflow_finish() -> Self {
        Self::progress(WORKFLOW_FINISH)
    }

    pub fn form_request(form: Form) -> Self {
        Self::Component(Component::UiInteraction(UiInteraction::FormRequest { form }))
    }

    pub fn query_results(results: Vec<FieldOption>, has_more: bool) -> Self {
        Self::Component(Component::UiInteraction(UiInteraction::QueryResults {
            results,
            has_more,
        }))
    }

    /// Ordinary progress indicators may be shed under backpressure;
    /// `markdown`, `form_request` and `workflow_finish` never are.
    pub fn is_droppable(&self) -> bool {
        match self {
            Self::Component(Component::Progress(p)) => p.status != WORKFLOW_FINISH,
            _ => false,
        }
    }

    /// Derive the user-visible event for a history entry, if it has one.
    /// Tool traffic and system notes stay internal.
    pub fn from_message(msg: &Message) -> Option<Self> {
        match &msg.kind {
            MessageKind::AgentMarkdown { text } => Some(Self::markdown(text.clone())),
            MessageKind::AgentProgress { status } => Some(Self::progress(status.clone())),
            MessageKind::AgentStep { index, total, title } => {
                Some(Self::step(title.clone(), *index, *total))
            }
            MessageKind::AgentFormRequest { form } => Some(Self::form_request(form.clone())),
            MessageKind::AgentWorkflowFinish => Some(Self::workflow_finish()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::Field;
    use crate::ids::FormId;
    use serde_json::json;

    #[test]
    fn markdown_wire_shape() {
        let json = serde_json::to_value(WireEvent::markdown("**hi**")).unwrap();
        assert_eq!(json, json!({"type": "markdown", "payload": "**hi**"}));
    }

    #[test]
    fn progress_wire_shape() {
        let json = serde_json::to_value(WireEvent::step("Search", 2, 2)).unwrap();
        assert_eq!(json["type"], "component");
        assert_eq!(json["payload"]["component"], "progress");
        assert_eq!(json["payload"]["data"]["status"], "Search");
        assert_eq!(json["payload"]["data"]["stepIndex"], 2);
        assert_eq!(json["payload"]["data"]["totalSteps"], 2);
    }

    #[test]
    fn workflow_finish_is_a_sentinel_status() {
        let json = serde_json::to_value(WireEvent::workflow_finish()).unwrap();
        assert_eq!(json["payload"]["data"]["status"], WORKFLOW_FINISH);
        assert!(json["payload"]["data"].get("stepIndex").is_none());
    }

    #[test]
    fn form_request_wire_shape() {
        let form = Form::new(vec![Field::text("amount", "Amount")]);
        let json = serde_json::to_value(WireEvent::form_request(form.clone())).unwrap();
        assert_eq!(json["payload"]["component"], "ui_interaction");
        assert_eq!(json["payload"]["data"]["form"]["id"], form.id.as_str());
        assert!(json["payload"]["data"]["form"]["fields"].is_array());
    }

    #[test]
    fn form_reply_parses_from_wire() {
        let raw = json!({
            "type": "component",
            "payload": {
                "component": "ui_interaction",
                "data": {"form": {"id": "form_1", "values": {"supplier": "S1", "amount": "1000"}}}
            }
        });
        let event: WireEvent = serde_json::from_value(raw).unwrap();
        match event {
            WireEvent::Component(Component::UiInteraction(UiInteraction::FormReply { form })) => {
                assert_eq!(form.id, FormId::from_raw("form_1"));
                assert_eq!(form.values["amount"], "1000");
            }
            other => panic!("expected form reply, got {other:?}"),
        }
    }

    #[test]
    fn form_request_parses_back_as_request_not_reply() {
        let form = Form::new(vec![Field::text("amount", "Amount")]);
        let json = serde_json::to_string(&WireEvent::form_request(form)).unwrap();
        let parsed: WireEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            WireEvent::Component(Component::UiInteraction(UiInteraction::FormRequest { .. }))
        ));
    }

    #[test]
    fn async_query_parses_from_wire() {
        let raw = json!({
            "type": "component",
            "payload": {
                "component": "ui_interaction",
                "data": {"query": {"formId": "form_1", "fieldKey": "supplier", "term": "acm", "page": 1}}
            }
        });
        let event: WireEvent = serde_json::from_value(raw).unwrap();
        match event {
            WireEvent::Component(Component::UiInteraction(UiInteraction::Query { query })) => {
                assert_eq!(query.field_key, "supplier");
                assert_eq!(query.term, "acm");
            }
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn query_results_use_has_more_camel_case() {
        let json = serde_json::to_value(WireEvent::query_results(
            vec![FieldOption::new("S1", "Supplier One")],
            true,
        ))
        .unwrap();
        assert_eq!(json["payload"]["data"]["hasMore"], true);
        assert_eq!(json["payload"]["data"]["results"][0]["value"], "S1");
    }

    #[test]
    fn user_message_parses_with_attachments() {
        let raw = json!({
            "type": "user_message",
            "payload": {"text": "create PO from this pdf", "attachments": [{"kind": "pdf", "ref": "s3://x"}]}
        });
        let event: WireEvent = serde_json::from_value(raw).unwrap();
        match event {
            WireEvent::UserMessage(payload) => {
                assert_eq!(payload.attachments.len(), 1);
                assert_eq!(payload.attachments[0].reference, "s3://x");
            }
            other => panic!("expected user_message, got {other:?}"),
        }
    }

    #[test]
    fn control_parses() {
        let raw = json!({"type": "control", "payload": {"action": "cancel"}});
        let event: WireEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(
            event,
            WireEvent::Control(ControlPayload {
                action: ControlAction::Cancel
            })
        );
    }

    #[test]
    fn droppability() {
        assert!(WireEvent::progress("thinking").is_droppable());
        assert!(!WireEvent::workflow_finish().is_droppable());
        assert!(!WireEvent::markdown("x").is_droppable());
        let form = Form::new(vec![]);
        assert!(!WireEvent::form_request(form).is_droppable());
    }

    #[test]
    fn events_derive_from_history() {
        let msg = Message::agent_step(1, 1, 2, "Plan query");
        let event = WireEvent::from_message(&msg).unwrap();
        assert_eq!(event, WireEvent::step("Plan query", 1, 2));

        let internal = Message::system_note(0, "cancelled");
        assert!(WireEvent::from_message(&internal).is_none());
    }
}
