use std::collections::HashSet;
use std::sync::Arc;

use relay_core::agent::AgentSpec;
use relay_core::catalog::{AgentCatalog, TenantPolicy};
use relay_core::ids::MessageId;
use relay_core::messages::{Message, MessageKind};
use relay_core::plan::PlanStep;
use relay_core::tools::ToolDescriptor;
use relay_store::{MemoryScope, MemoryStore, ScoredItem};

use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::session::Session;

#[derive(Clone, Debug)]
pub struct AssemblerConfig {
    /// Fallback window size when an agent spec does not set one.
    pub default_turns: usize,
    /// Top-M memory items per bundle.
    pub memory_items: usize,
    /// Total bundle bound, estimated at ~4 chars per token.
    pub token_budget: u32,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            default_turns: 12,
            memory_items: 8,
            token_budget: 12_000,
        }
    }
}

/// The bounded view of conversation, memory, tools, and peers presented to
/// one agent for one invocation. Never persisted as primary state.
#[derive(Clone, Debug)]
pub struct ContextBundle {
    pub agent_name: String,
    pub conversation: Vec<Message>,
    pub memory: Vec<ScoredItem>,
    pub tools: Vec<ToolDescriptor>,
    pub roster: Vec<(String, String)>,
    pub step: Option<PlanStep>,
    pub step_tool_results: Vec<Message>,
}

/// Builds per-step context bundles. Pure given its inputs and a memory
/// snapshot: the same session state produces the same bundle.
pub struct ContextAssembler {
    memory: Arc<MemoryStore>,
    registry: Arc<ToolRegistry>,
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(memory: Arc<MemoryStore>, registry: Arc<ToolRegistry>, config: AssemblerConfig) -> Self {
        Self {
            memory,
            registry,
            config,
        }
    }

    pub async fn assemble(
        &self,
        session: &Session,
        agents: &AgentCatalog,
        agent: &AgentSpec,
        step: Option<&PlanStep>,
        policy: &TenantPolicy,
    ) -> Result<ContextBundle, EngineError> {
        // 1. Conversation window: last K turns, plus pinned turns, plus the
        //    current step's form request/reply pair.
        let conversation = self.window(session, agent, step);

        // 2. Relevant memory: runtime working set plus the long-term vector
        //    tier, queried with the step title and triggering message.
        let query = match step {
            Some(s) => format!("{} {}", s.title, session.triggering_text()),
            None => session.triggering_text().to_string(),
        };
        let mut memory = Vec::new();
        if !query.trim().is_empty() {
            memory.extend(
                self.memory
                    .search(&MemoryScope::Runtime(session.key.clone()), &query, self.config.memory_items)
                    .await?,
            );
            memory.extend(
                self.memory
                    .search(
                        &MemoryScope::Vector(session.key.tenant_id.clone()),
                        &query,
                        self.config.memory_items,
                    )
                    .await?,
            );
        }
        memory.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item.key.cmp(&b.item.key))
        });
        memory.truncate(self.config.memory_items);

        // 3. Tools: tenant policy ∩ the agent's permitted set.
        let tools: Vec<ToolDescriptor> = self
            .registry
            .list_for_policy(policy)
            .into_iter()
            .filter(|d| agent.permits_tool(&d.name))
            .collect();

        // 4. Peer roster: names and one-line descriptions only.
        let roster = agents.roster_for(&agent.name);

        // 5. Tool results accumulated earlier in this step.
        let step_tool_results: Vec<Message> = match step {
            Some(s) => session
                .step_tool_results(s.index)
                .into_iter()
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        let mut bundle = ContextBundle {
            agent_name: agent.name.clone(),
            conversation,
            memory,
            tools,
            roster,
            step: step.cloned(),
            step_tool_results,
        };
        self.shrink_to_budget(&mut bundle, session);
        Ok(bundle)
    }

    fn window(&self, session: &Session, agent: &AgentSpec, step: Option<&PlanStep>) -> Vec<Message> {
        let turns = if agent.context_turns > 0 {
            agent.context_turns as usize
        } else {
            self.config.default_turns
        };

        let is_turn = |m: &Message| {
            matches!(
                m.kind,
                MessageKind::UserText { .. }
                    | MessageKind::UserAttachmentRef { .. }
                    | MessageKind::UserFormReply { .. }
                    | MessageKind::AgentMarkdown { .. }
                    | MessageKind::AgentFormRequest { .. }
            )
        };

        let mut keep: HashSet<MessageId> = HashSet::new();

        // Last K conversation turns.
        for msg in session.history.iter().rev().filter(|m| is_turn(m)).take(turns) {
            keep.insert(msg.id.clone());
        }
        // Pinned turns always survive.
        for msg in session.history.iter().filter(|m| m.pinned) {
            keep.insert(msg.id.clone());
        }
        // The triggering user message.
        if let Some(trigger) = session.triggering_message() {
            keep.insert(trigger.id.clone());
        }
        // The current step's form request/reply pair.
        if let Some(s) = step {
            for msg in session.current_form_pair(s.index) {
                keep.insert(msg.id.clone());
            }
        }

        session
            .history
            .iter()
            .filter(|m| keep.contains(&m.id))
            .cloned()
            .collect()
    }

    /// Enforce the token budget. Drop order: oldest non-pinned memory,
    /// then lowest-scored memory, then oldest non-triggering turns. Pinned
    /// turns and the current step's tool results are never dropped.
    fn shrink_to_budget(&self, bundle: &mut ContextBundle, session: &Session) {
        let budget = self.config.token_budget;
        if estimate_bundle_tokens(bundle) <= budget {
            return;
        }

        // Oldest non-pinned memory first.
        while estimate_bundle_tokens(bundle) > budget {
            let oldest = bundle
                .memory
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.item.pinned)
                .min_by(|(_, a), (_, b)| a.item.created_at.cmp(&b.item.created_at))
                .map(|(i, _)| i);
            match oldest {
                Some(i) => {
                    bundle.memory.remove(i);
                }
                None => break,
            }
        }

        // Then lowest-scored memory (pinned included).
        while estimate_bundle_tokens(bundle) > budget && !bundle.memory.is_empty() {
            let lowest = bundle
                .memory
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.score
                        .partial_cmp(&b.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i);
            match lowest {
                Some(i) => {
                    bundle.memory.remove(i);
                }
                None => break,
            }
        }

        // Finally, oldest non-triggering, non-pinned turns.
        let trigger_id = session.triggering_message().map(|m| m.id.clone());
        while estimate_bundle_tokens(bundle) > budget {
            let victim = bundle
                .conversation
                .iter()
                .position(|m| !m.pinned && Some(&m.id) != trigger_id.as_ref());
            match victim {
                Some(i) => {
                    bundle.conversation.remove(i);
                }
                None => break,
            }
        }
    }
}

/// Render the bundle as the model-facing prompt.
pub fn render_bundle(bundle: &ContextBundle) -> String {
    let mut out = String::new();

    if let Some(step) = &bundle.step {
        out.push_str(&format!(
            "# Current step\n{} (step {}, agent {})\nInputs: {}\n\n",
            step.title, step.index, step.agent_name, step.inputs
        ));
    }

    if !bundle.roster.is_empty() {
        out.push_str("# Peers you may delegate to\n");
        for (name, description) in &bundle.roster {
            out.push_str(&format!("- {name}: {description}\n"));
        }
        out.push('\n');
    }

    if !bundle.tools.is_empty() {
        out.push_str("# Tools\n");
        for tool in &bundle.tools {
            out.push_str(&format!(
                "- {} ({}): {}\n  schema: {}\n",
                tool.name, tool.version, tool.description, tool.input_schema
            ));
        }
        out.push('\n');
    }

    if !bundle.memory.is_empty() {
        out.push_str("# Relevant memory\n");
        for scored in &bundle.memory {
            out.push_str(&format!("- [{}] {}\n", scored.item.key, scored.item.content));
        }
        out.push('\n');
    }

    if !bundle.conversation.is_empty() {
        out.push_str("# Conversation\n");
        for msg in &bundle.conversation {
            out.push_str(&format!(
                "[{:?}] {}\n",
                msg.role,
                render_message(msg)
            ));
        }
        out.push('\n');
    }

    if !bundle.step_tool_results.is_empty() {
        out.push_str("# Tool results this step\n");
        for msg in &bundle.step_tool_results {
            out.push_str(&format!("{}\n", render_message(msg)));
        }
        out.push('\n');
    }

    out
}

fn render_message(msg: &Message) -> String {
    match &msg.kind {
        MessageKind::UserText { text }
        | MessageKind::AgentMarkdown { text }
        | MessageKind::SystemNote { text, .. } => text.clone(),
        MessageKind::UserFormReply { reply } => {
            format!("form reply {}: {}", reply.id, serde_json::Value::Object(reply.values.clone()))
        }
        MessageKind::UserAttachmentRef {
            attachment_kind,
            reference,
        } => format!("attachment [{attachment_kind}] {reference}"),
        MessageKind::AgentFormRequest { form } => format!("form request {}", form.id),
        MessageKind::ToolResult { tool, output, is_error, .. } => {
            format!("{tool} → {}{output}", if *is_error { "[error] " } else { "" })
        }
        other => format!("{other:?}"),
    }
}

/// Token estimation: chars / 4.
pub fn estimate_text_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

fn estimate_message_tokens(msg: &Message) -> u32 {
    4 + estimate_text_tokens(&render_message(msg))
}

fn estimate_bundle_tokens(bundle: &ContextBundle) -> u32 {
    let mut total = 0u32;
    for msg in &bundle.conversation {
        total += estimate_message_tokens(msg);
    }
    for scored in &bundle.memory {
        total += estimate_text_tokens(&scored.item.content) + estimate_text_tokens(&scored.item.key);
    }
    for tool in &bundle.tools {
        total += estimate_text_tokens(&tool.name)
            + estimate_text_tokens(&tool.description)
            + estimate_text_tokens(&tool.input_schema.to_string());
    }
    for msg in &bundle.step_tool_results {
        total += estimate_message_tokens(msg);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::embed::Embedder;
    use relay_core::errors::ModelError;
    use relay_core::ids::{InvocationId, SessionId, SessionKey, TenantId};
    use relay_core::plan::PlanStep;
    use relay_core::tools::{Tool, ToolContext, ToolError};
    use relay_store::{Database, MemoryConfig};
    use serde_json::{json, Value};

    struct NullEmbedder;

    #[async_trait]
    impl Embedder for NullEmbedder {
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ModelError> {
            Ok(vec![0.0; 4])
        }
    }

    struct NoopTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for NoopTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new(self.name, json!({"type": "object"}))
        }
        async fn invoke(&self, _inputs: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
            Ok(Value::Null)
        }
    }

    fn assembler(config: AssemblerConfig) -> ContextAssembler {
        let memory = Arc::new(MemoryStore::new(
            Database::in_memory().unwrap(),
            Arc::new(NullEmbedder),
            MemoryConfig::default(),
        ));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(NoopTool { name: "order_search" }));
        registry.register(Arc::new(NoopTool { name: "create_po" }));
        ContextAssembler::new(memory, Arc::new(registry), config)
    }

    fn session_with_history(n: usize) -> Session {
        let key = SessionKey::new(TenantId::from_raw("tenant_a"), SessionId::from_raw("sess_1"));
        let mut session = Session::new(key);
        for i in 0..n {
            let mut msg = Message::user_text(0, format!("user turn {i}"));
            msg.pinned = false;
            session.history.push(msg);
            session.history.push(Message::agent_markdown(0, format!("agent turn {i}")));
        }
        session.history.push(Message::user_text(0, "the trigger"));
        session
    }

    #[tokio::test]
    async fn window_is_bounded_and_keeps_trigger() {
        let assembler = assembler(AssemblerConfig::default());
        let session = session_with_history(20);
        let agents = AgentCatalog::default();
        let mut agent = agents.get("tool_executor").unwrap().clone();
        agent.context_turns = 4;

        let bundle = assembler
            .assemble(&session, &agents, &agent, None, &TenantPolicy::allow_all())
            .await
            .unwrap();

        assert!(bundle.conversation.len() <= 5, "got {}", bundle.conversation.len());
        assert!(bundle
            .conversation
            .iter()
            .any(|m| m.text() == Some("the trigger")));
    }

    #[tokio::test]
    async fn tools_are_policy_and_spec_filtered() {
        let assembler = assembler(AssemblerConfig::default());
        let session = session_with_history(1);
        let agents = AgentCatalog::default();
        let mut agent = agents.get("tool_executor").unwrap().clone();
        agent.permitted_tools = vec!["order_search".into()];

        let policy = TenantPolicy::allow_all();
        let bundle = assembler
            .assemble(&session, &agents, &agent, None, &policy)
            .await
            .unwrap();
        assert_eq!(bundle.tools.len(), 1);
        assert_eq!(bundle.tools[0].name, "order_search");

        let restricted = TenantPolicy {
            allowed_tools: vec!["create_po".into()],
            allowed_agents: vec!["*".into()],
        };
        let bundle = assembler
            .assemble(&session, &agents, &agent, None, &restricted)
            .await
            .unwrap();
        assert!(bundle.tools.is_empty(), "policy removed the permitted tool");
    }

    #[tokio::test]
    async fn roster_has_peers_not_self() {
        let assembler = assembler(AssemblerConfig::default());
        let session = session_with_history(1);
        let agents = AgentCatalog::default();
        let agent = agents.get("task_planner").unwrap();

        let bundle = assembler
            .assemble(&session, &agents, agent, None, &TenantPolicy::allow_all())
            .await
            .unwrap();
        assert!(bundle.roster.iter().all(|(name, _)| name != "task_planner"));
        assert_eq!(bundle.roster.len(), agents.agents.len() - 1);
    }

    #[tokio::test]
    async fn form_pair_for_current_step_is_included() {
        let assembler = assembler(AssemblerConfig::default());
        let mut session = session_with_history(1);
        let form = relay_core::forms::Form::new(vec![]);
        let reply = relay_core::forms::FormReply {
            id: form.id.clone(),
            values: serde_json::Map::new(),
        };
        // Push the pair far behind a small window.
        session.history.insert(0, Message::agent_form_request(2, form));
        session.history.insert(1, Message::user_form_reply(2, reply));

        let agents = AgentCatalog::default();
        let mut agent = agents.get("tool_executor").unwrap().clone();
        agent.context_turns = 1;

        let step = PlanStep::new(2, "Create PO", "tool_executor");
        let bundle = assembler
            .assemble(&session, &agents, &agent, Some(&step), &TenantPolicy::allow_all())
            .await
            .unwrap();

        let kinds: Vec<&str> = bundle.conversation.iter().map(|m| m.kind_str()).collect();
        assert!(kinds.contains(&"agent_form_request"));
        assert!(kinds.contains(&"user_form_reply"));
    }

    #[tokio::test]
    async fn budget_drops_memory_before_turns_and_never_the_trigger() {
        let config = AssemblerConfig {
            default_turns: 12,
            memory_items: 8,
            token_budget: 200,
        };
        let assembler = assembler(config);

        let mut session = session_with_history(3);
        // An oversized tool result in the current step, which must survive.
        session.history.push(Message::tool_result(
            1,
            InvocationId::from_raw("inv_1"),
            "order_search",
            json!("x".repeat(600)),
            false,
        ));

        // Seed runtime memory that matches the query.
        let scope = relay_store::MemoryScope::Runtime(session.key.clone());
        assembler
            .memory
            .put(&scope, "m1", "the trigger context fact one", false, None)
            .await
            .unwrap();
        assembler
            .memory
            .put(&scope, "m2", "the trigger context fact two", false, None)
            .await
            .unwrap();

        let agents = AgentCatalog::default();
        let agent = agents.get("tool_executor").unwrap();
        let step = PlanStep::new(1, "the trigger", "tool_executor");

        let bundle = assembler
            .assemble(&session, &agents, agent, Some(&step), &TenantPolicy::allow_all())
            .await
            .unwrap();

        // Memory went first.
        assert!(bundle.memory.is_empty());
        // The triggering turn survives.
        assert!(bundle
            .conversation
            .iter()
            .any(|m| m.text() == Some("the trigger")));
        // The step's tool results are untouchable.
        assert_eq!(bundle.step_tool_results.len(), 1);
    }

    #[tokio::test]
    async fn assembly_is_deterministic() {
        let assembler = assembler(AssemblerConfig::default());
        let session = session_with_history(5);
        let agents = AgentCatalog::default();
        let agent = agents.get("tool_executor").unwrap();

        let a = assembler
            .assemble(&session, &agents, agent, None, &TenantPolicy::allow_all())
            .await
            .unwrap();
        let b = assembler
            .assemble(&session, &agents, agent, None, &TenantPolicy::allow_all())
            .await
            .unwrap();

        let ids = |bundle: &ContextBundle| {
            bundle
                .conversation
                .iter()
                .map(|m| m.id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(render_bundle(&a), render_bundle(&b));
    }
}
