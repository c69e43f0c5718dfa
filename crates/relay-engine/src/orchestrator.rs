use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use relay_core::agent::{AgentAction, AgentSpec, ToolCallRequest};
use relay_core::catalog::{Catalogs, TenantPolicy, HUMAN_REVIEWER, INPUT_VALIDATOR, RESULT_SYNTHESIZER, TASK_PLANNER};
use relay_core::checkpoint::Checkpoint;
use relay_core::errors::ErrorKind;
use relay_core::forms::FormReply;
use relay_core::ids::{FormId, InvocationId, SessionKey};
use relay_core::messages::{Message, MessageKind};
use relay_core::plan::{Plan, PlanStep, StepStatus};
use relay_core::session::SessionState;
use relay_core::tools::{ToolContext, ToolError};
use relay_core::wire::{Component, ControlAction, UiInteraction, UserMessagePayload, WireEvent};
use relay_store::{Checkpointer, HistoryRepo, MemoryScope, MemoryStore};

use crate::assembler::ContextAssembler;
use crate::bus::EventBus;
use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::runner::AgentRunner;
use crate::session::Session;

#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    /// Bounded retries per failed step.
    pub max_step_retries: u32,
    /// Consult the human_reviewer agent for the retry/skip/abort decision.
    pub consult_reviewer: bool,
    /// When retries are exhausted and no reviewer decides: abort instead of skip.
    pub abort_on_exhausted: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 1,
            consult_reviewer: false,
            abort_on_exhausted: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Agent actions allowed within one step before it is failed.
    pub max_actions_per_step: u32,
    /// Delegations allowed within one step before it is failed.
    pub max_delegations_per_step: u32,
    /// How long a suspended session waits for its form reply before the
    /// failure path takes over. None disables the timeout.
    pub form_timeout: Option<std::time::Duration>,
    /// Idle sessions older than this are destroyed by `sweep_expired`.
    /// None disables expiry.
    pub session_ttl: Option<std::time::Duration>,
    pub recovery: RecoveryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_actions_per_step: 32,
            max_delegations_per_step: 4,
            form_timeout: None,
            session_ttl: None,
            recovery: RecoveryConfig::default(),
        }
    }
}

struct SessionHandle {
    session: tokio::sync::Mutex<Session>,
    cancel: parking_lot::Mutex<CancellationToken>,
    running: AtomicBool,
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        Self {
            session: tokio::sync::Mutex::new(session),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        }
    }
}

enum ToolOutcome {
    /// The agent sees the (possibly failed) result and keeps going.
    Continue,
    /// The step is failed with this reason.
    Fail(String),
}

/// Session-scoped state machine driving the plan-then-act loop across the
/// configured agents.
///
/// Transition discipline: every transition appends messages to history,
/// updates plan/state, saves a checkpoint, and only then publishes the
/// user-visible events derived from those messages.
pub struct Orchestrator {
    /// Self-handle for spawning drive tasks; set by `Arc::new_cyclic`.
    self_ref: Weak<Orchestrator>,
    sessions: DashMap<SessionKey, Arc<SessionHandle>>,
    checkpointer: Arc<dyn Checkpointer>,
    history: Arc<HistoryRepo>,
    memory: Arc<MemoryStore>,
    registry: Arc<ToolRegistry>,
    assembler: ContextAssembler,
    runner: AgentRunner,
    bus: Arc<EventBus>,
    catalogs: Catalogs,
    config: OrchestratorConfig,
    /// Per-session, per-step retry counters (bounded recovery).
    retries: DashMap<(SessionKey, u32), u32>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        checkpointer: Arc<dyn Checkpointer>,
        history: Arc<HistoryRepo>,
        memory: Arc<MemoryStore>,
        registry: Arc<ToolRegistry>,
        assembler: ContextAssembler,
        runner: AgentRunner,
        bus: Arc<EventBus>,
        catalogs: Catalogs,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            sessions: DashMap::new(),
            checkpointer,
            history,
            memory,
            registry,
            assembler,
            runner,
            bus,
            catalogs,
            config,
            retries: DashMap::new(),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Whether a run is currently in flight for the session.
    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.sessions
            .get(key)
            .map(|h| h.running.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Current state. Awaits the in-flight run's completion, so tests can
    /// use it as a join point.
    pub async fn session_state(&self, key: &SessionKey) -> Option<SessionState> {
        let handle = self.sessions.get(key).map(|h| Arc::clone(&h))?;
        let session = handle.session.lock().await;
        Some(session.state.clone())
    }

    /// Dispatch one inbound wire event for a session.
    #[instrument(skip(self, event), fields(session = %key))]
    pub async fn handle_event(
        &self,
        key: &SessionKey,
        event: WireEvent,
    ) -> Result<(), EngineError> {
        match event {
            WireEvent::UserMessage(payload) => self.handle_user_message(key, payload).await,
            WireEvent::Control(control) => match control.action {
                ControlAction::Cancel => self.cancel(key).await,
                ControlAction::Close => self.close_session(key).await,
            },
            WireEvent::Component(Component::UiInteraction(UiInteraction::FormReply { form })) => {
                self.handle_form_reply(key, form).await
            }
            WireEvent::Component(Component::UiInteraction(UiInteraction::Query { query })) => {
                self.handle_form_query(key, query).await
            }
            other => Err(EngineError::Validation(format!(
                "unexpected inbound event: {other:?}"
            ))),
        }
    }

    /// Load (or create) the session handle, restoring from the latest
    /// checkpoint when this replica has no in-memory copy.
    async fn handle_for(&self, key: &SessionKey) -> Result<Arc<SessionHandle>, EngineError> {
        if let Some(handle) = self.sessions.get(key) {
            return Ok(Arc::clone(&handle));
        }

        let session = match self
            .checkpointer
            .load_latest(&key.tenant_id, &key.session_id)?
        {
            Some(checkpoint) => {
                let history = self.history.list(&key.tenant_id, &key.session_id)?;
                self.seed_replay_state(&history);
                info!(session = %key, version = checkpoint.version, "session restored from checkpoint");
                Session::from_checkpoint(key.clone(), checkpoint, history)
            }
            None => Session::new(key.clone()),
        };

        let handle = Arc::new(SessionHandle::new(session));
        self.sessions.insert(key.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Seed the registry's replay dedupe map from persisted tool results so
    /// non-idempotent calls are not re-executed after a restart.
    fn seed_replay_state(&self, history: &[Message]) {
        for msg in history {
            if let MessageKind::ToolResult {
                invocation_id,
                output,
                is_error: false,
                ..
            } = &msg.kind
            {
                self.registry.record_completed(invocation_id.clone(), output.clone());
            }
        }
    }

    /// Re-attach a session after transport reconnect or process restart.
    /// Suspended sessions re-emit their outstanding form request; sessions
    /// interrupted mid-run are re-entered.
    pub async fn resume_session(&self, key: &SessionKey) -> Result<(), EngineError> {
        let handle = self.handle_for(key).await?;
        if handle.running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let state = {
            let session = handle.session.lock().await;
            session.state.clone()
        };

        match state {
            SessionState::AwaitingHuman { .. } => {
                let session = handle.session.lock().await;
                if let Some(form) = &session.pending_interrupt {
                    // Idempotent replay of the suspension point: the event is
                    // re-derived from checkpointed state, not re-appended.
                    self.bus.publish(key, WireEvent::form_request(form.clone()));
                }
                Ok(())
            }
            SessionState::Idle | SessionState::Terminal => Ok(()),
            _ => {
                info!(session = %key, state = state.state_tag(), "re-entering interrupted session");
                self.spawn_drive(&handle);
                Ok(())
            }
        }
    }

    async fn handle_user_message(
        &self,
        key: &SessionKey,
        payload: UserMessagePayload,
    ) -> Result<(), EngineError> {
        let handle = self.handle_for(key).await?;

        {
            // The drive task owns the session mutex while a run is in
            // flight; a contended lock IS the busy signal.
            let mut session = handle.session.try_lock().map_err(|_| {
                EngineError::SessionBusy("session already has an active run".into())
            })?;
            match session.state {
                SessionState::Idle | SessionState::Terminal => {}
                SessionState::AwaitingHuman { .. } => {
                    return Err(EngineError::SessionBusy(
                        "session is awaiting a form reply".into(),
                    ));
                }
                _ => {
                    return Err(EngineError::SessionBusy(
                        "session already has an active run".into(),
                    ));
                }
            }

            // A fresh request starts a fresh cycle.
            session.plan = Plan::default();
            session.step_index = 0;
            session.pending_interrupt = None;

            let mut messages = vec![Message::user_text(0, payload.text)];
            for attachment in payload.attachments {
                messages.push(Message::user_attachment(
                    0,
                    attachment.kind,
                    attachment.reference,
                ));
            }
            messages.push(Message::agent_progress(0, "Analyzing your request..."));
            self.commit(&mut session, messages, SessionState::Validating)?;
        }

        self.spawn_drive(&handle);
        Ok(())
    }

    async fn handle_form_reply(
        &self,
        key: &SessionKey,
        reply: FormReply,
    ) -> Result<(), EngineError> {
        let handle = self.handle_for(key).await?;

        {
            let mut session = handle.session.try_lock().map_err(|_| {
                EngineError::SessionBusy("session already has an active run".into())
            })?;
            let (step, form_id) = match &session.state {
                SessionState::AwaitingHuman { step, form_id } => (*step, form_id.clone()),
                _ => {
                    // Duplicate or stray replies are rejected without
                    // mutating state.
                    return Err(EngineError::Validation(format!(
                        "no outstanding form for reply {}",
                        reply.id
                    )));
                }
            };
            if form_id != reply.id {
                return Err(EngineError::Validation(format!(
                    "form reply {} does not match outstanding form {form_id}",
                    reply.id
                )));
            }
            if let Some(form) = &session.pending_interrupt {
                let missing = form.missing_required(&reply.values);
                if !missing.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "missing required fields: {}",
                        missing.join(", ")
                    )));
                }
            }

            session.pending_interrupt = None;
            let message = Message::user_form_reply(step, reply);
            self.commit(&mut session, vec![message], SessionState::Executing { step })?;
        }

        self.spawn_drive(&handle);
        Ok(())
    }

    async fn handle_form_query(
        &self,
        key: &SessionKey,
        query: relay_core::forms::FormQuery,
    ) -> Result<(), EngineError> {
        let handle = self.handle_for(key).await?;
        let session = handle.session.try_lock().map_err(|_| {
            EngineError::SessionBusy("session already has an active run".into())
        })?;

        let form = session
            .pending_interrupt
            .as_ref()
            .filter(|f| f.id == query.form_id)
            .ok_or_else(|| {
                EngineError::Validation(format!("no outstanding form {}", query.form_id))
            })?;
        let field = form.field(&query.field_key).ok_or_else(|| {
            EngineError::Validation(format!("unknown form field {}", query.field_key))
        })?;
        let source = field.data_source.as_ref().ok_or_else(|| {
            EngineError::Validation(format!("field {} has no data source", query.field_key))
        })?;

        let (results, has_more) = self
            .registry
            .lookup_options(&source.provider, &query.term, query.page, source.page_size)
            .await?;
        self.bus.publish(key, WireEvent::query_results(results, has_more));
        Ok(())
    }

    /// Cancel the active run (idempotent; a no-op in Idle).
    pub async fn cancel(&self, key: &SessionKey) -> Result<(), EngineError> {
        let Some(handle) = self.sessions.get(key).map(|h| Arc::clone(&h)) else {
            return Ok(());
        };

        handle.cancel.lock().cancel();

        // A suspended session has no drive task to unwind; discard the
        // pending form here.
        if !handle.running.load(Ordering::Relaxed) {
            let mut session = handle.session.lock().await;
            match session.state {
                SessionState::AwaitingHuman { .. } => {
                    session.pending_interrupt = None;
                    self.commit_cancelled(&mut session)?;
                }
                SessionState::Idle | SessionState::Terminal => {}
                _ => {
                    // Interrupted between checkpoints (e.g. restored but not
                    // yet re-entered): fold back to Idle.
                    self.commit_cancelled(&mut session)?;
                }
            }
        }
        Ok(())
    }

    /// Start the form-reply timer for a fresh suspension, when configured.
    fn arm_form_timeout(&self, key: &SessionKey, form_id: FormId) {
        let Some(timeout) = self.config.form_timeout else {
            return;
        };
        let Some(orchestrator) = self.self_ref.upgrade() else {
            return;
        };
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            orchestrator.expire_form(&key, &form_id).await;
        });
    }

    /// Time out an outstanding form: the suspension becomes a step failure
    /// and recovery decides what happens to the plan. A reply that already
    /// arrived wins the race (the state no longer matches).
    async fn expire_form(&self, key: &SessionKey, form_id: &FormId) {
        let Some(handle) = self.sessions.get(key).map(|h| Arc::clone(&h)) else {
            return;
        };
        if handle.running.load(Ordering::Relaxed) {
            return;
        }
        let Ok(mut session) = handle.session.try_lock() else {
            return;
        };

        let step = match &session.state {
            SessionState::AwaitingHuman { step, form_id: current } if current == form_id => *step,
            _ => return,
        };

        warn!(session = %key, form_id = %form_id, "form reply timed out");
        session.pending_interrupt = None;
        let _ = session.plan.set_status(step, StepStatus::Pending);
        let note = Message::system_error(step, "form reply timed out", ErrorKind::Timeout);
        let reason = "form reply timed out".to_string();
        if let Err(e) = self.commit(
            &mut session,
            vec![note],
            SessionState::Recovering { step, reason },
        ) {
            error!(session = %key, error = %e, "failed to record form timeout");
            return;
        }
        drop(session);
        self.spawn_drive(&handle);
    }

    /// Destroy sessions idle past the configured TTL. Intended to be called
    /// from a periodic sweeper task.
    pub async fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.config.session_ttl else {
            return 0;
        };

        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().running.load(Ordering::Relaxed) {
                continue;
            }
            if let Ok(session) = entry.value().session.try_lock() {
                if session.last_activity.elapsed() >= ttl {
                    expired.push(entry.key().clone());
                }
            }
        }

        let count = expired.len();
        for key in expired {
            info!(session = %key, "session expired, destroying");
            let _ = self.close_session(&key).await;
        }
        count
    }

    /// Explicitly destroy the in-memory session. Durable history and
    /// checkpoints are retained.
    pub async fn close_session(&self, key: &SessionKey) -> Result<(), EngineError> {
        if let Some((_, handle)) = self.sessions.remove(key) {
            handle.cancel.lock().cancel();
            // Wait for the drive task to release the session.
            let _ = handle.session.lock().await;
        }
        self.memory.clear_session(key);
        self.registry.forget_session(key.session_id.as_str());
        self.retries.retain(|(k, _), _| k != key);
        self.bus.close(key);
        Ok(())
    }

    fn spawn_drive(&self, handle: &Arc<SessionHandle>) {
        let cancel = CancellationToken::new();
        *handle.cancel.lock() = cancel.clone();
        handle.running.store(true, Ordering::Relaxed);

        let orchestrator = self
            .self_ref
            .upgrade()
            .expect("orchestrator alive while spawning");
        let handle = Arc::clone(handle);
        tokio::spawn(async move {
            let mut session = handle.session.lock().await;
            let result = orchestrator.drive(&mut session, &cancel).await;
            match result {
                Ok(()) => {}
                Err(EngineError::Cancelled) => {
                    if let Err(e) = orchestrator.commit_cancelled(&mut session) {
                        error!(session = %session.key, error = %e, "failed to record cancellation");
                    }
                }
                Err(e) => {
                    error!(session = %session.key, error = %e, "session run failed");
                    let messages = vec![
                        Message::agent_markdown(
                            session.step_index,
                            "Something went wrong while processing your request.",
                        ),
                        Message::system_error(session.step_index, e.to_string(), e.kind()),
                    ];
                    clear_running_step(&mut session);
                    if let Err(commit_err) =
                        orchestrator.commit(&mut session, messages, SessionState::Idle)
                    {
                        error!(session = %session.key, error = %commit_err, "failed to record run failure");
                    }
                }
            }
            handle.running.store(false, Ordering::Relaxed);
        });
    }

    /// The state-machine interpreter: runs until the session suspends,
    /// terminates, or fails.
    async fn drive(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match session.state.clone() {
                SessionState::Validating => self.run_validating(session, cancel).await?,
                SessionState::Planning => self.run_planning(session, cancel).await?,
                SessionState::Executing { step } => {
                    self.run_executing(session, step, cancel).await?
                }
                SessionState::Recovering { step, reason } => {
                    self.run_recovering(session, step, &reason, cancel).await?
                }
                SessionState::Synthesizing => self.run_synthesizing(session, cancel).await?,
                SessionState::AwaitingHuman { .. }
                | SessionState::Idle
                | SessionState::Terminal => return Ok(()),
            }
        }
    }

    // ── Phase: Validating ──

    async fn run_validating(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let spec = self.agent_spec(session, INPUT_VALIDATOR)?;
        match self.phase_turn(session, &spec, None, cancel).await {
            Ok(AgentAction::FinishStep { .. }) => {
                self.commit(session, vec![], SessionState::Planning)?;
                Ok(())
            }
            Ok(AgentAction::FailStep { reason }) => {
                let messages = vec![
                    Message::agent_markdown(0, reason.clone()),
                    Message::system_error(0, reason, ErrorKind::Validation),
                ];
                self.commit(session, messages, SessionState::Idle)?;
                Ok(())
            }
            Ok(other) => Err(EngineError::Internal(format!(
                "input validator produced unexpected action {}",
                other.action_str()
            ))),
            Err(e) => Err(e),
        }
    }

    // ── Phase: Planning ──

    async fn run_planning(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let spec = self.agent_spec(session, TASK_PLANNER)?;
        match self.phase_turn(session, &spec, None, cancel).await? {
            AgentAction::FinishStep { output } => {
                let mut plan = self.build_plan(session, &output)?;
                plan.set_status(0, StepStatus::Running)?;

                // Announcements are committed under the transition into the
                // first step; the payload carries the 1-based numbering.
                let total = plan.len() as u32;
                let mut messages = Vec::new();
                for step in &plan.steps {
                    messages.push(Message::agent_step(
                        0,
                        step.index + 1,
                        total,
                        step.title.clone(),
                    ));
                }

                session.plan = plan;
                session.step_index = 0;
                self.commit(session, messages, SessionState::Executing { step: 0 })?;
                Ok(())
            }
            AgentAction::FailStep { reason } => {
                let messages = vec![
                    Message::agent_markdown(0, format!("I could not plan that request: {reason}")),
                    Message::system_error(0, reason, ErrorKind::Model),
                ];
                self.commit(session, messages, SessionState::Idle)?;
                Ok(())
            }
            other => Err(EngineError::Internal(format!(
                "planner produced unexpected action {}",
                other.action_str()
            ))),
        }
    }

    /// Interpret the planner's output: either a named workflow from the
    /// catalog or an inline step list.
    fn build_plan(&self, session: &Session, output: &Value) -> Result<Plan, EngineError> {
        let policy = self.policy(session);

        let mut steps: Vec<PlanStep> = Vec::new();
        if let Some(workflow_name) = output.get("workflow").and_then(Value::as_str) {
            let template = self
                .catalogs
                .workflows
                .get(workflow_name)
                .ok_or_else(|| EngineError::Validation(format!("unknown workflow: {workflow_name}")))?;
            for (i, step) in template.steps.iter().enumerate() {
                steps.push(PlanStep::new(i as u32, step.title.clone(), step.agent.clone()));
            }
        } else if let Some(raw_steps) = output.get("steps").and_then(Value::as_array) {
            for (i, raw) in raw_steps.iter().enumerate() {
                let title = raw
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("Work")
                    .to_string();
                let agent = raw
                    .get("agent")
                    .and_then(Value::as_str)
                    .unwrap_or(relay_core::catalog::TOOL_EXECUTOR)
                    .to_string();
                let inputs = raw.get("inputs").cloned().unwrap_or(Value::Null);
                steps.push(PlanStep::new(i as u32, title, agent).with_inputs(inputs));
            }
        }

        if steps.is_empty() {
            steps.push(PlanStep::new(
                0,
                "Respond",
                relay_core::catalog::TOOL_EXECUTOR,
            ));
        }

        for step in &steps {
            if !self.catalogs.agents.contains(&step.agent_name) {
                return Err(EngineError::UnknownAgent(step.agent_name.clone()));
            }
            if !policy.allows_agent(&step.agent_name) {
                return Err(EngineError::Permission(format!(
                    "tenant may not use agent {}",
                    step.agent_name
                )));
            }
        }

        Ok(Plan::new(steps))
    }

    // ── Phase: Executing ──

    async fn run_executing(
        &self,
        session: &mut Session,
        step: u32,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        session.step_index = step;
        let current = session
            .plan
            .get(step)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("no plan step {step}")))?;

        if current.status != StepStatus::Running {
            session.plan.set_status(step, StepStatus::Running)?;
            self.commit(session, vec![], SessionState::Executing { step })?;
        }

        let step_cancel = cancel.child_token();
        let mut delegations = 0u32;

        for _ in 0..self.config.max_actions_per_step {
            if step_cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let plan_step = session
                .plan
                .get(step)
                .cloned()
                .ok_or_else(|| EngineError::Internal(format!("no plan step {step}")))?;
            let spec = self.agent_spec(session, &plan_step.agent_name)?;

            let action = match self
                .phase_turn(session, &spec, Some(&plan_step), &step_cancel)
                .await
            {
                Ok(action) => action,
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(EngineError::Model(e)) => {
                    // Model failures inside a step fail the step.
                    return self.fail_step(session, step, format!("model failure: {e}"), e.kind());
                }
                Err(e) => return Err(e),
            };

            match action {
                AgentAction::EmitMarkdown { text } => {
                    let message = Message::agent_markdown(step, text);
                    self.commit(session, vec![message], SessionState::Executing { step })?;
                }
                AgentAction::EmitProgress { status } => {
                    let message = Message::agent_progress(step, status);
                    self.commit(session, vec![message], SessionState::Executing { step })?;
                }
                AgentAction::WriteMemory { key, content } => {
                    self.memory
                        .put(
                            &MemoryScope::Runtime(session.key.clone()),
                            &key,
                            &content,
                            false,
                            None,
                        )
                        .await?;
                }
                AgentAction::CallTool { name, inputs } => {
                    if !spec.permits_tool(&name) {
                        return self.fail_step(
                            session,
                            step,
                            format!("agent {} may not call tool {name}", spec.name),
                            ErrorKind::Permission,
                        );
                    }
                    match self
                        .invoke_tool(session, step, &name, inputs, &step_cancel)
                        .await?
                    {
                        ToolOutcome::Continue => {}
                        ToolOutcome::Fail(reason) => {
                            return self.fail_step(session, step, reason, ErrorKind::ToolPermanent);
                        }
                    }
                }
                AgentAction::CallTools { calls } => {
                    if let Some(denied) = calls.iter().find(|c| !spec.permits_tool(&c.name)) {
                        return self.fail_step(
                            session,
                            step,
                            format!("agent {} may not call tool {}", spec.name, denied.name),
                            ErrorKind::Permission,
                        );
                    }
                    match self
                        .invoke_tool_batch(session, step, calls, &step_cancel)
                        .await?
                    {
                        ToolOutcome::Continue => {}
                        ToolOutcome::Fail(reason) => {
                            return self.fail_step(session, step, reason, ErrorKind::ToolPermanent);
                        }
                    }
                }
                AgentAction::RequestForm { form } => {
                    let form_id = form.id.clone();
                    session.pending_interrupt = Some(form.clone());
                    session.plan.set_status(step, StepStatus::AwaitingUser)?;
                    let message = Message::agent_form_request(step, form);
                    self.commit(
                        session,
                        vec![message],
                        SessionState::AwaitingHuman {
                            step,
                            form_id: form_id.clone(),
                        },
                    )?;
                    self.arm_form_timeout(&session.key, form_id);
                    return Ok(());
                }
                AgentAction::Delegate { agent_name, inputs } => {
                    delegations += 1;
                    if delegations > self.config.max_delegations_per_step {
                        return self.fail_step(
                            session,
                            step,
                            "delegation budget exhausted".into(),
                            ErrorKind::Internal,
                        );
                    }
                    if !self.catalogs.agents.contains(&agent_name) {
                        return self.fail_step(
                            session,
                            step,
                            format!("delegated to unknown agent {agent_name}"),
                            ErrorKind::Validation,
                        );
                    }
                    if !self.policy(session).allows_agent(&agent_name) {
                        return self.fail_step(
                            session,
                            step,
                            format!("tenant may not use agent {agent_name}"),
                            ErrorKind::Permission,
                        );
                    }
                    info!(session = %session.key, step, agent = %agent_name, "step delegated");
                    session.plan.rebind_agent(step, &agent_name)?;
                    if !inputs.is_null() {
                        if let Some(s) = session.plan.steps.get_mut(step as usize) {
                            s.inputs = inputs;
                        }
                    }
                    self.commit(session, vec![], SessionState::Executing { step })?;
                }
                AgentAction::FinishStep { output } => {
                    return self.finish_step(session, step, output).await;
                }
                AgentAction::FailStep { reason } => {
                    return self.fail_step(session, step, reason, ErrorKind::Internal);
                }
            }
        }

        self.fail_step(
            session,
            step,
            "action budget exhausted".into(),
            ErrorKind::Internal,
        )
    }

    async fn finish_step(
        &self,
        session: &mut Session,
        step: u32,
        output: Value,
    ) -> Result<(), EngineError> {
        let title = session
            .plan
            .get(step)
            .map(|s| s.title.clone())
            .unwrap_or_default();

        let note = Message::system_note(step, format!("step output: {output}"));
        let output_ref = note.id.clone();
        session.plan.set_status(step, StepStatus::Done)?;
        session.plan.set_output(step, output_ref)?;

        // Post-step distillation into the runtime working set.
        let digest: String = output.to_string().chars().take(240).collect();
        self.memory
            .put(
                &MemoryScope::Runtime(session.key.clone()),
                &format!("step_{step}"),
                &format!("{title}: {digest}"),
                false,
                None,
            )
            .await?;

        match session.plan.next_pending(step) {
            Some(next) => {
                self.commit(session, vec![note], SessionState::Executing { step: next })?;
            }
            None => {
                self.commit(session, vec![note], SessionState::Synthesizing)?;
            }
        }
        Ok(())
    }

    fn fail_step(
        &self,
        session: &mut Session,
        step: u32,
        reason: String,
        kind: ErrorKind,
    ) -> Result<(), EngineError> {
        warn!(session = %session.key, step, kind = kind.as_str(), reason = %reason, "step failed");
        // The step leaves Running while recovery deliberates.
        if session.plan.get(step).map(|s| s.status) == Some(StepStatus::Running) {
            session.plan.set_status(step, StepStatus::Pending)?;
        }
        let note = Message::system_error(step, reason.clone(), kind);
        self.commit(
            session,
            vec![note],
            SessionState::Recovering { step, reason },
        )?;
        Ok(())
    }

    // ── Phase: Recovering ──

    async fn run_recovering(
        &self,
        session: &mut Session,
        step: u32,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let retry_key = (session.key.clone(), step);
        let used_retries = self.retries.get(&retry_key).map(|r| *r).unwrap_or(0);

        let decision = if self.config.recovery.consult_reviewer
            && self.catalogs.agents.contains(HUMAN_REVIEWER)
        {
            self.reviewer_decision(session, step, reason, cancel).await?
        } else if used_retries < self.config.recovery.max_step_retries {
            "retry".to_string()
        } else if self.config.recovery.abort_on_exhausted {
            "abort".to_string()
        } else {
            "skip".to_string()
        };

        let title = session
            .plan
            .get(step)
            .map(|s| s.title.clone())
            .unwrap_or_default();

        match decision.as_str() {
            "retry" if used_retries < self.config.recovery.max_step_retries => {
                self.retries.insert(retry_key, used_retries + 1);
                let message = Message::agent_markdown(
                    step,
                    format!("Step \"{title}\" failed ({reason}); retrying."),
                );
                self.commit(session, vec![message], SessionState::Executing { step })?;
            }
            "abort" => {
                session.plan.set_status(step, StepStatus::Failed)?;
                skip_remaining(&mut session.plan, step);
                let message = Message::agent_markdown(
                    step,
                    format!("Step \"{title}\" failed ({reason}); stopping the plan."),
                );
                self.commit(session, vec![message], SessionState::Synthesizing)?;
            }
            _ => {
                session.plan.set_status(step, StepStatus::Skipped)?;
                let message = Message::agent_markdown(
                    step,
                    format!("Step \"{title}\" failed ({reason}); skipping it."),
                );
                let next_state = match session.plan.next_pending(step) {
                    Some(next) => SessionState::Executing { step: next },
                    None => SessionState::Synthesizing,
                };
                self.commit(session, vec![message], next_state)?;
            }
        }
        Ok(())
    }

    async fn reviewer_decision(
        &self,
        session: &mut Session,
        step: u32,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let spec = self.agent_spec(session, HUMAN_REVIEWER)?;
        let mut review_step = session
            .plan
            .get(step)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("no plan step {step}")))?;
        review_step.inputs = serde_json::json!({"failure": reason});

        match self.phase_turn(session, &spec, Some(&review_step), cancel).await {
            Ok(AgentAction::FinishStep { output }) => Ok(output
                .get("decision")
                .and_then(Value::as_str)
                .unwrap_or("skip")
                .to_string()),
            Ok(_) | Err(EngineError::Model(_)) => Ok("skip".to_string()),
            Err(e) => Err(e),
        }
    }

    // ── Phase: Synthesizing ──

    async fn run_synthesizing(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let step = session.step_index;
        let spec = self.agent_spec(session, RESULT_SYNTHESIZER)?;

        for _ in 0..self.config.max_actions_per_step {
            match self.phase_turn(session, &spec, None, cancel).await {
                Ok(AgentAction::EmitMarkdown { text }) => {
                    let message = Message::agent_markdown(step, text);
                    self.commit(session, vec![message], SessionState::Synthesizing)?;
                }
                Ok(AgentAction::EmitProgress { status }) => {
                    let message = Message::agent_progress(step, status);
                    self.commit(session, vec![message], SessionState::Synthesizing)?;
                }
                Ok(AgentAction::FinishStep { .. }) | Ok(AgentAction::FailStep { .. }) => {
                    let message = Message::workflow_finish(step);
                    self.commit(session, vec![message], SessionState::Terminal)?;
                    return Ok(());
                }
                Ok(other) => {
                    warn!(
                        session = %session.key,
                        action = other.action_str(),
                        "synthesizer produced unsupported action, finishing"
                    );
                    let message = Message::workflow_finish(step);
                    self.commit(session, vec![message], SessionState::Terminal)?;
                    return Ok(());
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(EngineError::Model(e)) => {
                    // The plan already ran; fall back to a plain completion
                    // rather than losing the session.
                    warn!(session = %session.key, error = %e, "synthesizer failed, finishing plainly");
                    let messages = vec![
                        Message::agent_markdown(step, "Done."),
                        Message::system_error(step, e.to_string(), e.kind()),
                        Message::workflow_finish(step),
                    ];
                    self.commit(session, messages, SessionState::Terminal)?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let message = Message::workflow_finish(step);
        self.commit(session, vec![message], SessionState::Terminal)?;
        Ok(())
    }

    // ── Tool dispatch ──

    async fn invoke_tool(
        &self,
        session: &mut Session,
        step: u32,
        name: &str,
        inputs: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome, EngineError> {
        let policy = self.policy(session);
        if !policy.allows_tool(name) {
            return Ok(ToolOutcome::Fail(format!("tenant may not use tool {name}")));
        }

        let seq = session.tool_calls_in_step(step);
        let (call, result, outcome) = self
            .dispatch_tool(session, step, seq, name, inputs, cancel)
            .await?;
        self.commit(session, vec![call, result], SessionState::Executing { step })?;
        Ok(outcome)
    }

    /// Explicit parallel batch: calls run concurrently, but calls and
    /// results are committed in issue order so replay is deterministic.
    async fn invoke_tool_batch(
        &self,
        session: &mut Session,
        step: u32,
        calls: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome, EngineError> {
        let policy = self.policy(session);
        for call in &calls {
            if !policy.allows_tool(&call.name) {
                return Ok(ToolOutcome::Fail(format!(
                    "tenant may not use tool {}",
                    call.name
                )));
            }
        }

        let base_seq = session.tool_calls_in_step(step);
        let mut futures = Vec::new();
        for (i, call) in calls.iter().enumerate() {
            let invocation_id = invocation_id_for(session, step, base_seq + i as u32);
            let ctx = ToolContext {
                tenant_id: session.key.tenant_id.clone(),
                session_id: session.key.session_id.clone(),
                invocation_id: invocation_id.clone(),
                cancel: cancel.child_token(),
            };
            let registry = Arc::clone(&self.registry);
            let name = call.name.clone();
            let inputs = call.inputs.clone();
            futures.push(async move {
                let result = registry.invoke(&name, inputs.clone(), &ctx).await;
                (invocation_id, name, inputs, result)
            });
        }

        let outcomes = join_all(futures).await;

        let mut messages = Vec::new();
        let mut failure: Option<String> = None;
        let mut cancelled = false;
        for (invocation_id, name, inputs, _) in &outcomes {
            messages.push(Message::tool_call(
                step,
                invocation_id.clone(),
                name.clone(),
                inputs.clone(),
            ));
        }
        for (invocation_id, name, _, result) in outcomes {
            match result {
                Ok(output) => {
                    messages.push(Message::tool_result(step, invocation_id, name, output, false));
                }
                Err(ToolError::Cancelled) => {
                    cancelled = true;
                    messages.push(Message::tool_result(
                        step,
                        invocation_id,
                        name,
                        serde_json::json!({"error": "cancelled"}),
                        true,
                    ));
                }
                Err(e) => {
                    if !matches!(e, ToolError::Validation(_)) {
                        failure.get_or_insert_with(|| format!("tool {name} failed: {e}"));
                    }
                    messages.push(Message::tool_result(
                        step,
                        invocation_id,
                        name,
                        serde_json::json!({"error": e.to_string(), "kind": e.kind().as_str()}),
                        true,
                    ));
                }
            }
        }

        self.commit(session, messages, SessionState::Executing { step })?;
        if cancelled {
            return Err(EngineError::Cancelled);
        }
        Ok(match failure {
            Some(reason) => ToolOutcome::Fail(reason),
            None => ToolOutcome::Continue,
        })
    }

    async fn dispatch_tool(
        &self,
        session: &Session,
        step: u32,
        seq: u32,
        name: &str,
        inputs: Value,
        cancel: &CancellationToken,
    ) -> Result<(Message, Message, ToolOutcome), EngineError> {
        let invocation_id = invocation_id_for(session, step, seq);
        let ctx = ToolContext {
            tenant_id: session.key.tenant_id.clone(),
            session_id: session.key.session_id.clone(),
            invocation_id: invocation_id.clone(),
            cancel: cancel.child_token(),
        };

        let call = Message::tool_call(step, invocation_id.clone(), name, inputs.clone());
        match self.registry.invoke(name, inputs, &ctx).await {
            Ok(output) => {
                let result = Message::tool_result(step, invocation_id, name, output, false);
                Ok((call, result, ToolOutcome::Continue))
            }
            Err(ToolError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => {
                let result = Message::tool_result(
                    step,
                    invocation_id,
                    name,
                    serde_json::json!({"error": e.to_string(), "kind": e.kind().as_str()}),
                    true,
                );
                let outcome = match e {
                    // The agent sees validation errors and can correct its
                    // inputs on the next turn.
                    ToolError::Validation(_) => ToolOutcome::Continue,
                    other => ToolOutcome::Fail(format!("tool {name} failed: {other}")),
                };
                Ok((call, result, outcome))
            }
        }
    }

    // ── Shared plumbing ──

    async fn phase_turn(
        &self,
        session: &Session,
        spec: &AgentSpec,
        step: Option<&PlanStep>,
        cancel: &CancellationToken,
    ) -> Result<AgentAction, EngineError> {
        let policy = self.policy(session);
        let bundle = self
            .assembler
            .assemble(session, &self.catalogs.agents, spec, step, policy)
            .await?;
        self.runner.run_turn(spec, &bundle, cancel).await
    }

    fn agent_spec(&self, session: &Session, name: &str) -> Result<AgentSpec, EngineError> {
        let spec = self
            .catalogs
            .agents
            .get(name)
            .ok_or_else(|| EngineError::UnknownAgent(name.to_string()))?;
        if !self.policy(session).allows_agent(name) {
            return Err(EngineError::Permission(format!(
                "tenant may not use agent {name}"
            )));
        }
        Ok(spec.clone())
    }

    fn policy(&self, session: &Session) -> &TenantPolicy {
        self.catalogs
            .permissions
            .policy_for(session.key.tenant_id.as_str())
    }

    fn commit_cancelled(&self, session: &mut Session) -> Result<(), EngineError> {
        clear_running_step(session);
        session.pending_interrupt = None;
        let messages = vec![
            Message::agent_markdown(session.step_index, "Cancelled."),
            Message::system_error(session.step_index, "cancelled", ErrorKind::Cancelled),
        ];
        self.commit(session, messages, SessionState::Idle)
    }

    /// The transition discipline: (a) append to history, (b) update state,
    /// (c) checkpoint, (d) only then publish derived events.
    fn commit(
        &self,
        session: &mut Session,
        messages: Vec<Message>,
        new_state: SessionState,
    ) -> Result<(), EngineError> {
        for message in &messages {
            let sequence =
                self.history
                    .append(&session.key.tenant_id, &session.key.session_id, message)?;
            session.history_hwm = sequence;
            session.history.push(message.clone());
        }

        session.state = new_state;
        session.version += 1;
        session.last_activity = std::time::Instant::now();

        let checkpoint = Checkpoint::new(
            session.key.tenant_id.clone(),
            session.key.session_id.clone(),
            session.version,
            session.state.clone(),
            session.plan.clone(),
            session.history_hwm,
            session.pending_interrupt.clone(),
        );
        self.checkpointer.save(&checkpoint)?;

        for message in &messages {
            if let Some(event) = WireEvent::from_message(message) {
                self.bus.publish(&session.key, event);
            }
        }
        Ok(())
    }
}

fn invocation_id_for(session: &Session, step: u32, seq: u32) -> InvocationId {
    InvocationId::from_raw(format!("inv_{}_{}_{}", session.key.session_id, step, seq))
}

fn clear_running_step(session: &mut Session) {
    let running: Vec<u32> = session
        .plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Running || s.status == StepStatus::AwaitingUser)
        .map(|s| s.index)
        .collect();
    for index in running {
        let _ = session.plan.set_status(index, StepStatus::Pending);
    }
}

fn skip_remaining(plan: &mut Plan, after: u32) {
    let pending: Vec<u32> = plan
        .steps
        .iter()
        .filter(|s| s.index != after && !s.status.is_terminal())
        .map(|s| s.index)
        .collect();
    for index in pending {
        let _ = plan.set_status(index, StepStatus::Skipped);
    }
}
