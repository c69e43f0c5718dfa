use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use relay_core::catalog::TenantPolicy;
use relay_core::forms::FieldOption;
use relay_core::ids::InvocationId;
use relay_core::tools::{RetryPolicy, Tool, ToolContext, ToolDescriptor, ToolError};

const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Answers async select lookups for form fields (`dataSource.provider`).
#[async_trait]
pub trait OptionProvider: Send + Sync {
    async fn query(
        &self,
        term: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<FieldOption>, bool), ToolError>;
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    descriptor: ToolDescriptor,
}

/// Declarative tool catalog with validated dispatch.
///
/// Invocation handles input-schema validation, per-descriptor timeouts,
/// jittered retry of transient failures, per `(session, tool)`
/// serialization of non-idempotent calls, replay dedupe by invocation id,
/// and cooperative cancellation with a grace window.
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
    providers: HashMap<String, Arc<dyn OptionProvider>>,
    serial_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    active: DashMap<InvocationId, CancellationToken>,
    completed: Mutex<HashMap<InvocationId, Value>>,
    abandoned: Mutex<HashSet<InvocationId>>,
    cancel_grace: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            providers: HashMap::new(),
            serial_locks: Mutex::new(HashMap::new()),
            active: DashMap::new(),
            completed: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(HashSet::new()),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Register a tool under its own descriptor.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let descriptor = tool.descriptor();
        self.tools
            .insert(descriptor.name.clone(), ToolEntry { tool, descriptor });
    }

    /// Register a tool with a descriptor override from the catalog.
    pub fn register_with_descriptor(&mut self, tool: Arc<dyn Tool>, descriptor: ToolDescriptor) {
        self.tools
            .insert(descriptor.name.clone(), ToolEntry { tool, descriptor });
    }

    pub fn register_provider(&mut self, name: impl Into<String>, provider: Arc<dyn OptionProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn describe(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|e| &e.descriptor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Descriptors a tenant policy permits, sorted by name.
    pub fn list_for_policy(&self, policy: &TenantPolicy) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .values()
            .filter(|e| policy.allows_tool(&e.descriptor.name))
            .map(|e| e.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Answer an async select lookup.
    pub async fn lookup_options(
        &self,
        provider: &str,
        term: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<FieldOption>, bool), ToolError> {
        let provider = self
            .providers
            .get(provider)
            .ok_or_else(|| ToolError::Validation(format!("unknown option provider: {provider}")))?;
        provider.query(term, page, page_size).await
    }

    /// Dispatch a tool call. Transient failures are retried per the
    /// descriptor policy; exhausted retries surface as permanent.
    #[instrument(skip(self, inputs, ctx), fields(tool = name, invocation_id = %ctx.invocation_id))]
    pub async fn invoke(
        &self,
        name: &str,
        inputs: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        // Replay suppression: a re-executed transition reuses its
        // deterministic invocation id and gets the recorded result.
        if let Some(cached) = self.completed.lock().get(&ctx.invocation_id).cloned() {
            return Ok(cached);
        }

        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Validation(format!("unknown tool: {name}")))?;
        let descriptor = &entry.descriptor;

        validate_inputs(&descriptor.input_schema, &inputs)?;

        // Side-effectful calls are serialized per (session, tool) so a
        // replayed duplicate cannot interleave with the original.
        let _serial_guard = if !descriptor.idempotent {
            let key = format!("{}/{}", ctx.session_id, name);
            let lock = self
                .serial_locks
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            Some(lock.lock_owned().await)
        } else {
            None
        };

        self.active
            .insert(ctx.invocation_id.clone(), ctx.cancel.clone());
        let result = self.invoke_with_retries(entry, descriptor, &inputs, ctx).await;
        self.active.remove(&ctx.invocation_id);

        if let Ok(output) = &result {
            self.completed
                .lock()
                .insert(ctx.invocation_id.clone(), output.clone());
        }
        result
    }

    async fn invoke_with_retries(
        &self,
        entry: &ToolEntry,
        descriptor: &ToolDescriptor,
        inputs: &Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let policy = &descriptor.retry_policy;
        let mut attempt = 0u32;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }

            match self.attempt_once(entry, descriptor, inputs, ctx).await {
                Err(ToolError::Transient(reason)) if attempt + 1 < policy.max_attempts => {
                    attempt += 1;
                    let delay = retry_delay(policy, attempt - 1);
                    warn!(
                        tool = %descriptor.name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "transient tool failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
                    }
                }
                Err(ToolError::Transient(reason)) => {
                    return Err(ToolError::Permanent(format!(
                        "transient retries exhausted after {} attempts: {reason}",
                        policy.max_attempts
                    )));
                }
                other => return other,
            }
        }
    }

    /// One execution attempt with timeout and cooperative cancellation.
    /// On cancel, the tool keeps the grace window to acknowledge; after
    /// that the invocation is abandoned and marked so replay can detect it.
    async fn attempt_once(
        &self,
        entry: &ToolEntry,
        descriptor: &ToolDescriptor,
        inputs: &Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let fut = tokio::time::timeout(descriptor.timeout(), entry.tool.invoke(inputs.clone(), ctx));
        tokio::pin!(fut);

        tokio::select! {
            result = &mut fut => {
                return match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ToolError::Timeout(descriptor.timeout())),
                };
            }
            _ = ctx.cancel.cancelled() => {}
        }

        // Cancelled: await acknowledgement up to the grace deadline.
        match tokio::time::timeout(self.cancel_grace, &mut fut).await {
            Ok(Ok(inner)) => inner,
            Ok(Err(_)) => Err(ToolError::Timeout(descriptor.timeout())),
            Err(_) => {
                warn!(
                    tool = %descriptor.name,
                    invocation_id = %ctx.invocation_id,
                    grace_ms = self.cancel_grace.as_millis() as u64,
                    "tool did not acknowledge cancel, abandoning"
                );
                self.abandoned.lock().insert(ctx.invocation_id.clone());
                Err(ToolError::Cancelled)
            }
        }
    }

    /// Record a completed invocation, e.g. when rebuilding replay state
    /// from persisted history after a restart.
    pub fn record_completed(&self, invocation_id: InvocationId, output: Value) {
        self.completed.lock().insert(invocation_id, output);
    }

    /// Cooperatively cancel a running invocation.
    pub fn cancel(&self, invocation_id: &InvocationId) -> bool {
        if let Some(token) = self.active.get(invocation_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Whether an invocation was abandoned mid-cancel (replay must treat it
    /// as possibly-executed).
    pub fn was_abandoned(&self, invocation_id: &InvocationId) -> bool {
        self.abandoned.lock().contains(invocation_id)
    }

    /// Drop per-session replay state on session destruction.
    pub fn forget_session(&self, session_id: &str) {
        let marker = format!("_{session_id}_");
        self.completed
            .lock()
            .retain(|id, _| !id.as_str().contains(&marker));
        self.abandoned
            .lock()
            .retain(|id| !id.as_str().contains(&marker));
        self.serial_locks
            .lock()
            .retain(|key, _| !key.starts_with(&format!("{session_id}/")));
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate inputs against the descriptor's schema: a pragmatic subset of
/// JSON Schema (object type, required keys, property types, enums).
pub fn validate_inputs(schema: &Value, inputs: &Value) -> Result<(), ToolError> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if schema_obj.get("type").and_then(Value::as_str) == Some("object") && !inputs.is_object() {
        return Err(ToolError::Validation("inputs must be an object".into()));
    }

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match inputs.get(key) {
                None | Some(Value::Null) => {
                    return Err(ToolError::Validation(format!(
                        "missing required input: {key}"
                    )));
                }
                _ => {}
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        for (key, prop) in properties {
            let Some(value) = inputs.get(key) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if let Some(expected) = prop.get("type").and_then(Value::as_str) {
                if !type_matches(expected, value) {
                    return Err(ToolError::Validation(format!(
                        "invalid type for input {key}: expected {expected}"
                    )));
                }
            }
            if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
                if !allowed.contains(value) {
                    return Err(ToolError::Validation(format!(
                        "invalid value for input {key}: not in enum"
                    )));
                }
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// Exponential backoff with symmetric jitter, capped by the policy.
fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exp.min(policy.max_delay_ms) as f64;
    let jitter_range = capped * policy.jitter_factor;
    let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
    Duration::from_millis((capped + jitter).max(1.0) as u64)
}

fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
                | 1
        );
    }

    STATE.with(|s| {
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}
