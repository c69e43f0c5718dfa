use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::ErrorKind;
use crate::ids::{InvocationId, SessionId, TenantId};

/// Declared side-effect class of a tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffects {
    None,
    Read,
    Write,
    External,
}

/// Retry parameters for transient failures, bounded per descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Declarative tool metadata, registered once at startup and immutable
/// thereafter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    #[serde(default = "default_side_effects")]
    pub side_effects: SideEffects,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

fn default_version() -> String {
    "1".into()
}
fn default_idempotent() -> bool {
    true
}
fn default_side_effects() -> SideEffects {
    SideEffects::Read
}
fn default_timeout_ms() -> u64 {
    30_000
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            input_schema,
            output_schema: Value::Null,
            idempotent: true,
            side_effects: SideEffects::Read,
            timeout_ms: default_timeout_ms(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn side_effectful(mut self, side_effects: SideEffects) -> Self {
        self.idempotent = false;
        self.side_effects = side_effects;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Context available to a tool during execution.
pub struct ToolContext {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub invocation_id: InvocationId,
    pub cancel: CancellationToken,
}

/// Classified tool failure. The registry never retries `Validation`,
/// `Permission`, or `Permanent`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid inputs: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transient(_) => ErrorKind::ToolTransient,
            Self::Permanent(_) => ErrorKind::ToolPermanent,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Trait implemented by each tool. Descriptors are data; execution is the
/// only code seam.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn invoke(&self, inputs: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_defaults() {
        let desc = ToolDescriptor::new("order_search", json!({"type": "object"}));
        assert!(desc.idempotent);
        assert_eq!(desc.side_effects, SideEffects::Read);
        assert_eq!(desc.timeout(), Duration::from_secs(30));
        assert_eq!(desc.retry_policy.max_attempts, 3);
    }

    #[test]
    fn side_effectful_clears_idempotent() {
        let desc = ToolDescriptor::new("create_po", json!({"type": "object"}))
            .side_effectful(SideEffects::External);
        assert!(!desc.idempotent);
        assert_eq!(desc.side_effects, SideEffects::External);
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let desc: ToolDescriptor = serde_json::from_value(json!({
            "name": "order_search",
            "input_schema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(desc.version, "1");
        assert_eq!(desc.timeout_ms, 30_000);
    }

    #[test]
    fn error_classification() {
        assert!(ToolError::Transient("io".into()).is_retryable());
        assert!(!ToolError::Permanent("gone".into()).is_retryable());
        assert!(!ToolError::Validation("bad".into()).is_retryable());
        assert_eq!(ToolError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            ToolError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            ToolError::Transient("io".into()).kind(),
            ErrorKind::ToolTransient
        );
    }

    #[test]
    fn retry_policy_camel_case() {
        let json = serde_json::to_value(RetryPolicy::default()).unwrap();
        assert_eq!(json["maxAttempts"], 3);
        assert_eq!(json["baseDelayMs"], 250);
    }
}
