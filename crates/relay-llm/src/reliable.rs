use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_core::errors::ModelError;

use crate::backend::{CompletionRequest, ModelBackend};

/// Retry and circuit breaker parameters.
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps a ModelBackend with retry logic and a circuit breaker.
///
/// - Retries retryable errors with exponential backoff + jitter
/// - Respects `retry_after` hints from rate limit responses
/// - N consecutive failures → open → cooldown → half-open → success → closed
pub struct ReliableBackend<B: ModelBackend> {
    inner: B,
    config: ReliableConfig,
    circuit_state: Arc<RwLock<CircuitState>>,
    consecutive_failures: Arc<AtomicU32>,
    total_retries: Arc<AtomicU64>,
}

impl<B: ModelBackend> ReliableBackend<B> {
    pub fn new(inner: B, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: Arc::new(RwLock::new(CircuitState::Closed)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            total_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults(inner: B) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    fn check_circuit(&self) -> Result<(), ModelError> {
        let state = self.circuit_state.read();
        match &*state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    drop(state);
                    *self.circuit_state.write() = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(ModelError::Overloaded)
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!("circuit breaker closed after successful request");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.config.circuit_breaker_threshold {
            let mut state = self.circuit_state.write();
            if *state == CircuitState::Closed || *state == CircuitState::HalfOpen {
                warn!(
                    failures = failures,
                    cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                    "circuit breaker opened"
                );
                *state = CircuitState::Open {
                    since: Instant::now(),
                };
            }
        }
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
        let final_ms = (capped + jitter).max(50.0);

        Duration::from_millis(final_ms as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match &*self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[async_trait]
impl<B: ModelBackend> ModelBackend for ReliableBackend<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError> {
        self.check_circuit()?;

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }

            match self.inner.complete(request, cancel).await {
                Ok(text) => {
                    self.record_success();
                    return Ok(text);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    self.record_failure();
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    warn!(
                        attempt = attempt + 1,
                        max = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        kind = e.error_kind(),
                        "model call failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.record_failure();
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Simple non-cryptographic random u64 using thread-local xorshift state.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedBackend, ScriptedResponse};

    fn fast_config() -> ReliableConfig {
        ReliableConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_millis(50),
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("sys", "prompt")
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let inner = ScriptedBackend::new(vec![
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::Error(ModelError::Network("reset".into())),
            ScriptedResponse::raw("ok"),
        ]);
        let backend = ReliableBackend::new(inner, fast_config());
        let cancel = CancellationToken::new();

        let result = backend.complete(&request(), &cancel).await.unwrap();
        assert_eq!(result, "ok");
        assert_eq!(backend.total_retries(), 2);
        assert_eq!(backend.circuit_state_name(), "closed");
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let inner = ScriptedBackend::new(vec![
            ScriptedResponse::Error(ModelError::InvalidRequest("bad".into())),
            ScriptedResponse::raw("never reached"),
        ]);
        let backend = ReliableBackend::new(inner, fast_config());
        let cancel = CancellationToken::new();

        let err = backend.complete(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, ModelError::InvalidRequest(_)));
        assert_eq!(backend.total_retries(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let inner = ScriptedBackend::new(vec![
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::Error(ModelError::Overloaded),
        ]);
        let mut config = fast_config();
        config.max_retries = 3;
        config.circuit_breaker_threshold = 100;
        let backend = ReliableBackend::new(inner, config);
        let cancel = CancellationToken::new();

        let err = backend.complete(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, ModelError::Overloaded));
        assert_eq!(backend.total_retries(), 3);
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failures() {
        let inner = ScriptedBackend::new(vec![
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::Error(ModelError::Overloaded),
        ]);
        let mut config = fast_config();
        config.max_retries = 3;
        let backend = ReliableBackend::new(inner, config);
        let cancel = CancellationToken::new();

        let _ = backend.complete(&request(), &cancel).await;
        assert_eq!(backend.circuit_state_name(), "open");

        // Next call short-circuits without touching the inner backend
        let err = backend.complete(&request(), &cancel).await.unwrap_err();
        assert!(matches!(err, ModelError::Overloaded));
    }

    #[tokio::test]
    async fn circuit_recovers_after_cooldown() {
        let inner = ScriptedBackend::new(vec![
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::Error(ModelError::Overloaded),
            ScriptedResponse::raw("recovered"),
        ]);
        let mut config = fast_config();
        config.max_retries = 3;
        let backend = ReliableBackend::new(inner, config);
        let cancel = CancellationToken::new();

        let _ = backend.complete(&request(), &cancel).await;
        assert_eq!(backend.circuit_state_name(), "open");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let result = backend.complete(&request(), &cancel).await.unwrap();
        assert_eq!(result, "recovered");
        assert_eq!(backend.circuit_state_name(), "closed");
    }

    #[tokio::test]
    async fn rate_limit_hint_overrides_backoff() {
        let backend = ReliableBackend::new(
            ScriptedBackend::new(vec![]),
            fast_config(),
        );
        let delay = backend.retry_delay(0, Some(Duration::from_millis(123)));
        assert_eq!(delay, Duration::from_millis(123));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backend = ReliableBackend::new(ScriptedBackend::new(vec![]), fast_config());
        let d0 = backend.retry_delay(0, None);
        let d2 = backend.retry_delay(2, None);
        assert!(d2 >= d0);
        assert!(d2 <= Duration::from_millis(50));
    }
}
