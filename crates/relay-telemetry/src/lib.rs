use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by the RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "relay_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

/// Initialize the tracing subscriber. Call once at startup; calling again
/// is a no-op rather than a panic, so tests can initialize freely.
pub fn init_telemetry(config: TelemetryConfig) {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(true);
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_telemetry(TelemetryConfig::default());
        init_telemetry(TelemetryConfig {
            json: false,
            ..Default::default()
        });
    }

    #[test]
    fn module_levels_extend_the_filter() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("relay_engine".into(), Level::DEBUG)],
            json: true,
        };
        init_telemetry(config);
    }
}
