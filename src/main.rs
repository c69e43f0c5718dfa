use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use relay_core::catalog::Catalogs;
use relay_engine::{
    AgentRunner, AssemblerConfig, ContextAssembler, EventBus, Orchestrator, OrchestratorConfig,
    RunnerConfig, ToolRegistry,
};
use relay_llm::{HashingEmbedder, ModelRouter, ReliableBackend, UnconfiguredBackend};
use relay_store::{Checkpointer, Database, HistoryRepo, MemoryConfig, MemoryStore, SqliteCheckpointer};
use relay_telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "relay", about = "Session-scoped multi-agent orchestration server")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9092)]
    port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to the SQLite database file. Defaults to ~/.relay/relay.db.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Directory holding agents.json / workflows.json / permissions.json.
    /// Missing files fall back to built-in defaults.
    #[arg(long)]
    catalog_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    relay_telemetry::init_telemetry(TelemetryConfig {
        log_level,
        ..Default::default()
    });

    tracing::info!(port = args.port, "starting relay server");

    let db_path = args.db_path.unwrap_or_else(|| {
        let dir = dirs_home().join(".relay");
        std::fs::create_dir_all(&dir).expect("failed to create data directory");
        dir.join("relay.db")
    });
    let db = Database::open(&db_path).expect("failed to open database");

    // Declarative catalogs: immutable for the process lifetime.
    let catalogs = match &args.catalog_dir {
        Some(dir) => Catalogs::load_dir(dir).expect("failed to load catalogs"),
        None => Catalogs::default(),
    };
    tracing::info!(
        agents = catalogs.agents.agents.len(),
        workflows = catalogs.workflows.workflows.len(),
        "catalogs loaded"
    );

    let checkpointer: Arc<dyn Checkpointer> = Arc::new(SqliteCheckpointer::new(db.clone()));
    let history = Arc::new(HistoryRepo::new(db.clone()));
    let memory = Arc::new(MemoryStore::new(
        db,
        Arc::new(HashingEmbedder::default()),
        MemoryConfig::default(),
    ));

    // Tools are registered by the embedding application; the server itself
    // ships none.
    let registry = Arc::new(ToolRegistry::new());

    // No real model backend is wired here; prompts fail with a clear model
    // error until one is registered.
    tracing::warn!("no model backend configured; agent prompts will fail until one is registered");
    let router = Arc::new(ModelRouter::single(Arc::new(ReliableBackend::with_defaults(
        UnconfiguredBackend,
    ))));

    let assembler = ContextAssembler::new(
        Arc::clone(&memory),
        Arc::clone(&registry),
        AssemblerConfig::default(),
    );
    let runner = AgentRunner::new(router, RunnerConfig::default());
    let bus = Arc::new(EventBus::new());

    let orchestrator = Orchestrator::new(
        checkpointer,
        history,
        memory,
        registry,
        assembler,
        runner,
        bus,
        catalogs,
        OrchestratorConfig::default(),
    );

    let handle = relay_server::start(
        relay_server::ServerConfig { port: args.port },
        Arc::clone(&orchestrator),
    )
    .await
    .expect("failed to start server");

    tracing::info!(port = handle.port, "relay server ready");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    // Stop accepting new connections, then wait briefly for in-flight work.
    handle.shutdown();
    if tokio::time::timeout(std::time::Duration::from_secs(10), handle.drain())
        .await
        .is_err()
    {
        tracing::warn!("server drain timed out after 10s");
    }

    tracing::info!("shutdown complete");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    }
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let args = Args::parse_from(["relay"]);
        assert_eq!(args.port, 9092);
        assert_eq!(args.log_level, "info");
        assert!(args.db_path.is_none());
        assert!(args.catalog_dir.is_none());
    }

    #[test]
    fn cli_parses_flags() {
        let args = Args::parse_from([
            "relay",
            "--port",
            "8080",
            "--db-path",
            "/tmp/relay.db",
            "--catalog-dir",
            "/etc/relay",
        ]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.db_path, Some(PathBuf::from("/tmp/relay.db")));
        assert_eq!(args.catalog_dir, Some(PathBuf::from("/etc/relay")));
    }
}
