//! Versioned schema migrations for the relay store.
//!
//! Each entry in [`MIGRATIONS`] moves the database up exactly one version;
//! the `schema_version` table records what has been applied, so running the
//! migrator is idempotent and an older database upgrades stepwise on open.

/// A single migration: one version bump, one SQL batch.
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "checkpoints and session history",
        sql: V1_CHECKPOINTS_AND_HISTORY,
    },
    Migration {
        version: 2,
        description: "long-term memory items with embeddings",
        sql: V2_MEMORY_ITEMS,
    },
];

/// The version a fully migrated database reports.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

const V1_CHECKPOINTS_AND_HISTORY: &str = r#"
CREATE TABLE checkpoints (
    tenant_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    state_tag TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (tenant_id, session_id, version)
);

CREATE TABLE history (
    tenant_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    step_index INTEGER NOT NULL,
    kind TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (tenant_id, session_id, message_id)
);

CREATE INDEX idx_checkpoints_state ON checkpoints(tenant_id, session_id, state_tag);
CREATE INDEX idx_history_seq ON history(tenant_id, session_id, sequence);
"#;

const V2_MEMORY_ITEMS: &str = r#"
CREATE TABLE memory_items (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    key TEXT NOT NULL,
    content TEXT NOT NULL,
    pinned INTEGER NOT NULL DEFAULT 0,
    embedding BLOB,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_memory_tenant ON memory_items(tenant_id);
CREATE UNIQUE INDEX idx_memory_tenant_key ON memory_items(tenant_id, key);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
