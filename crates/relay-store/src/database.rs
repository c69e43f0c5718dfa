use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info};

use relay_core::ids::{SessionId, TenantId};

use crate::error::StoreError;
use crate::schema::{self, Migration};

/// The relay store's persistence entry point.
///
/// Owns the SQLite connection (serialized behind a mutex, since rusqlite
/// connections cannot be shared across threads), runs pending schema
/// migrations on open, and hands out the per-session append locks that the
/// history and checkpoint writers take before assigning sequence numbers
/// and versions.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    session_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    path: PathBuf,
}

impl Database {
    /// Open a database file, creating it (and pending schema versions) as
    /// needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Database(format!("open {}: {e}", path.display())))?;

        let db = Self::bootstrap(conn, path.to_owned())?;
        info!(
            path = %path.display(),
            version = schema::latest_version(),
            "database ready"
        );
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Database(format!("open in-memory: {e}")))?;
        Self::bootstrap(conn, PathBuf::from(":memory:"))
    }

    fn bootstrap(mut conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("set pragmas: {e}")))?;
        run_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            session_locks: Arc::new(Mutex::new(HashMap::new())),
            path,
        })
    }

    /// Run a closure against the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// The append lock for one session. Writers that assign per-session
    /// sequence numbers or checkpoint versions hold this across their
    /// read-then-insert so the numbering stays gap-free under concurrency.
    pub fn session_lock(&self, tenant: &TenantId, session: &SessionId) -> Arc<Mutex<()>> {
        let key = format!("{tenant}/{session}");
        self.session_locks
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Highest applied schema version.
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Database(format!("read schema_version: {e}")))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            session_locks: Arc::clone(&self.session_locks),
            path: self.path.clone(),
        }
    }
}

/// Apply every migration newer than the recorded version, each in its own
/// transaction so a failure leaves no partial schema.
fn run_migrations(conn: &mut Connection) -> Result<u32, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
             version INTEGER PRIMARY KEY,
             applied_at TEXT NOT NULL
         )",
    )
    .map_err(|e| StoreError::Database(format!("create schema_version: {e}")))?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Database(format!("read schema_version: {e}")))?;

    let mut applied = 0;
    for migration in schema::MIGRATIONS {
        if migration.version <= current {
            debug!(version = migration.version, "migration already applied");
            continue;
        }
        apply_migration(conn, migration)?;
        applied += 1;
    }

    if applied > 0 {
        info!(applied, version = schema::latest_version(), "schema migrated");
    }
    Ok(applied)
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<(), StoreError> {
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::Database(format!("migration v{}: {e}", migration.version)))?;
    tx.execute_batch(migration.sql).map_err(|e| {
        StoreError::Database(format!(
            "migration v{} ({}): {e}",
            migration.version, migration.description
        ))
    })?;
    tx.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![migration.version, Utc::now().to_rfc3339()],
    )
    .map_err(|e| StoreError::Database(format!("record migration v{}: {e}", migration.version)))?;
    tx.commit()
        .map_err(|e| StoreError::Database(format!("migration v{}: {e}", migration.version)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("relay-store-test-{}", uuid::Uuid::now_v7()));
        (dir.clone(), dir.join("relay.db"))
    }

    fn table_names(db: &Database) -> Vec<String> {
        db.with_conn(|conn| {
            conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .map_err(StoreError::from)?
                .query_map([], |row| row.get(0))
                .map_err(StoreError::from)?
                .collect::<Result<_, _>>()
                .map_err(StoreError::from)
        })
        .unwrap()
    }

    #[test]
    fn fresh_database_is_fully_migrated() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), schema::latest_version());

        let tables = table_names(&db);
        for table in ["checkpoints", "history", "memory_items", "schema_version"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn older_database_upgrades_stepwise_on_open() {
        let (dir, path) = temp_db_path();
        std::fs::create_dir_all(&dir).unwrap();

        // Simulate a deployment that only ever ran the first migration.
        {
            let mut conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)",
            )
            .unwrap();
            apply_migration(&mut conn, &schema::MIGRATIONS[0]).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), schema::latest_version());
        assert!(table_names(&db).contains(&"memory_items".to_string()));

        drop(db);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reopening_applies_nothing() {
        let (dir, path) = temp_db_path();
        let db = Database::open(&path).unwrap();
        let version = db.schema_version().unwrap();
        drop(db);

        let db = Database::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), version);

        drop(db);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn wal_mode_enabled_for_file_databases() {
        let (dir, path) = temp_db_path();
        let db = Database::open(&path).unwrap();

        let mode: String = db
            .with_conn(|conn| {
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(mode, "wal");

        drop(db);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn session_locks_are_shared_per_session() {
        let db = Database::in_memory().unwrap();
        let tenant = TenantId::from_raw("tenant_a");
        let sess_1 = SessionId::from_raw("sess_1");
        let sess_2 = SessionId::from_raw("sess_2");

        let a = db.session_lock(&tenant, &sess_1);
        let b = db.session_lock(&tenant, &sess_1);
        let c = db.session_lock(&tenant, &sess_2);
        assert!(Arc::ptr_eq(&a, &b), "same session shares one lock");
        assert!(!Arc::ptr_eq(&a, &c), "sessions do not share locks");

        // Clones of the database hand out the same locks.
        let d = db.clone().session_lock(&tenant, &sess_1);
        assert!(Arc::ptr_eq(&a, &d));
    }
}
