use std::collections::HashMap;

use parking_lot::Mutex;

use relay_core::checkpoint::Checkpoint;
use relay_core::ids::{SessionId, TenantId};

use crate::database::Database;
use crate::error::StoreError;

/// Durable checkpoint storage keyed by (tenant, session, version).
///
/// `save` must be atomic and durable before the orchestrator reports a
/// transition complete; the per-session version sequence is strictly
/// monotonic and doubles as the write lock.
pub trait Checkpointer: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<u64, StoreError>;

    fn load_latest(
        &self,
        tenant: &TenantId,
        session: &SessionId,
    ) -> Result<Option<Checkpoint>, StoreError>;

    fn load_at(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        version: u64,
    ) -> Result<Option<Checkpoint>, StoreError>;

    fn list_versions(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        limit: u32,
    ) -> Result<Vec<u64>, StoreError>;

    fn prune(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        keep_last: u32,
    ) -> Result<u64, StoreError>;
}

/// SQLite-backed checkpointer. The primary key on
/// (tenant_id, session_id, version) makes each save atomic: a stale writer
/// racing on the same version fails the insert instead of clobbering.
pub struct SqliteCheckpointer {
    db: Database,
}

impl SqliteCheckpointer {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl Checkpointer for SqliteCheckpointer {
    fn save(&self, checkpoint: &Checkpoint) -> Result<u64, StoreError> {
        let payload = serde_json::to_string(checkpoint)?;
        // Hold the session's append lock across read-then-insert so the
        // version check and the write are one step.
        let lock = self
            .db
            .session_lock(&checkpoint.tenant_id, &checkpoint.session_id);
        let _guard = lock.lock();
        self.db.with_conn(|conn| {
            let latest: Option<u64> = conn
                .query_row(
                    "SELECT MAX(version) FROM checkpoints WHERE tenant_id = ?1 AND session_id = ?2",
                    [checkpoint.tenant_id.as_str(), checkpoint.session_id.as_str()],
                    |row| row.get(0),
                )
                .unwrap_or(None);

            let expected = latest.map_or(1, |v| v + 1);
            if checkpoint.version != expected {
                return Err(StoreError::Conflict(format!(
                    "checkpoint version {} for {}/{}, expected {}",
                    checkpoint.version, checkpoint.tenant_id, checkpoint.session_id, expected
                )));
            }

            conn.execute(
                "INSERT INTO checkpoints (tenant_id, session_id, version, state_tag, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    checkpoint.tenant_id.as_str(),
                    checkpoint.session_id.as_str(),
                    checkpoint.version,
                    checkpoint.state_tag(),
                    payload,
                    checkpoint.created_at,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!(
                        "concurrent write at version {}",
                        checkpoint.version
                    ))
                }
                other => StoreError::from(other),
            })?;

            Ok(checkpoint.version)
        })
    }

    fn load_latest(
        &self,
        tenant: &TenantId,
        session: &SessionId,
    ) -> Result<Option<Checkpoint>, StoreError> {
        self.db.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM checkpoints
                     WHERE tenant_id = ?1 AND session_id = ?2
                     ORDER BY version DESC LIMIT 1",
                    [tenant.as_str(), session.as_str()],
                    |row| row.get(0),
                )
                .ok();
            match payload {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
    }

    fn load_at(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        version: u64,
    ) -> Result<Option<Checkpoint>, StoreError> {
        self.db.with_conn(|conn| {
            // Latest version ≤ the requested one.
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM checkpoints
                     WHERE tenant_id = ?1 AND session_id = ?2 AND version <= ?3
                     ORDER BY version DESC LIMIT 1",
                    rusqlite::params![tenant.as_str(), session.as_str(), version],
                    |row| row.get(0),
                )
                .ok();
            match payload {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
    }

    fn list_versions(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        limit: u32,
    ) -> Result<Vec<u64>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version FROM checkpoints
                 WHERE tenant_id = ?1 AND session_id = ?2
                 ORDER BY version DESC LIMIT ?3",
            )?;
            let versions = stmt
                .query_map(
                    rusqlite::params![tenant.as_str(), session.as_str(), limit],
                    |row| row.get(0),
                )?
                .collect::<Result<Vec<u64>, _>>()?;
            Ok(versions)
        })
    }

    fn prune(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        keep_last: u32,
    ) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM checkpoints
                 WHERE tenant_id = ?1 AND session_id = ?2 AND version NOT IN (
                     SELECT version FROM checkpoints
                     WHERE tenant_id = ?1 AND session_id = ?2
                     ORDER BY version DESC LIMIT ?3
                 )",
                rusqlite::params![tenant.as_str(), session.as_str(), keep_last],
            )?;
            Ok(removed as u64)
        })
    }
}

/// In-memory checkpointer for tests.
#[derive(Default)]
pub struct MemoryCheckpointer {
    store: Mutex<HashMap<(String, String), Vec<Checkpoint>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn save(&self, checkpoint: &Checkpoint) -> Result<u64, StoreError> {
        let mut store = self.store.lock();
        let key = (
            checkpoint.tenant_id.as_str().to_string(),
            checkpoint.session_id.as_str().to_string(),
        );
        let versions = store.entry(key).or_default();
        let expected = versions.last().map_or(1, |c| c.version + 1);
        if checkpoint.version != expected {
            return Err(StoreError::Conflict(format!(
                "checkpoint version {}, expected {expected}",
                checkpoint.version
            )));
        }
        versions.push(checkpoint.clone());
        Ok(checkpoint.version)
    }

    fn load_latest(
        &self,
        tenant: &TenantId,
        session: &SessionId,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let store = self.store.lock();
        Ok(store
            .get(&(tenant.as_str().to_string(), session.as_str().to_string()))
            .and_then(|v| v.last().cloned()))
    }

    fn load_at(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        version: u64,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let store = self.store.lock();
        Ok(store
            .get(&(tenant.as_str().to_string(), session.as_str().to_string()))
            .and_then(|v| v.iter().rev().find(|c| c.version <= version).cloned()))
    }

    fn list_versions(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        limit: u32,
    ) -> Result<Vec<u64>, StoreError> {
        let store = self.store.lock();
        Ok(store
            .get(&(tenant.as_str().to_string(), session.as_str().to_string()))
            .map(|v| v.iter().rev().take(limit as usize).map(|c| c.version).collect())
            .unwrap_or_default())
    }

    fn prune(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        keep_last: u32,
    ) -> Result<u64, StoreError> {
        let mut store = self.store.lock();
        if let Some(versions) =
            store.get_mut(&(tenant.as_str().to_string(), session.as_str().to_string()))
        {
            let keep = keep_last as usize;
            if versions.len() > keep {
                let removed = versions.len() - keep;
                versions.drain(..removed);
                return Ok(removed as u64);
            }
        }
        Ok(0)
    }
}
