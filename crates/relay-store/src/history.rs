use relay_core::ids::{SessionId, TenantId};
use relay_core::messages::Message;

use crate::database::Database;
use crate::error::StoreError;

/// Append-only message history, the single source of truth per session.
pub struct HistoryRepo {
    db: Database,
}

impl HistoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message and return its assigned sequence number. The
    /// database's per-session append lock keeps the numbering gap-free.
    pub fn append(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        message: &Message,
    ) -> Result<u64, StoreError> {
        let lock = self.db.session_lock(tenant, session);
        let _guard = lock.lock();

        let payload = serde_json::to_string(message)?;
        self.db.with_conn(|conn| {
            let max_seq: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(sequence), 0) FROM history
                     WHERE tenant_id = ?1 AND session_id = ?2",
                    [tenant.as_str(), session.as_str()],
                    |row| row.get(0),
                )
                .unwrap_or(0);
            let sequence = (max_seq + 1) as u64;

            conn.execute(
                "INSERT INTO history (tenant_id, session_id, message_id, sequence, step_index, kind, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    tenant.as_str(),
                    session.as_str(),
                    message.id.as_str(),
                    sequence,
                    message.step_index,
                    message.kind_str(),
                    message.timestamp,
                    payload,
                ],
            )?;

            Ok(sequence)
        })
    }

    /// All messages for a session in sequence order.
    pub fn list(&self, tenant: &TenantId, session: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.list_after(tenant, session, 0)
    }

    /// Messages with sequence > `after`, in order.
    pub fn list_after(
        &self,
        tenant: &TenantId,
        session: &SessionId,
        after: u64,
    ) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM history
                 WHERE tenant_id = ?1 AND session_id = ?2 AND sequence > ?3
                 ORDER BY sequence ASC",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![tenant.as_str(), session.as_str(), after],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<Result<Vec<String>, _>>()?;

            rows.iter()
                .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
                .collect()
        })
    }

    /// Current high-water mark (last assigned sequence, 0 when empty).
    pub fn high_water_mark(
        &self,
        tenant: &TenantId,
        session: &SessionId,
    ) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let max: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(sequence), 0) FROM history
                     WHERE tenant_id = ?1 AND session_id = ?2",
                    [tenant.as_str(), session.as_str()],
                    |row| row.get(0),
                )
                .unwrap_or(0);
            Ok(max as u64)
        })
    }

    /// Delete a session's history (session destruction).
    pub fn purge(&self, tenant: &TenantId, session: &SessionId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM history WHERE tenant_id = ?1 AND session_id = ?2",
                [tenant.as_str(), session.as_str()],
            )?;
            Ok(removed as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::messages::MessageKind;

    fn repo() -> (HistoryRepo, TenantId, SessionId) {
        (
            HistoryRepo::new(Database::in_memory().unwrap()),
            TenantId::from_raw("tenant_a"),
            SessionId::from_raw("sess_1"),
        )
    }

    #[test]
    fn sequences_are_dense_and_ordered() {
        let (repo, tenant, session) = repo();
        for i in 0..5 {
            let seq = repo
                .append(&tenant, &session, &Message::user_text(0, format!("m{i}")))
                .unwrap();
            assert_eq!(seq, i + 1);
        }
        assert_eq!(repo.high_water_mark(&tenant, &session).unwrap(), 5);

        let messages = repo.list(&tenant, &session).unwrap();
        assert_eq!(messages.len(), 5);
        match &messages[0].kind {
            MessageKind::UserText { text } => assert_eq!(text, "m0"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn list_after_skips_covered_prefix() {
        let (repo, tenant, session) = repo();
        repo.append(&tenant, &session, &Message::user_text(0, "a")).unwrap();
        repo.append(&tenant, &session, &Message::agent_markdown(0, "b")).unwrap();
        repo.append(&tenant, &session, &Message::workflow_finish(0)).unwrap();

        let tail = repo.list_after(&tenant, &session, 2).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].kind_str(), "agent_workflow_finish");
    }

    #[test]
    fn sessions_do_not_interleave() {
        let (repo, tenant, session) = repo();
        let other = SessionId::from_raw("sess_2");

        repo.append(&tenant, &session, &Message::user_text(0, "one")).unwrap();
        let seq = repo.append(&tenant, &other, &Message::user_text(0, "two")).unwrap();
        assert_eq!(seq, 1, "each session has its own sequence");

        assert_eq!(repo.list(&tenant, &session).unwrap().len(), 1);
        assert_eq!(repo.list(&tenant, &other).unwrap().len(), 1);
    }

    #[test]
    fn purge_removes_only_target_session() {
        let (repo, tenant, session) = repo();
        let other = SessionId::from_raw("sess_2");
        repo.append(&tenant, &session, &Message::user_text(0, "x")).unwrap();
        repo.append(&tenant, &other, &Message::user_text(0, "y")).unwrap();

        assert_eq!(repo.purge(&tenant, &session).unwrap(), 1);
        assert!(repo.list(&tenant, &session).unwrap().is_empty());
        assert_eq!(repo.list(&tenant, &other).unwrap().len(), 1);
    }

    #[test]
    fn message_payload_roundtrips_fully() {
        let (repo, tenant, session) = repo();
        let original = Message::tool_call(
            2,
            relay_core::ids::InvocationId::from_raw("inv_1"),
            "order_search",
            serde_json::json!({"q": "acme"}),
        );
        repo.append(&tenant, &session, &original).unwrap();

        let loaded = &repo.list(&tenant, &session).unwrap()[0];
        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.step_index, 2);
        assert_eq!(loaded.kind_str(), "tool_call");
    }
}
