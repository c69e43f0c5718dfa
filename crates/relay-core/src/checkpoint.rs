use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::forms::Form;
use crate::ids::{SessionId, TenantId};
use crate::plan::Plan;
use crate::session::SessionState;

/// Durable, versioned snapshot of session state taken after each
/// transition. The checkpointer is the synchronization boundary: anything
/// not yet checkpointed is re-executed on recovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub version: u64,
    pub state: SessionState,
    pub plan: Plan,
    /// Sequence number of the last history entry covered by this snapshot.
    pub history_hwm: u64,
    pub pending_interrupt: Option<Form>,
    pub created_at: String,
}

impl Checkpoint {
    pub fn new(
        tenant_id: TenantId,
        session_id: SessionId,
        version: u64,
        state: SessionState,
        plan: Plan,
        history_hwm: u64,
        pending_interrupt: Option<Form>,
    ) -> Self {
        Self {
            tenant_id,
            session_id,
            version,
            state,
            plan,
            history_hwm,
            pending_interrupt,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn state_tag(&self) -> &'static str {
        self.state.state_tag()
    }
}
