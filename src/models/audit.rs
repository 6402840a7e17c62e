use std::collections::BTreeSet;
use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tag::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Renamed,
    Split,
    Deleted,
    TenantsAdded,
    TenantsRemoved,
}

/// Record of one tag mutation, handed to the injected audit hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub tag_id: Uuid,
    pub action: AuditAction,
    pub actor: String,
    pub comment: String,
    pub tenants: BTreeSet<TenantId>,
}

/// Revision/audit sink. Fire-and-forget: a failing hook is logged by the
/// registry and never rolls back the primary transaction.
pub trait AuditHook: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Default hook that drops every event.
#[derive(Debug, Default)]
pub struct NullAudit;

impl AuditHook for NullAudit {
    fn record(&self, _event: &AuditEvent) -> Result<()> {
        Ok(())
    }
}

/// In-memory hook for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit lock poisoned").clone()
    }
}

impl AuditHook for MemoryAudit {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .expect("audit lock poisoned")
            .push(event.clone());
        Ok(())
    }
}
