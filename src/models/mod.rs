mod association;
mod audit;
mod dispatch;
mod tag;

pub use association::{Association, AssociationKey};
pub use audit::{AuditAction, AuditEvent, AuditHook, MemoryAudit, NullAudit};
pub use dispatch::{KindRegistry, ObjectHandler};
pub use tag::{derive_namespace, slugify, Tag, TenantId};
