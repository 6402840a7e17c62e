use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A link between one tag and one tagged object. Valid only while its tag is
/// live; orphaned links are removed by the tenant-removal sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub id: Uuid,
    pub tag_id: Uuid,
    pub object_kind: String,
    pub object_id: String,
    pub added_at: DateTime<Utc>,
}

impl Association {
    pub fn new(tag_id: Uuid, object_kind: String, object_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            tag_id,
            object_kind,
            object_id,
            added_at: Utc::now(),
        }
    }
}

/// Lookup key for fetching the associations of a batch of same-kind objects
/// in one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationKey {
    pub object_kind: String,
    pub object_ids: Vec<String>,
}

impl AssociationKey {
    /// Build a bulk-lookup key from a batch of object ids. An empty batch
    /// yields no associations.
    pub fn for_instances<S: Into<String>>(object_kind: S, object_ids: Vec<String>) -> Self {
        Self {
            object_kind: object_kind.into(),
            object_ids,
        }
    }
}
