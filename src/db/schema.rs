pub const SCHEMA_VERSION: i32 = 1;

pub const SCHEMA_V1: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY,
    version INTEGER NOT NULL
);

-- Canonical tag set. The slug is the single point of serialization for
-- identifier allocation: concurrent writers race on this constraint.
CREATE TABLE IF NOT EXISTS tags (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    namespace TEXT NOT NULL DEFAULT '',
    slug TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

-- Per-tag tenant visibility. A live tag always has at least one row here.
CREATE TABLE IF NOT EXISTS tag_tenants (
    id TEXT PRIMARY KEY,
    tag_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE,
    UNIQUE(tag_id, tenant_id)
);

-- Tag-to-object links. object_kind is resolved through the dispatch table
-- registered at startup, never interpreted here.
CREATE TABLE IF NOT EXISTS associations (
    id TEXT PRIMARY KEY,
    tag_id TEXT NOT NULL,
    object_kind TEXT NOT NULL,
    object_id TEXT NOT NULL,
    added_at TEXT NOT NULL,
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE,
    UNIQUE(tag_id, object_kind, object_id)
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_tag_name ON tags(name);
CREATE INDEX IF NOT EXISTS idx_tag_namespace ON tags(namespace);
CREATE INDEX IF NOT EXISTS idx_tag_tenant_tag ON tag_tenants(tag_id);
CREATE INDEX IF NOT EXISTS idx_tag_tenant_tenant ON tag_tenants(tenant_id);
CREATE INDEX IF NOT EXISTS idx_assoc_tag ON associations(tag_id);
CREATE INDEX IF NOT EXISTS idx_assoc_object ON associations(object_kind, object_id);
"#;
