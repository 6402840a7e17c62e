use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Row};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::Database;
use crate::models::*;

/// Helper to convert UUID parse errors to rusqlite errors
fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Whether an error is a UNIQUE-constraint failure. The slug allocation
/// retry loop treats exactly these as "try the next suffix".
pub(crate) fn is_unique_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Database {
    // ==================== TAG CREATE ====================

    /// Insert a tag row plus its tenant rows. The UNIQUE constraint on slug
    /// is the caller's collision signal; an empty tenant set is rejected
    /// before anything touches storage.
    pub fn insert_tag(&self, tag: &Tag) -> Result<()> {
        if tag.tenants.is_empty() {
            return Err(crate::error::TagError::InvariantViolation(format!(
                "refusing to persist tag {} with an empty tenant set",
                tag.id
            ))
            .into());
        }

        self.conn().execute(
            "INSERT INTO tags (id, name, namespace, slug, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                tag.id.to_string(),
                tag.name,
                tag.namespace,
                tag.slug,
                tag.created_at.to_rfc3339(),
            ],
        )?;

        for tenant in &tag.tenants {
            self.insert_tag_tenant(tag.id, tenant)?;
        }
        Ok(())
    }

    // ==================== TAG READ ====================

    pub fn get_tag(&self, id: Uuid) -> Result<Option<Tag>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, name, namespace, slug, created_at FROM tags WHERE id = ?")?;

        let result = stmt.query_row([id.to_string()], Self::row_to_tag);

        match result {
            Ok(tag) => Ok(Some(self.fill_tenants(tag)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Exact (name, slug) identity lookup across all tenants. This is what
    /// makes tags logical singletons: a second tenant asking for the same
    /// pair converges onto the existing row.
    pub fn find_tag(&self, name: &str, slug: &str) -> Result<Option<Tag>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, name, namespace, slug, created_at FROM tags
             WHERE name = ? AND slug = ? LIMIT 1",
        )?;

        let result = stmt.query_row(params![name, slug], Self::row_to_tag);

        match result {
            Ok(tag) => Ok(Some(self.fill_tenants(tag)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_tag_by_slug(&self, slug: &str) -> Result<Option<Tag>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, name, namespace, slug, created_at FROM tags WHERE slug = ?")?;

        let result = stmt.query_row([slug], Self::row_to_tag);

        match result {
            Ok(tag) => Ok(Some(self.fill_tenants(tag)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List tags filtered by any of name / slug / namespace, ordered by
    /// (namespace, name).
    pub fn list_tags(
        &self,
        name: Option<&str>,
        slug: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Vec<Tag>> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();

        if let Some(name) = name.as_ref() {
            conditions.push("name = ?");
            args.push(name);
        }
        if let Some(slug) = slug.as_ref() {
            conditions.push("slug = ?");
            args.push(slug);
        }
        if let Some(namespace) = namespace.as_ref() {
            conditions.push("namespace = ?");
            args.push(namespace);
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT id, name, namespace, slug, created_at FROM tags {} ORDER BY namespace, name",
            where_clause
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let tags = stmt
            .query_map(rusqlite::params_from_iter(args), Self::row_to_tag)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        tags.into_iter().map(|t| self.fill_tenants(t)).collect()
    }

    // ==================== TAG UPDATE ====================

    /// In-place rename: name, namespace, and slug change on the same tag
    /// identity. The slug UNIQUE constraint applies here just as on insert.
    pub fn update_tag_name(&self, id: Uuid, name: &str, namespace: &str, slug: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE tags SET name = ?, namespace = ?, slug = ? WHERE id = ?",
            params![name, namespace, slug, id.to_string()],
        )?;
        Ok(rows > 0)
    }

    // ==================== TAG DELETE ====================

    /// Hard delete a tag; tenant rows and associations go via CASCADE.
    pub fn delete_tag(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM tags WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    // ==================== TENANT SET ====================

    pub fn tenants_for_tag(&self, tag_id: Uuid) -> Result<BTreeSet<TenantId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT tenant_id FROM tag_tenants WHERE tag_id = ?")?;

        let tenants = stmt
            .query_map([tag_id.to_string()], |row| {
                Ok(TenantId(row.get::<_, String>(0)?))
            })?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;

        Ok(tenants)
    }

    /// Add a tenant to a tag's set. Idempotent.
    pub fn insert_tag_tenant(&self, tag_id: Uuid, tenant: &TenantId) -> Result<bool> {
        let rows = self.conn().execute(
            "INSERT OR IGNORE INTO tag_tenants (id, tag_id, tenant_id) VALUES (?, ?, ?)",
            params![Uuid::new_v4().to_string(), tag_id.to_string(), tenant.0],
        )?;
        Ok(rows > 0)
    }

    /// Remove a tenant from a tag's set. A tenant already absent is a no-op.
    pub fn delete_tag_tenant(&self, tag_id: Uuid, tenant: &TenantId) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM tag_tenants WHERE tag_id = ? AND tenant_id = ?",
            params![tag_id.to_string(), tenant.0],
        )?;
        Ok(rows > 0)
    }

    // ==================== ASSOCIATION CRUD ====================

    /// Link a tag to an object. Re-tagging the same object is a no-op.
    pub fn insert_association(&self, assoc: &Association) -> Result<bool> {
        let rows = self.conn().execute(
            "INSERT OR IGNORE INTO associations (id, tag_id, object_kind, object_id, added_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                assoc.id.to_string(),
                assoc.tag_id.to_string(),
                assoc.object_kind,
                assoc.object_id,
                assoc.added_at.to_rfc3339(),
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn associations_for_tag(&self, tag_id: Uuid) -> Result<Vec<Association>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, tag_id, object_kind, object_id, added_at
             FROM associations WHERE tag_id = ? ORDER BY added_at",
        )?;

        let assocs = stmt
            .query_map([tag_id.to_string()], Self::row_to_association)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(assocs)
    }

    pub fn delete_association(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM associations WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    pub fn delete_association_for_object(
        &self,
        tag_id: Uuid,
        object_kind: &str,
        object_id: &str,
    ) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM associations WHERE tag_id = ? AND object_kind = ? AND object_id = ?",
            params![tag_id.to_string(), object_kind, object_id],
        )?;
        Ok(rows > 0)
    }

    pub fn count_associations_for_tag(&self, tag_id: Uuid) -> Result<u32> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM associations WHERE tag_id = ?",
            [tag_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Fetch the associations of a whole batch of same-kind objects in one
    /// query.
    pub fn associations_for_keys(&self, key: &AssociationKey) -> Result<Vec<Association>> {
        if key.object_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: Vec<&str> = key.object_ids.iter().map(|_| "?").collect();
        let sql = format!(
            "SELECT id, tag_id, object_kind, object_id, added_at
             FROM associations WHERE object_kind = ? AND object_id IN ({})",
            placeholders.join(", ")
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&key.object_kind];
        for id in &key.object_ids {
            args.push(id);
        }

        let assocs = stmt
            .query_map(rusqlite::params_from_iter(args), Self::row_to_association)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(assocs)
    }

    // ==================== TAG LOOKUP ====================

    /// Distinct tags associated with a specific object instance, limited to
    /// tags visible to the given tenants.
    pub fn tags_for_object(
        &self,
        object_kind: &str,
        object_id: &str,
        visible_tenants: &BTreeSet<TenantId>,
    ) -> Result<Vec<Tag>> {
        self.tags_for(object_kind, Some(object_id), visible_tenants)
    }

    /// Distinct tags associated with any instance of an object kind, limited
    /// to tags visible to the given tenants.
    pub fn tags_for_kind(
        &self,
        object_kind: &str,
        visible_tenants: &BTreeSet<TenantId>,
    ) -> Result<Vec<Tag>> {
        self.tags_for(object_kind, None, visible_tenants)
    }

    fn tags_for(
        &self,
        object_kind: &str,
        object_id: Option<&str>,
        visible_tenants: &BTreeSet<TenantId>,
    ) -> Result<Vec<Tag>> {
        if visible_tenants.is_empty() {
            return Ok(Vec::new());
        }

        let tenant_ids: Vec<&str> = visible_tenants.iter().map(|t| t.as_str()).collect();
        let tenant_placeholders: Vec<&str> = tenant_ids.iter().map(|_| "?").collect();

        let mut sql = format!(
            "SELECT DISTINCT t.id, t.name, t.namespace, t.slug, t.created_at
             FROM tags t
             JOIN associations a ON a.tag_id = t.id
             WHERE a.object_kind = ?
               AND EXISTS (
                   SELECT 1 FROM tag_tenants tt
                   WHERE tt.tag_id = t.id AND tt.tenant_id IN ({})
               )",
            tenant_placeholders.join(", ")
        );
        if object_id.is_some() {
            sql.push_str(" AND a.object_id = ?");
        }
        sql.push_str(" ORDER BY t.namespace, t.name");

        let mut stmt = self.conn().prepare(&sql)?;
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&object_kind];
        for tenant in &tenant_ids {
            args.push(tenant);
        }
        if let Some(ref id) = object_id {
            args.push(id);
        }

        let tags = stmt
            .query_map(rusqlite::params_from_iter(args), Self::row_to_tag)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        tags.into_iter().map(|t| self.fill_tenants(t)).collect()
    }

    // ==================== ROW MAPPERS ====================

    fn row_to_tag(row: &Row) -> rusqlite::Result<Tag> {
        let id: String = row.get(0)?;
        let created_at: String = row.get(4)?;

        Ok(Tag {
            id: parse_uuid(&id)?,
            name: row.get(1)?,
            namespace: row.get(2)?,
            slug: row.get(3)?,
            tenants: BTreeSet::new(),
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    fn row_to_association(row: &Row) -> rusqlite::Result<Association> {
        let id: String = row.get(0)?;
        let tag_id: String = row.get(1)?;
        let added_at: String = row.get(4)?;

        Ok(Association {
            id: parse_uuid(&id)?,
            tag_id: parse_uuid(&tag_id)?,
            object_kind: row.get(2)?,
            object_id: row.get(3)?,
            added_at: chrono::DateTime::parse_from_rfc3339(&added_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    fn fill_tenants(&self, mut tag: Tag) -> Result<Tag> {
        tag.tenants = self.tenants_for_tag(tag.id)?;
        Ok(tag)
    }
}
