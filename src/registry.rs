use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{is_unique_violation, Database};
use crate::error::TagError;
use crate::models::*;

/// Cap on slug allocation retries; beyond this the input is treated as
/// pathological rather than merely contended.
const MAX_SLUG_ATTEMPTS: u32 = 1000;

/// Orchestration layer over the tag store: identity resolution, tenant
/// membership (merge/split/removal), and the association lifecycle.
///
/// The object-kind dispatch table and the audit hook are injected at
/// construction; the registry never reaches for process-wide state.
pub struct TagRegistry {
    db: Database,
    kinds: KindRegistry,
    audit: Arc<dyn AuditHook>,
}

impl TagRegistry {
    pub fn new(db: Database, kinds: KindRegistry, audit: Arc<dyn AuditHook>) -> Self {
        Self { db, kinds, audit }
    }

    pub fn with_null_audit(db: Database, kinds: KindRegistry) -> Self {
        Self::new(db, kinds, Arc::new(NullAudit))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    // ==================== IDENTITY RESOLUTION ====================

    /// Resolve a (name, slug) request to an existing tag or create a new one.
    ///
    /// Tags are logical singletons keyed by (name, slug) across all tenants:
    /// when the pair already exists the requesting tenants are merged into
    /// the existing row instead of creating a duplicate.
    pub fn get_or_create_tag(
        &self,
        name: &str,
        tenants: &BTreeSet<TenantId>,
        actor: &str,
    ) -> Result<Tag> {
        if tenants.is_empty() {
            return Err(TagError::InvariantViolation(
                "get_or_create_tag called with no tenants".to_string(),
            )
            .into());
        }

        self.db.with_transaction(|db| {
            let slug = slugify(name, None);
            if let Some(existing) = db.find_tag(name, &slug)? {
                return self.merge_tenants(db, existing, tenants, actor);
            }

            let tag = self.allocate_tag(db, name, tenants)?;
            info!(tag = %tag.slug, "created tag");
            self.record_audit(AuditEvent {
                tag_id: tag.id,
                action: AuditAction::Created,
                actor: actor.to_string(),
                comment: format!("Created tag {:?}.", tag.name),
                tenants: tag.tenants.clone(),
            });
            Ok(tag)
        })
    }

    /// Widen a tag's tenant set. Pure set union: existing associations are
    /// immediately valid for the new tenants, no new identity is created.
    pub fn add_tenants(
        &self,
        tag_id: Uuid,
        tenants: &BTreeSet<TenantId>,
        actor: &str,
    ) -> Result<Tag> {
        self.db.with_transaction(|db| {
            let tag = db.get_tag(tag_id)?.ok_or(TagError::TagNotFound(tag_id))?;
            self.merge_tenants(db, tag, tenants, actor)
        })
    }

    fn merge_tenants(
        &self,
        db: &Database,
        mut tag: Tag,
        tenants: &BTreeSet<TenantId>,
        actor: &str,
    ) -> Result<Tag> {
        let added: BTreeSet<TenantId> = tenants.difference(&tag.tenants).cloned().collect();
        for tenant in &added {
            db.insert_tag_tenant(tag.id, tenant)?;
            tag.tenants.insert(tenant.clone());
        }
        if !added.is_empty() {
            debug!(tag = %tag.slug, added = added.len(), "merged tenants into tag");
            self.record_audit(AuditEvent {
                tag_id: tag.id,
                action: AuditAction::TenantsAdded,
                actor: actor.to_string(),
                comment: format!("Added {} tenant(s) to tag {:?}.", added.len(), tag.name),
                tenants: added,
            });
        }
        Ok(tag)
    }

    // ==================== SLUG ALLOCATION ====================

    /// Persist a new tag under a unique slug, retrying with `_i` suffixes.
    ///
    /// Each attempt runs in its own savepoint so a collision rolls back only
    /// the failed insert, never work the surrounding transaction has already
    /// done. The UNIQUE constraint on slug is the sole serialization point;
    /// no lock is held across attempts.
    fn allocate_tag(
        &self,
        db: &Database,
        name: &str,
        tenants: &BTreeSet<TenantId>,
    ) -> Result<Tag> {
        let mut tag = Tag::new(name.to_string());
        tag.tenants = tenants.clone();
        let base = slugify(name, None);

        for attempt in 0..MAX_SLUG_ATTEMPTS {
            tag.slug = if attempt == 0 {
                base.clone()
            } else {
                slugify(name, Some(attempt))
            };

            match db.with_savepoint(|db| db.insert_tag(&tag)) {
                Ok(()) => return Ok(tag),
                Err(e) if is_unique_violation(&e) => {
                    debug!(slug = %tag.slug, "slug taken, retrying with suffix");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TagError::SlugRetriesExhausted {
            base,
            attempts: MAX_SLUG_ATTEMPTS,
        }
        .into())
    }

    /// In-place variant for renames: update name/namespace/slug on the same
    /// row, suffixing the slug until the UNIQUE constraint is satisfied. The
    /// row's current slug never conflicts with itself.
    fn rename_in_place(&self, db: &Database, tag: &mut Tag, new_name: &str) -> Result<()> {
        tag.set_name(new_name.to_string());
        let base = slugify(new_name, None);

        for attempt in 0..MAX_SLUG_ATTEMPTS {
            let candidate = if attempt == 0 {
                base.clone()
            } else {
                slugify(new_name, Some(attempt))
            };

            let updated = db.with_savepoint(|db| {
                db.update_tag_name(tag.id, &tag.name, &tag.namespace, &candidate)
            });
            match updated {
                Ok(found) => {
                    if !found {
                        return Err(TagError::TagNotFound(tag.id).into());
                    }
                    tag.slug = candidate;
                    return Ok(());
                }
                Err(e) if is_unique_violation(&e) => {
                    debug!(slug = %candidate, "slug taken, retrying with suffix");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TagError::SlugRetriesExhausted {
            base,
            attempts: MAX_SLUG_ATTEMPTS,
        }
        .into())
    }

    // ==================== RENAME / SPLIT ====================

    /// Rename a tag on behalf of `edited_tenants`.
    ///
    /// When the edit covers every tenant currently on the tag this is a
    /// plain in-place rename. Otherwise the tag is split: a new tag carries
    /// the new name for the edited tenants, the original keeps its name for
    /// everyone else, and associations are migrated by object tenant
    /// overlap. A rename must never change a name out from under a tenant
    /// that did not ask for it.
    ///
    /// A missing tag id (e.g. a restore of a previously deleted tag) is
    /// recreated fresh rather than treated as an error.
    pub fn rename_with_tenants(
        &self,
        tag_id: Uuid,
        new_name: &str,
        edited_tenants: &BTreeSet<TenantId>,
        actor: &str,
    ) -> Result<Tag> {
        if edited_tenants.is_empty() {
            return Err(TagError::InvariantViolation(
                "rename_with_tenants called with no tenants".to_string(),
            )
            .into());
        }

        self.db.with_transaction(|db| {
            let Some(mut tag) = db.get_tag(tag_id)? else {
                // Restore flow: the identity was deleted, create it fresh.
                let tag = self.allocate_tag(db, new_name, edited_tenants)?;
                info!(tag = %tag.slug, "restored tag as new");
                self.record_audit(AuditEvent {
                    tag_id: tag.id,
                    action: AuditAction::Created,
                    actor: actor.to_string(),
                    comment: format!("Restored tag {:?}.", tag.name),
                    tenants: tag.tenants.clone(),
                });
                return Ok(tag);
            };

            if tag.tenants.is_subset(edited_tenants) {
                let old_name = tag.name.clone();
                self.rename_in_place(db, &mut tag, new_name)?;
                info!(tag = %tag.slug, "renamed tag in place");
                self.record_audit(AuditEvent {
                    tag_id: tag.id,
                    action: AuditAction::Renamed,
                    actor: actor.to_string(),
                    comment: format!("Renamed tag {:?} to {:?}.", old_name, tag.name),
                    tenants: tag.tenants.clone(),
                });
                return Ok(tag);
            }

            self.split_tag(db, tag, new_name, edited_tenants, actor)
        })
    }

    /// Carve a tenant-specific replacement out of a shared tag. Runs inside
    /// the caller's transaction.
    fn split_tag(
        &self,
        db: &Database,
        original: Tag,
        new_name: &str,
        edited_tenants: &BTreeSet<TenantId>,
        actor: &str,
    ) -> Result<Tag> {
        let new_tag = self.allocate_tag(db, new_name, edited_tenants)?;

        // Move the edited tenants off the original tag.
        let mut remaining = original.tenants.clone();
        for tenant in edited_tenants {
            db.delete_tag_tenant(original.id, tenant)?;
            remaining.remove(tenant);
        }
        if remaining.is_empty() {
            // The superset case was handled as an in-place rename; reaching
            // here with nothing left means the orchestration went wrong.
            return Err(TagError::InvariantViolation(format!(
                "split emptied the tenant set of tag {}",
                original.id
            ))
            .into());
        }

        // Re-point associations by object tenant overlap. Kinds without
        // tenant scope keep their original association untouched, as do
        // objects with no overlap with the new tenant set.
        for assoc in db.associations_for_tag(original.id)? {
            let Some(object_tenants) = self
                .kinds
                .object_tenants(&assoc.object_kind, &assoc.object_id)?
            else {
                continue;
            };

            if object_tenants.intersection(&new_tag.tenants).next().is_some() {
                db.insert_association(&Association::new(
                    new_tag.id,
                    assoc.object_kind.clone(),
                    assoc.object_id.clone(),
                ))?;
                if object_tenants.intersection(&remaining).next().is_none() {
                    db.delete_association(assoc.id)?;
                }
            }
        }

        info!(
            original = %original.slug,
            new = %new_tag.slug,
            "split tag for a tenant-scoped rename"
        );
        self.record_audit(AuditEvent {
            tag_id: new_tag.id,
            action: AuditAction::Created,
            actor: actor.to_string(),
            comment: format!("Created tag {:?}.", new_tag.name),
            tenants: new_tag.tenants.clone(),
        });
        self.record_audit(AuditEvent {
            tag_id: original.id,
            action: AuditAction::Split,
            actor: actor.to_string(),
            comment: format!(
                "Split tag {:?}: {:?} now carries the edited tenants.",
                original.name, new_tag.name
            ),
            tenants: edited_tenants.clone(),
        });

        Ok(new_tag)
    }

    // ==================== TENANT REMOVAL ====================

    /// Remove tenants from a tag, constrained to the caller's accessible
    /// scope. Returns the surviving tag, or `None` when the last tenant was
    /// removed and the tag was deleted with all its associations.
    ///
    /// Tenants outside `accessible` are silently filtered out so a bulk
    /// operation can proceed for the tenants the caller does control.
    /// Removing a tenant already absent from the set is a no-op.
    pub fn remove_tenants(
        &self,
        tag_id: Uuid,
        to_remove: &BTreeSet<TenantId>,
        accessible: &BTreeSet<TenantId>,
        actor: &str,
    ) -> Result<Option<Tag>> {
        self.db.with_transaction(|db| {
            let mut tag = db.get_tag(tag_id)?.ok_or(TagError::TagNotFound(tag_id))?;

            let removed: BTreeSet<TenantId> = to_remove
                .intersection(accessible)
                .filter(|t| tag.tenants.contains(*t))
                .cloned()
                .collect();
            if removed.is_empty() {
                return Ok(Some(tag));
            }

            let remaining: BTreeSet<TenantId> =
                tag.tenants.difference(&removed).cloned().collect();

            if remaining.is_empty() {
                db.delete_tag(tag.id)?;
                info!(tag = %tag.slug, "deleted tag, no tenants left");
                self.record_audit(AuditEvent {
                    tag_id: tag.id,
                    action: AuditAction::Deleted,
                    actor: actor.to_string(),
                    comment: format!("Deleted tag {:?}.", tag.name),
                    tenants: removed,
                });
                return Ok(None);
            }

            // Sweep associations orphaned for every tenant still on the tag.
            for assoc in db.associations_for_tag(tag.id)? {
                let Some(object_tenants) = self
                    .kinds
                    .object_tenants(&assoc.object_kind, &assoc.object_id)?
                else {
                    continue;
                };
                if object_tenants.intersection(&remaining).next().is_none() {
                    db.delete_association(assoc.id)?;
                }
            }

            for tenant in &removed {
                db.delete_tag_tenant(tag.id, tenant)?;
            }
            tag.tenants = remaining;

            debug!(tag = %tag.slug, removed = removed.len(), "removed tenants from tag");
            self.record_audit(AuditEvent {
                tag_id: tag.id,
                action: AuditAction::TenantsRemoved,
                actor: actor.to_string(),
                comment: format!("Removed {} tenant(s) from tag {:?}.", removed.len(), tag.name),
                tenants: removed,
            });
            Ok(Some(tag))
        })
    }

    // ==================== ASSOCIATIONS ====================

    /// Tag an object. The object kind is checked against the dispatch table
    /// when a handler is registered; unknown kinds are accepted as opaque.
    pub fn tag_object(&self, tag_id: Uuid, object_kind: &str, object_id: &str) -> Result<Association> {
        self.db.with_transaction(|db| {
            if db.get_tag(tag_id)?.is_none() {
                return Err(TagError::TagNotFound(tag_id).into());
            }
            if let Some(handler) = self.kinds.get(object_kind) {
                if !handler.exists(object_id)? {
                    anyhow::bail!("no {} object with id {}", object_kind, object_id);
                }
            }
            let assoc = Association::new(tag_id, object_kind.to_string(), object_id.to_string());
            db.insert_association(&assoc)?;
            Ok(assoc)
        })
    }

    /// Remove the link between a tag and an object, if present.
    pub fn untag_object(&self, tag_id: Uuid, object_kind: &str, object_id: &str) -> Result<bool> {
        self.db
            .delete_association_for_object(tag_id, object_kind, object_id)
    }

    /// Distinct tags on a specific object, scoped to the caller's tenants.
    pub fn tags_for_object(
        &self,
        object_kind: &str,
        object_id: &str,
        visible_tenants: &BTreeSet<TenantId>,
    ) -> Result<Vec<Tag>> {
        self.db
            .tags_for_object(object_kind, object_id, visible_tenants)
    }

    /// Distinct tags on any instance of a kind, scoped to the caller's
    /// tenants.
    pub fn tags_for_kind(
        &self,
        object_kind: &str,
        visible_tenants: &BTreeSet<TenantId>,
    ) -> Result<Vec<Tag>> {
        self.db.tags_for_kind(object_kind, visible_tenants)
    }

    /// Associations of a batch of same-kind objects in one query.
    pub fn associations_for_keys(&self, key: &AssociationKey) -> Result<Vec<Association>> {
        self.db.associations_for_keys(key)
    }

    /// Number of a tag's associations relevant to one tenant: associations
    /// whose object belongs to the tenant, plus all associations of kinds
    /// without tenant scope.
    pub fn tagged_count(&self, tag_id: Uuid, tenant: &TenantId) -> Result<u32> {
        let mut count = 0;
        for assoc in self.db.associations_for_tag(tag_id)? {
            match self
                .kinds
                .object_tenants(&assoc.object_kind, &assoc.object_id)?
            {
                Some(object_tenants) => {
                    if object_tenants.contains(tenant) {
                        count += 1;
                    }
                }
                None => count += 1,
            }
        }
        Ok(count)
    }

    // ==================== AUDIT ====================

    /// Fire-and-forget: a failing hook must never roll back the primary
    /// transaction.
    fn record_audit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event) {
            warn!(tag_id = %event.tag_id, error = %e, "audit hook failed");
        }
    }
}
