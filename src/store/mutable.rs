//! Write path: transactional persistence of ACL mutations.
//!
//! `update_acl` drains the ACL's change set inside one transaction in a fixed
//! order: removed entries are deleted first so the `(scope, field, order)`
//! uniqueness holds, surviving entries are re-ordered (moves that increase an
//! order run after the rest of their group), per-entry field updates follow,
//! and new entries are inserted last with their dense order. Reparenting
//! regenerates the ancestor closure for the ACL and its whole subtree.
//! In-memory effects — sibling synchronization of class-scope lists, identity
//! map upkeep, cache eviction — apply only after commit.

use super::{
    AclProvider, MutableAclProvider, PostgresAclProvider, is_unique_violation,
};
use crate::error::{AclError, AclResult};
use crate::model::{
    Acl, AclChangeSet, Entry, ObjectIdentity, SecurityIdentity, entries_eq, field_map_eq,
};
use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

/// Old/new snapshots of one `(scope, field)` ACE group, the unit the order
/// uniqueness constraint applies to.
struct ListGroup {
    object_scope: bool,
    field: Option<String>,
    old: Vec<Entry>,
    new: Vec<Entry>,
}

fn list_groups(changes: &AclChangeSet) -> Vec<ListGroup> {
    let mut groups = Vec::new();
    if let Some((old, new)) = &changes.class_aces {
        groups.push(ListGroup {
            object_scope: false,
            field: None,
            old: old.clone(),
            new: new.clone(),
        });
    }
    if let Some((old, new)) = &changes.object_aces {
        groups.push(ListGroup {
            object_scope: true,
            field: None,
            old: old.clone(),
            new: new.clone(),
        });
    }
    for (object_scope, maps) in [
        (false, &changes.class_field_aces),
        (true, &changes.object_field_aces),
    ] {
        if let Some((old, new)) = maps {
            let fields: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            for field in fields {
                groups.push(ListGroup {
                    object_scope,
                    field: Some(field.clone()),
                    old: old.get(field).cloned().unwrap_or_default(),
                    new: new.get(field).cloned().unwrap_or_default(),
                });
            }
        }
    }
    groups
}

impl PostgresAclProvider {
    async fn create_or_retrieve_class_id(
        &self,
        executor: impl sqlx::PgExecutor<'_>,
        class_type: &str,
    ) -> AclResult<i64> {
        let sql = format!(
            "INSERT INTO {class_table} (class_type) VALUES ($1) \
             ON CONFLICT (class_type) DO UPDATE SET class_type = EXCLUDED.class_type \
             RETURNING id",
            class_table = self.options.class_table_name,
        );
        sqlx::query_scalar(&sql)
            .bind(class_type)
            .fetch_one(executor)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))
    }

    async fn create_or_retrieve_sid_id(
        &self,
        executor: impl sqlx::PgExecutor<'_>,
        sid: &SecurityIdentity,
    ) -> AclResult<i64> {
        let sql = format!(
            "INSERT INTO {sid_table} (identifier, username) VALUES ($1, $2) \
             ON CONFLICT (identifier, username) DO UPDATE SET identifier = EXCLUDED.identifier \
             RETURNING id",
            sid_table = self.options.sid_table_name,
        );
        sqlx::query_scalar(&sql)
            .bind(sid.wire_form())
            .bind(sid.is_username())
            .fetch_one(executor)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))
    }

    /// Rebuild the closure rows of one ACL from its in-memory parent chain:
    /// the self row plus one row per ancestor.
    async fn regenerate_ancestors(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        acl: &Acl,
    ) -> AclResult<()> {
        let pk = acl.id();
        let delete_sql = format!(
            "DELETE FROM {anc_table} WHERE object_identity_id = $1",
            anc_table = self.options.oid_ancestors_table_name,
        );
        sqlx::query(&delete_sql)
            .bind(pk)
            .execute(&mut **tx)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;

        let insert_sql = format!(
            "INSERT INTO {anc_table} (object_identity_id, ancestor_id) VALUES ($1, $2)",
            anc_table = self.options.oid_ancestors_table_name,
        );
        sqlx::query(&insert_sql)
            .bind(pk)
            .bind(pk)
            .execute(&mut **tx)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;
        let mut parent = acl.parent_acl();
        while let Some(ancestor) = parent {
            sqlx::query(&insert_sql)
                .bind(pk)
                .bind(ancestor.id())
                .execute(&mut **tx)
                .await
                .map_err(|e| AclError::Unexpected(e.into()))?;
            parent = ancestor.parent_acl();
        }
        Ok(())
    }

    fn delete_acl_in_tx<'a>(
        &'a self,
        tx: &'a mut Transaction<'static, Postgres>,
        oid: ObjectIdentity,
        deleted: &'a mut Vec<ObjectIdentity>,
    ) -> Pin<Box<dyn Future<Output = AclResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some(pk) = self.object_identity_pk(&mut **tx, &oid).await? else {
                return Err(AclError::AclNotFound(oid));
            };

            let children_sql = format!(
                "SELECT o.object_identifier, c.class_type FROM {oid_table} o \
                 INNER JOIN {class_table} c ON c.id = o.class_id \
                 WHERE o.parent_object_identity_id = $1",
                oid_table = self.options.oid_table_name,
                class_table = self.options.class_table_name,
            );
            let children: Vec<(String, String)> = sqlx::query_as(&children_sql)
                .bind(pk)
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| AclError::Unexpected(e.into()))?;
            for (identifier, class_type) in children {
                let child =
                    ObjectIdentity::new(Self::normalize_class_type(&class_type), identifier);
                self.delete_acl_in_tx(tx, child, deleted).await?;
            }

            let delete_entries = format!(
                "DELETE FROM {entry_table} WHERE object_identity_id = $1",
                entry_table = self.options.entry_table_name,
            );
            sqlx::query(&delete_entries)
                .bind(pk)
                .execute(&mut **tx)
                .await
                .map_err(|e| AclError::Unexpected(e.into()))?;
            let delete_ancestors = format!(
                "DELETE FROM {anc_table} WHERE object_identity_id = $1",
                anc_table = self.options.oid_ancestors_table_name,
            );
            sqlx::query(&delete_ancestors)
                .bind(pk)
                .execute(&mut **tx)
                .await
                .map_err(|e| AclError::Unexpected(e.into()))?;
            let delete_oid = format!(
                "DELETE FROM {oid_table} WHERE id = $1",
                oid_table = self.options.oid_table_name,
            );
            sqlx::query(&delete_oid)
                .bind(pk)
                .execute(&mut **tx)
                .await
                .map_err(|e| AclError::Unexpected(e.into()))?;

            deleted.push(oid);
            Ok(())
        })
    }

    /// Compare every other loaded ACL of the same type against the recorded
    /// old snapshots. Divergence means another writer got there first.
    fn check_class_siblings(&self, acl: &Acl, changes: &AclChangeSet) -> AclResult<()> {
        let state = self.state.lock();
        let oid = acl.object_identity();
        for (other_oid, other) in state.loaded_acls.iter() {
            if other_oid.object_type() != oid.object_type() || other.ptr_eq(acl) {
                continue;
            }
            if let Some((old, _)) = &changes.class_aces {
                if !entries_eq(&other.class_aces(), old) {
                    return Err(AclError::ConcurrentModification(format!(
                        "class-scope entries of {other_oid} diverged from the recorded snapshot"
                    )));
                }
            }
            if let Some((old, _)) = &changes.class_field_aces {
                if !field_map_eq(&other.class_field_ace_map(), old) {
                    return Err(AclError::ConcurrentModification(format!(
                        "class-scope field entries of {other_oid} diverged from the recorded \
                         snapshot"
                    )));
                }
            }
        }
        Ok(())
    }

    fn sync_class_siblings(&self, acl: &Acl, changes: &AclChangeSet) {
        let state = self.state.lock();
        let oid = acl.object_identity();
        for (other_oid, other) in state.loaded_acls.iter() {
            if other_oid.object_type() != oid.object_type() || other.ptr_eq(acl) {
                continue;
            }
            if let Some((_, new)) = &changes.class_aces {
                other.replace_class_aces_silent(new.clone());
            }
            if let Some((_, new)) = &changes.class_field_aces {
                other.replace_class_field_aces_silent(new.clone());
            }
        }
    }
}

#[async_trait]
impl MutableAclProvider for PostgresAclProvider {
    async fn create_acl(&self, oid: &ObjectIdentity) -> AclResult<Acl> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;
        if self.object_identity_pk(&mut *tx, oid).await?.is_some() {
            return Err(AclError::AclAlreadyExists(oid.clone()));
        }
        let class_id = self
            .create_or_retrieve_class_id(&mut *tx, oid.object_type())
            .await?;
        let insert_oid = format!(
            "INSERT INTO {oid_table} (class_id, object_identifier, entries_inheriting) \
             VALUES ($1, $2, true) RETURNING id",
            oid_table = self.options.oid_table_name,
        );
        let pk: i64 = match sqlx::query_scalar(&insert_oid)
            .bind(class_id)
            .bind(oid.identifier())
            .fetch_one(&mut *tx)
            .await
        {
            Ok(pk) => pk,
            Err(err) if is_unique_violation(&err) => {
                return Err(AclError::AclAlreadyExists(oid.clone()));
            }
            Err(err) => return Err(AclError::Unexpected(err.into())),
        };
        let insert_self_ancestor = format!(
            "INSERT INTO {anc_table} (object_identity_id, ancestor_id) VALUES ($1, $1)",
            anc_table = self.options.oid_ancestors_table_name,
        );
        sqlx::query(&insert_self_ancestor)
            .bind(pk)
            .execute(&mut *tx)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;
        tx.commit()
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;

        metrics::counter!("palisade_acl_mutations_total", "op" => "create").increment(1);
        self.find_acl(oid, &[]).await
    }

    async fn delete_acl(&self, oid: &ObjectIdentity) -> AclResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;
        let mut deleted = Vec::new();
        self.delete_acl_in_tx(&mut tx, oid.clone(), &mut deleted)
            .await?;
        tx.commit()
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;

        {
            let mut state = self.state.lock();
            for oid in &deleted {
                if let Some(acl) = state.loaded_acls.remove(oid) {
                    acl.clear_changes();
                }
            }
        }
        if let Some(cache) = &self.cache {
            for oid in &deleted {
                cache.evict_by_identity(oid);
            }
        }
        metrics::counter!("palisade_acl_mutations_total", "op" => "delete")
            .increment(deleted.len() as u64);
        Ok(())
    }

    async fn update_acl(&self, acl: &Acl) -> AclResult<()> {
        let oid = acl.object_identity();
        {
            let state = self.state.lock();
            match state.loaded_acls.get(&oid) {
                Some(tracked) if tracked.ptr_eq(acl) => {}
                _ => {
                    return Err(AclError::InvalidArgument(format!(
                        "ACL for {oid} is not tracked by this provider"
                    )));
                }
            }
        }
        let changes = acl.change_set();
        if changes.is_empty() {
            return Ok(());
        }

        let parent_changed = changes.parent.is_some();
        let shared_changed = changes.class_scope_changed();
        let groups = list_groups(&changes);

        // The subtree is needed for closure regeneration and cache eviction.
        let descendants = if parent_changed || self.cache.is_some() {
            self.find_children(&oid, false).await?
        } else {
            Vec::new()
        };
        let descendant_acls: Vec<Acl> = if parent_changed && !descendants.is_empty() {
            self.find_acls(&descendants, &[])
                .await?
                .into_values()
                .collect()
        } else {
            Vec::new()
        };

        // Divergence of shared class-scope state aborts before any write;
        // the recorded old snapshots must still match every loaded sibling.
        if shared_changed {
            self.check_class_siblings(acl, &changes)?;
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;
        let pk = acl.id();
        let class_id_sql = format!(
            "SELECT class_id FROM {oid_table} WHERE id = $1",
            oid_table = self.options.oid_table_name,
        );
        let class_id: i64 = sqlx::query_scalar(&class_id_sql)
            .bind(pk)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;

        if parent_changed {
            self.regenerate_ancestors(&mut tx, acl).await?;
            for descendant in &descendant_acls {
                self.regenerate_ancestors(&mut tx, descendant).await?;
            }
        }

        // Deletes come first so re-used orders are free before any update.
        let delete_entry_sql = format!(
            "DELETE FROM {entry_table} WHERE id = $1",
            entry_table = self.options.entry_table_name,
        );
        let mut removed_ids: Vec<i64> = Vec::new();
        for group in &groups {
            let surviving: HashSet<i64> = group.new.iter().filter_map(Entry::id).collect();
            for entry in &group.old {
                if let Some(id) = entry.id() {
                    if !surviving.contains(&id) {
                        sqlx::query(&delete_entry_sql)
                            .bind(id)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| AclError::Unexpected(e.into()))?;
                        removed_ids.push(id);
                    }
                }
            }
        }

        // Re-order surviving entries. Within a group, moves to a smaller
        // order run first (their slot was freed by a delete); moves to a
        // larger order run afterwards, furthest first, so no transient
        // collision with a not-yet-moved sibling occurs.
        let order_sql = format!(
            "UPDATE {entry_table} SET ace_order = $1 WHERE id = $2",
            entry_table = self.options.entry_table_name,
        );
        for group in &groups {
            let old_positions: HashMap<i64, i32> = group
                .old
                .iter()
                .enumerate()
                .filter_map(|(idx, entry)| entry.id().map(|id| (id, idx as i32)))
                .collect();
            let mut moves: Vec<(i64, i32, i32)> = Vec::new();
            for (idx, entry) in group.new.iter().enumerate() {
                if let Some(id) = entry.id() {
                    if let Some(&old_idx) = old_positions.get(&id) {
                        let new_idx = idx as i32;
                        if old_idx != new_idx {
                            moves.push((id, old_idx, new_idx));
                        }
                    }
                }
            }
            let (mut decreasing, mut increasing): (Vec<_>, Vec<_>) =
                moves.into_iter().partition(|(_, old, new)| new < old);
            decreasing.sort_by_key(|&(_, old, _)| old);
            increasing.sort_by_key(|&(_, old, _)| std::cmp::Reverse(old));
            for (id, _, new_idx) in decreasing.into_iter().chain(increasing) {
                sqlx::query(&order_sql)
                    .bind(new_idx)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| AclError::Unexpected(e.into()))?;
            }
        }

        // Per-entry field updates, one row each.
        for (id, record) in &changes.aces {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "UPDATE {entry_table} SET ",
                entry_table = self.options.entry_table_name,
            ));
            {
                let mut assignments = qb.separated(", ");
                if let Some((_, new)) = record.mask {
                    assignments.push("mask = ");
                    assignments.push_bind_unseparated(new);
                }
                if let Some((_, new)) = record.strategy {
                    assignments.push("granting_strategy = ");
                    assignments.push_bind_unseparated(new.as_str().to_string());
                }
                if let Some((_, new)) = record.audit_success {
                    assignments.push("audit_success = ");
                    assignments.push_bind_unseparated(new);
                }
                if let Some((_, new)) = record.audit_failure {
                    assignments.push("audit_failure = ");
                    assignments.push_bind_unseparated(new);
                }
            }
            qb.push(" WHERE id = ");
            qb.push_bind(*id);
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(|e| AclError::Unexpected(e.into()))?;
        }

        // Insert new entries with their dense order and collect issued ids.
        let insert_entry_sql = format!(
            "INSERT INTO {entry_table} (class_id, object_identity_id, security_identity_id, \
             field_name, ace_order, mask, granting, granting_strategy, audit_success, \
             audit_failure) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
            entry_table = self.options.entry_table_name,
        );
        let mut inserted: Vec<Entry> = Vec::new();
        for group in &groups {
            for (idx, entry) in group.new.iter().enumerate() {
                if entry.id().is_some() {
                    continue;
                }
                let sid_id = self
                    .create_or_retrieve_sid_id(&mut *tx, &entry.security_identity())
                    .await?;
                let object_identity_id = group.object_scope.then_some(pk);
                let new_id: i64 = match sqlx::query_scalar(&insert_entry_sql)
                    .bind(class_id)
                    .bind(object_identity_id)
                    .bind(sid_id)
                    .bind(group.field.as_deref())
                    .bind(idx as i32)
                    .bind(entry.mask())
                    .bind(entry.is_granting())
                    .bind(entry.strategy().as_str())
                    .bind(entry.is_audit_success())
                    .bind(entry.is_audit_failure())
                    .fetch_one(&mut *tx)
                    .await
                {
                    Ok(id) => id,
                    // A writer that slipped past the sibling check shows up
                    // as a collision on the order uniqueness.
                    Err(err) if is_unique_violation(&err) => {
                        return Err(AclError::ConcurrentModification(format!(
                            "entry order collision while persisting {oid}"
                        )));
                    }
                    Err(err) => return Err(AclError::Unexpected(err.into())),
                };
                entry.assign_id(new_id);
                inserted.push(entry.clone());
            }
        }

        if changes.entries_inheriting.is_some() || changes.parent.is_some() {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "UPDATE {oid_table} SET ",
                oid_table = self.options.oid_table_name,
            ));
            {
                let mut assignments = qb.separated(", ");
                if let Some((_, new)) = changes.entries_inheriting {
                    assignments.push("entries_inheriting = ");
                    assignments.push_bind_unseparated(new);
                }
                if let Some((_, new_parent)) = &changes.parent {
                    assignments.push("parent_object_identity_id = ");
                    assignments.push_bind_unseparated(new_parent.as_ref().map(Acl::id));
                }
            }
            qb.push(" WHERE id = ");
            qb.push_bind(pk);
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(|e| AclError::Unexpected(e.into()))?;
        }

        tx.commit()
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;

        {
            let mut state = self.state.lock();
            for entry in &inserted {
                if let Some(id) = entry.id() {
                    state.loaded_aces.insert(id, entry.clone());
                }
            }
            for id in &removed_ids {
                state.loaded_aces.remove(id);
            }
        }
        if shared_changed {
            self.sync_class_siblings(acl, &changes);
        }
        acl.clear_changes();

        if let Some(cache) = &self.cache {
            if shared_changed {
                // Descendants may be of unrelated types; drop everything.
                cache.clear();
            } else {
                cache.evict_by_identity(&oid);
                for descendant in &descendants {
                    cache.evict_by_identity(descendant);
                }
            }
        }
        metrics::counter!("palisade_acl_mutations_total", "op" => "update").increment(1);
        Ok(())
    }

    async fn delete_security_identity(&self, sid: &SecurityIdentity) -> AclResult<()> {
        let sql = format!(
            "DELETE FROM {sid_table} WHERE identifier = $1 AND username = $2",
            sid_table = self.options.sid_table_name,
        );
        sqlx::query(&sql)
            .bind(sid.wire_form())
            .bind(sid.is_username())
            .execute(&self.pool)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;
        Ok(())
    }

    async fn update_user_security_identity(
        &self,
        sid: &SecurityIdentity,
        old_username: &str,
    ) -> AclResult<()> {
        let SecurityIdentity::User { class, username } = sid else {
            return Err(AclError::InvalidArgument(
                "expected a user security identity".to_string(),
            ));
        };
        if username == old_username {
            return Err(AclError::InvalidArgument(
                "old and new usernames are equal".to_string(),
            ));
        }
        let old_wire = format!("{class}-{old_username}");
        let sql = format!(
            "UPDATE {sid_table} SET identifier = $1 WHERE identifier = $2 AND username = true",
            sid_table = self.options.sid_table_name,
        );
        sqlx::query(&sql)
            .bind(sid.wire_form())
            .bind(&old_wire)
            .execute(&self.pool)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;
        Ok(())
    }
}
