//! Read path: batched hydration of ACL trees.
//!
//! `find_acls` resolves each requested identity against, in order, the
//! partial result (duplicate inputs), the identity map, the external cache,
//! and finally a database batch. A batch costs two statements regardless of
//! size: one ancestor-closure query collecting every ACL id that must be
//! materialized, and one join that returns ACLs and their entries row by
//! row. The sweep over those rows reuses already-loaded instances so that
//! referential identity holds across overlapping loads.

use super::{AclProvider, PostgresAclProvider, ProviderState};
use crate::error::{AclError, AclResult};
use crate::model::{
    Acl, AclSnapshot, Entry, EntrySnapshot, GrantingStrategy, ObjectIdentity, SecurityIdentity,
};
use async_trait::async_trait;
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

/// Row shape of the hydration query. Entry and security-identity columns are
/// nullable because object identities without entries still produce a row
/// through the left joins.
#[derive(Debug, FromRow)]
struct LookupRow {
    acl_id: i64,
    object_identifier: String,
    parent_object_identity_id: Option<i64>,
    entries_inheriting: bool,
    class_type: String,
    ace_id: Option<i64>,
    object_identity_id: Option<i64>,
    field_name: Option<String>,
    ace_order: Option<i32>,
    mask: Option<i32>,
    granting: Option<bool>,
    granting_strategy: Option<String>,
    audit_success: Option<bool>,
    audit_failure: Option<bool>,
    username_flag: Option<bool>,
    security_identifier: Option<String>,
}

/// Per-ACL accumulation of `(order, entry)` pairs during one hydration pass.
#[derive(Default)]
struct AceBuckets {
    class: Vec<(i32, Entry)>,
    class_field: HashMap<String, Vec<(i32, Entry)>>,
    object: Vec<(i32, Entry)>,
    object_field: HashMap<String, Vec<(i32, Entry)>>,
}

impl PostgresAclProvider {
    /// Legacy storage escaped class names with doubled backslashes; reads
    /// normalize them so in-memory identities use single backslashes.
    pub(crate) fn normalize_class_type(raw: &str) -> String {
        if raw.contains("\\\\") {
            raw.replace("\\\\", "\\")
        } else {
            raw.to_string()
        }
    }

    pub(crate) async fn object_identity_pk(
        &self,
        executor: impl sqlx::PgExecutor<'_>,
        oid: &ObjectIdentity,
    ) -> AclResult<Option<i64>> {
        let sql = format!(
            "SELECT o.id FROM {oid_table} o \
             INNER JOIN {class_table} c ON c.id = o.class_id \
             WHERE o.object_identifier = $1 AND c.class_type = $2",
            oid_table = self.options.oid_table_name,
            class_table = self.options.class_table_name,
        );
        sqlx::query_scalar(&sql)
            .bind(oid.identifier())
            .bind(oid.object_type())
            .fetch_optional(executor)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))
    }

    /// One statement returning the transitive ancestor ids of every identity
    /// in the batch. A single-type batch collapses to one `IN (...)` list;
    /// mixed batches OR the `(identifier, type)` pairs together.
    async fn ancestor_ids(&self, batch: &[ObjectIdentity]) -> AclResult<Vec<i64>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT a.ancestor_id FROM {oid_table} o \
             INNER JOIN {class_table} c ON c.id = o.class_id \
             INNER JOIN {anc_table} a ON a.object_identity_id = o.id WHERE ",
            oid_table = self.options.oid_table_name,
            class_table = self.options.class_table_name,
            anc_table = self.options.oid_ancestors_table_name,
        ));
        let single_type = batch
            .iter()
            .all(|oid| oid.object_type() == batch[0].object_type());
        if single_type {
            qb.push("o.object_identifier IN (");
            {
                let mut separated = qb.separated(", ");
                for oid in batch {
                    separated.push_bind(oid.identifier().to_string());
                }
            }
            qb.push(") AND c.class_type = ");
            qb.push_bind(batch[0].object_type().to_string());
        } else {
            for (i, oid) in batch.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push("(o.object_identifier = ");
                qb.push_bind(oid.identifier().to_string());
                qb.push(" AND c.class_type = ");
                qb.push_bind(oid.object_type().to_string());
                qb.push(")");
            }
        }
        let ids: Vec<i64> = qb
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;
        let unique: BTreeSet<i64> = ids.into_iter().collect();
        Ok(unique.into_iter().collect())
    }

    async fn lookup_rows(&self, ancestor_ids: &[i64]) -> AclResult<Vec<LookupRow>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT o.id AS acl_id, o.object_identifier, o.parent_object_identity_id, \
             o.entries_inheriting, c.class_type, e.id AS ace_id, e.object_identity_id, \
             e.field_name, e.ace_order, e.mask, e.granting, e.granting_strategy, \
             e.audit_success, e.audit_failure, s.username AS username_flag, \
             s.identifier AS security_identifier \
             FROM {oid_table} o \
             INNER JOIN {class_table} c ON c.id = o.class_id \
             LEFT JOIN {entry_table} e ON e.class_id = o.class_id \
                 AND (e.object_identity_id = o.id OR e.object_identity_id IS NULL) \
             LEFT JOIN {sid_table} s ON s.id = e.security_identity_id \
             WHERE o.id IN (",
            oid_table = self.options.oid_table_name,
            class_table = self.options.class_table_name,
            entry_table = self.options.entry_table_name,
            sid_table = self.options.sid_table_name,
        ));
        {
            let mut separated = qb.separated(", ");
            for id in ancestor_ids {
                separated.push_bind(*id);
            }
        }
        qb.push(")");
        qb.build_query_as::<LookupRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))
    }

    pub(crate) async fn load_batch(
        &self,
        batch: &[ObjectIdentity],
    ) -> AclResult<HashMap<ObjectIdentity, Acl>> {
        let ancestor_ids = self.ancestor_ids(batch).await?;
        if ancestor_ids.is_empty() {
            // At least one identity in the batch has no ACL row.
            return Err(AclError::AclNotFound(batch[0].clone()));
        }
        let rows = self.lookup_rows(&ancestor_ids).await?;
        self.hydrate(rows, batch)
    }

    /// Sweep the hydration rows in arrival order, materializing ACLs and
    /// entries while preserving instance identity, then install sorted ACE
    /// lists and resolve deferred parent links.
    fn hydrate(
        &self,
        rows: Vec<LookupRow>,
        batch: &[ObjectIdentity],
    ) -> AclResult<HashMap<ObjectIdentity, Acl>> {
        let mut state = self.state.lock();
        let mut pass_acls: HashMap<i64, Acl> = HashMap::new();
        let mut by_oid: HashMap<ObjectIdentity, Acl> = HashMap::new();
        let mut sid_intern: HashMap<String, SecurityIdentity> = HashMap::new();
        let mut buckets: HashMap<i64, AceBuckets> = HashMap::new();
        let mut deferred: Vec<(i64, i64)> = Vec::new();
        let mut constructed = 0u64;

        for row in rows {
            let class_type = Self::normalize_class_type(&row.class_type);
            let oid = ObjectIdentity::new(class_type, row.object_identifier.clone());
            let acl = match pass_acls.get(&row.acl_id) {
                Some(acl) => acl.clone(),
                None => {
                    let acl = if let Some(existing) = state.loaded_acls.get(&oid) {
                        existing.clone()
                    } else {
                        constructed += 1;
                        let acl = Acl::new(
                            row.acl_id,
                            oid.clone(),
                            row.entries_inheriting,
                            self.strategy.clone(),
                        );
                        if let Some(parent_id) = row.parent_object_identity_id {
                            match pass_acls.get(&parent_id) {
                                Some(parent) => acl.set_parent_internal(Some(parent.clone())),
                                None => deferred.push((row.acl_id, parent_id)),
                            }
                        }
                        acl
                    };
                    pass_acls.insert(row.acl_id, acl.clone());
                    by_oid.insert(oid, acl.clone());
                    acl
                }
            };

            let Some(ace_id) = row.ace_id else { continue };
            let entry = match state.loaded_aces.get(&ace_id) {
                Some(entry) => entry.clone(),
                None => {
                    let flag = require(row.username_flag, "username flag")?;
                    let identifier = require(row.security_identifier, "security identifier")?;
                    let key = format!("{}{identifier}", if flag { '1' } else { '0' });
                    if !sid_intern.contains_key(&key) {
                        sid_intern
                            .insert(key.clone(), SecurityIdentity::from_wire(&identifier, flag)?);
                    }
                    let sid = sid_intern[&key].clone();
                    let strategy_name = require(row.granting_strategy, "granting strategy")?;
                    let strategy = GrantingStrategy::from_str(&strategy_name).map_err(|_| {
                        AclError::IntegrityViolation(format!(
                            "unknown granting strategy {strategy_name} on entry {ace_id}"
                        ))
                    })?;
                    let entry = Entry::hydrated(
                        ace_id,
                        sid,
                        require(row.mask, "mask")?,
                        require(row.granting, "granting")?,
                        strategy,
                        require(row.audit_success, "audit_success")?,
                        require(row.audit_failure, "audit_failure")?,
                        row.field_name.clone(),
                        acl.changes_weak(),
                    );
                    state.loaded_aces.insert(ace_id, entry.clone());
                    entry
                }
            };

            let order = require(row.ace_order, "ace order")?;
            let bucket = buckets.entry(row.acl_id).or_default();
            match (row.object_identity_id.is_none(), row.field_name) {
                (true, None) => bucket.class.push((order, entry)),
                (true, Some(field)) => bucket
                    .class_field
                    .entry(field)
                    .or_default()
                    .push((order, entry)),
                (false, None) => bucket.object.push((order, entry)),
                (false, Some(field)) => bucket
                    .object_field
                    .entry(field)
                    .or_default()
                    .push((order, entry)),
            }
        }

        for (acl_id, bucket) in buckets {
            let acl = pass_acls.get(&acl_id).expect("bucketed ACL was resolved");
            acl.install_entries(
                sort_bucket(bucket.class),
                sort_field_bucket(bucket.class_field),
                sort_bucket(bucket.object),
                sort_field_bucket(bucket.object_field),
            );
        }

        for (acl_id, parent_id) in deferred {
            match pass_acls.get(&parent_id) {
                Some(parent) => {
                    let parent = parent.clone();
                    pass_acls
                        .get(&acl_id)
                        .expect("deferred ACL was resolved")
                        .set_parent_internal(Some(parent));
                }
                None => {
                    tracing::error!(acl_id, parent_id, "parent ACL missing after hydration pass");
                    return Err(AclError::IntegrityViolation(format!(
                        "parent {parent_id} of ACL {acl_id} was not hydrated"
                    )));
                }
            }
        }

        for acl in pass_acls.values() {
            state
                .loaded_acls
                .entry(acl.object_identity())
                .or_insert_with(|| acl.clone());
        }
        drop(state);

        metrics::counter!("palisade_acl_loads_total", "source" => "database").increment(constructed);
        tracing::debug!(acls = pass_acls.len(), "hydrated ACL batch");

        let mut result = HashMap::new();
        for oid in batch {
            if let Some(acl) = by_oid.get(oid) {
                if let Some(cache) = &self.cache {
                    if let Some(snapshot) = acl.to_snapshot() {
                        cache.put(snapshot);
                    }
                }
                result.insert(oid.clone(), acl.clone());
            }
        }
        Ok(result)
    }

    /// Fold a cached snapshot back into the identity maps: in-memory parents
    /// win over cached ones, and entries intern by id so a cache hit never
    /// duplicates an instance this provider already holds.
    fn adopt_snapshot(&self, snapshot: AclSnapshot) -> Acl {
        let mut state = self.state.lock();
        self.adopt_snapshot_locked(&mut state, snapshot)
    }

    fn adopt_snapshot_locked(&self, state: &mut ProviderState, snapshot: AclSnapshot) -> Acl {
        if let Some(existing) = state.loaded_acls.get(&snapshot.object_identity) {
            return existing.clone();
        }
        let parent = snapshot
            .parent
            .map(|parent| self.adopt_snapshot_locked(state, *parent));
        let acl = Acl::new(
            snapshot.id,
            snapshot.object_identity.clone(),
            snapshot.entries_inheriting,
            self.strategy.clone(),
        );
        let class_aces = intern_snapshot_entries(state, &acl, snapshot.class_aces);
        let class_field_aces = snapshot
            .class_field_aces
            .into_iter()
            .map(|(field, aces)| (field, intern_snapshot_entries(state, &acl, aces)))
            .collect();
        let object_aces = intern_snapshot_entries(state, &acl, snapshot.object_aces);
        let object_field_aces = snapshot
            .object_field_aces
            .into_iter()
            .map(|(field, aces)| (field, intern_snapshot_entries(state, &acl, aces)))
            .collect();
        acl.install_entries(class_aces, class_field_aces, object_aces, object_field_aces);
        acl.set_loaded_sids(snapshot.loaded_sids);
        acl.set_parent_internal(parent);
        state
            .loaded_acls
            .insert(snapshot.object_identity, acl.clone());
        acl
    }
}

#[async_trait]
impl AclProvider for PostgresAclProvider {
    async fn find_acl(&self, oid: &ObjectIdentity, sids: &[SecurityIdentity]) -> AclResult<Acl> {
        let mut acls = self.find_acls(std::slice::from_ref(oid), sids).await?;
        acls.remove(oid)
            .ok_or_else(|| AclError::AclNotFound(oid.clone()))
    }

    async fn find_acls(
        &self,
        oids: &[ObjectIdentity],
        sids: &[SecurityIdentity],
    ) -> AclResult<HashMap<ObjectIdentity, Acl>> {
        let mut result: HashMap<ObjectIdentity, Acl> = HashMap::new();
        let mut batch: Vec<ObjectIdentity> = Vec::new();

        for (i, oid) in oids.iter().enumerate() {
            if !result.contains_key(oid) && !batch.contains(oid) {
                let loaded = { self.state.lock().loaded_acls.get(oid).cloned() };
                if let Some(acl) = loaded {
                    if !acl.is_sid_loaded(sids) {
                        return Err(AclError::NotImplemented(format!(
                            "ACL for {oid} is loaded without the requested security \
                             identities; partial reloads are not supported"
                        )));
                    }
                    result.insert(oid.clone(), acl);
                } else {
                    let mut enqueue = true;
                    if let Some(cache) = &self.cache {
                        if let Some(snapshot) = cache.get_by_identity(oid) {
                            if snapshot.covers_sids(sids) {
                                metrics::counter!("palisade_acl_cache_total", "result" => "hit")
                                    .increment(1);
                                let acl = self.adopt_snapshot(snapshot);
                                result.insert(oid.clone(), acl);
                                enqueue = false;
                            } else {
                                // The cached subtree is unusable for this
                                // request; drop it and its descendants.
                                metrics::counter!("palisade_acl_cache_total", "result" => "evicted")
                                    .increment(1);
                                cache.evict_by_identity(oid);
                                for child in self.find_children(oid, false).await? {
                                    cache.evict_by_identity(&child);
                                }
                            }
                        } else {
                            metrics::counter!("palisade_acl_cache_total", "result" => "miss")
                                .increment(1);
                        }
                    }
                    if enqueue {
                        batch.push(oid.clone());
                    }
                }
            }

            let flush = !batch.is_empty()
                && (batch.len() >= self.options.max_batch_size || i + 1 == oids.len());
            if flush {
                match self.load_batch(&batch).await {
                    Ok(loaded) => result.extend(loaded),
                    // Reported per call after all inputs are processed.
                    Err(AclError::AclNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                batch.clear();
            }
        }

        let mut missing: Vec<ObjectIdentity> = Vec::new();
        for oid in oids {
            if !result.contains_key(oid) && !missing.contains(oid) {
                missing.push(oid.clone());
            }
        }
        if !missing.is_empty() {
            if oids.len() == 1 {
                return Err(AclError::AclNotFound(oids[0].clone()));
            }
            return Err(AclError::NotAllAclsFound {
                partial: result,
                missing,
            });
        }
        Ok(result)
    }

    async fn find_children(
        &self,
        oid: &ObjectIdentity,
        direct_only: bool,
    ) -> AclResult<Vec<ObjectIdentity>> {
        let Some(pk) = self.object_identity_pk(&self.pool, oid).await? else {
            return Ok(Vec::new());
        };
        let sql = if direct_only {
            format!(
                "SELECT o.object_identifier, c.class_type FROM {oid_table} o \
                 INNER JOIN {class_table} c ON c.id = o.class_id \
                 WHERE o.parent_object_identity_id = $1",
                oid_table = self.options.oid_table_name,
                class_table = self.options.class_table_name,
            )
        } else {
            format!(
                "SELECT o.object_identifier, c.class_type FROM {oid_table} o \
                 INNER JOIN {class_table} c ON c.id = o.class_id \
                 INNER JOIN {anc_table} a ON a.object_identity_id = o.id \
                 WHERE a.ancestor_id = $1 AND a.object_identity_id != a.ancestor_id",
                oid_table = self.options.oid_table_name,
                class_table = self.options.class_table_name,
                anc_table = self.options.oid_ancestors_table_name,
            )
        };
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .bind(pk)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;
        Ok(rows
            .into_iter()
            .map(|(identifier, class_type)| {
                ObjectIdentity::new(Self::normalize_class_type(&class_type), identifier)
            })
            .collect())
    }
}

fn intern_snapshot_entries(
    state: &mut ProviderState,
    acl: &Acl,
    snapshots: Vec<EntrySnapshot>,
) -> Vec<Entry> {
    snapshots
        .into_iter()
        .map(|snapshot| {
            if let Some(existing) = state.loaded_aces.get(&snapshot.id) {
                existing.clone()
            } else {
                let id = snapshot.id;
                let entry = Entry::from_snapshot(snapshot, acl.changes_weak());
                state.loaded_aces.insert(id, entry.clone());
                entry
            }
        })
        .collect()
}

fn require<T>(value: Option<T>, what: &str) -> AclResult<T> {
    value.ok_or_else(|| AclError::IntegrityViolation(format!("entry row missing {what}")))
}

fn sort_bucket(mut bucket: Vec<(i32, Entry)>) -> Vec<Entry> {
    bucket.sort_by_key(|(order, _)| *order);
    bucket.into_iter().map(|(_, entry)| entry).collect()
}

fn sort_field_bucket(bucket: HashMap<String, Vec<(i32, Entry)>>) -> HashMap<String, Vec<Entry>> {
    bucket
        .into_iter()
        .map(|(field, aces)| (field, sort_bucket(aces)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_type_normalization_strips_doubled_backslashes() {
        assert_eq!(
            PostgresAclProvider::normalize_class_type("App\\\\Entity\\\\BlogPost"),
            "App\\Entity\\BlogPost"
        );
        assert_eq!(
            PostgresAclProvider::normalize_class_type("App\\Entity\\BlogPost"),
            "App\\Entity\\BlogPost"
        );
    }

    #[test]
    fn sort_bucket_orders_ascending() {
        use crate::model::AclChangeSet;
        use parking_lot::Mutex;
        use std::sync::Arc;

        let log = Arc::new(Mutex::new(AclChangeSet::default()));
        let entry = |id: i64, mask: i32| {
            Entry::hydrated(
                id,
                SecurityIdentity::role("ROLE_USER"),
                mask,
                true,
                GrantingStrategy::All,
                false,
                false,
                None,
                Arc::downgrade(&log),
            )
        };
        let sorted = sort_bucket(vec![(2, entry(1, 4)), (0, entry(2, 1)), (1, entry(3, 2))]);
        let masks: Vec<i32> = sorted.iter().map(Entry::mask).collect();
        assert_eq!(masks, vec![1, 2, 4]);
    }
}
