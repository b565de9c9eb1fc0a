//! Postgres-backed ACL provider.
//!
//! # What this module is
//! This module persists and hydrates ACL trees using Postgres (via `sqlx`).
//! The read path batches many object identities into one ancestor-closure
//! query plus one hydration query, interns every ACL and ACE by storage id
//! so overlapping loads share instances, and coordinates with an optional
//! [`AclCache`]. The write path persists creation, deletion and incremental
//! mutation transactionally while keeping the denormalized ancestor table
//! consistent.
//!
//! # What this module is NOT
//! It is not a policy engine: decisions happen in [`crate::strategy`] against
//! hydrated ACLs. It also is not a credential store; security identities are
//! opaque `(identifier, username_flag)` pairs.
//!
//! # Consistency / atomicity
//! `create_acl`, `delete_acl` and `update_acl` each run in exactly one
//! transaction; a failure rolls back every database side effect. In-memory
//! mutations (identity-map updates, class-scope sibling synchronization,
//! cache eviction) happen only after commit, so a failed `update_acl` leaves
//! the change log intact and the caller may retry.
//!
//! # Concurrency
//! A provider instance is single-owner: its identity maps sit behind a mutex
//! that is never held across an `.await`. Multiple providers against one
//! database coordinate only through SQL transactions; divergence of shared
//! class-scope state is detected optimistically and surfaces as
//! `concurrent-modification`.

use crate::cache::AclCache;
use crate::config::{AclProviderOptions, PostgresConfig};
use crate::error::{AclError, AclResult};
use crate::model::{Acl, Entry, ObjectIdentity, SecurityIdentity};
use crate::strategy::PermissionGrantingStrategy;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

mod mutable;
mod provider;

/// Read side of the provider.
#[async_trait]
pub trait AclProvider: Send + Sync {
    /// Resolve one ACL. `sids` is advisory: the default provider always
    /// loads every security identity, but an identity-map hit that lacks a
    /// requested one fails with `not-implemented`.
    async fn find_acl(&self, oid: &ObjectIdentity, sids: &[SecurityIdentity]) -> AclResult<Acl>;

    /// Batched resolution. Missing identities fail the call: `acl-not-found`
    /// for a single-identity request, `not-all-acls-found` (carrying the
    /// partial result) otherwise.
    async fn find_acls(
        &self,
        oids: &[ObjectIdentity],
        sids: &[SecurityIdentity],
    ) -> AclResult<HashMap<ObjectIdentity, Acl>>;

    /// Children of an object identity; direct only or the full subtree.
    async fn find_children(
        &self,
        oid: &ObjectIdentity,
        direct_only: bool,
    ) -> AclResult<Vec<ObjectIdentity>>;
}

/// Write side of the provider.
#[async_trait]
pub trait MutableAclProvider: AclProvider {
    async fn create_acl(&self, oid: &ObjectIdentity) -> AclResult<Acl>;

    /// Deletes the ACL and, recursively, the ACLs of all direct children.
    async fn delete_acl(&self, oid: &ObjectIdentity) -> AclResult<()>;

    /// Persist the accumulated changes of an ACL previously returned by this
    /// provider. A no-op when nothing changed.
    async fn update_acl(&self, acl: &Acl) -> AclResult<()>;

    /// Remove a security identity; its entries cascade away.
    async fn delete_security_identity(&self, sid: &SecurityIdentity) -> AclResult<()>;

    /// Rename a user identity. Equal old and new usernames are rejected.
    async fn update_user_security_identity(
        &self,
        sid: &SecurityIdentity,
        old_username: &str,
    ) -> AclResult<()>;
}

pub(crate) struct ProviderState {
    /// Identity map: one instance per ACL within this provider.
    pub loaded_acls: HashMap<ObjectIdentity, Acl>,
    /// One instance per persisted ACE within this provider.
    pub loaded_aces: HashMap<i64, Entry>,
}

/// Durable ACL provider backed by Postgres.
pub struct PostgresAclProvider {
    pool: PgPool,
    options: AclProviderOptions,
    strategy: Arc<dyn PermissionGrantingStrategy>,
    cache: Option<Arc<dyn AclCache>>,
    state: Mutex<ProviderState>,
}

impl PostgresAclProvider {
    /// Connect to Postgres, run migrations, and build the provider.
    ///
    /// Pool timeouts are explicit so an unhealthy database fails fast
    /// instead of hanging callers.
    pub async fn connect(
        pg: &PostgresConfig,
        options: AclProviderOptions,
        strategy: Arc<dyn PermissionGrantingStrategy>,
        cache: Option<Arc<dyn AclCache>>,
    ) -> AclResult<Self> {
        let connect_options =
            PgConnectOptions::from_str(&pg.url).map_err(|e| AclError::Unexpected(e.into()))?;
        let pool = PgPoolOptions::new()
            .max_connections(pg.max_connections)
            .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
            .connect_with(connect_options)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AclError::Unexpected(e.into()))?;

        Ok(Self::new(pool, options, strategy, cache))
    }

    /// Build a provider over an existing pool without touching the schema.
    pub fn new(
        pool: PgPool,
        options: AclProviderOptions,
        strategy: Arc<dyn PermissionGrantingStrategy>,
        cache: Option<Arc<dyn AclCache>>,
    ) -> Self {
        Self {
            pool,
            options,
            strategy,
            cache,
            state: Mutex::new(ProviderState {
                loaded_acls: HashMap::new(),
                loaded_aces: HashMap::new(),
            }),
        }
    }

    pub fn options(&self) -> &AclProviderOptions {
        &self.options
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_detects_only_db_codes() {
        let err = sqlx::Error::RowNotFound;
        assert!(!is_unique_violation(&err));
    }
}
