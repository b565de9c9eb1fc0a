//! ACL subsystem: authorization decisions over domain objects, persisted in
//! Postgres.
//!
//! # Purpose
//! Answers "may security identity S perform the action encoded in a
//! permission mask on object O (optionally restricted to field F)?". Two
//! engines cooperate: the provider hydrates and mutates ACL trees from a
//! relational schema in batches, and the granting strategy evaluates masks
//! against ordered entry lists, walking the parent chain when inheritance is
//! enabled.
//!
//! # Notes
//! Module boundaries mirror the two engines: `model` and `strategy` are the
//! in-memory decision side, `store` the persistence side, with `cache`,
//! `audit`, `config` and `error` shared between them.
//!
//! # Example
//! ```rust,no_run
//! use palisade::{
//!     AclProviderOptions, GrantingStrategy, MaskGrantingStrategy, MutableAclProvider,
//!     ObjectIdentity, PostgresAclProvider, PostgresConfig, SecurityIdentity,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> palisade::AclResult<()> {
//! let provider = PostgresAclProvider::connect(
//!     &PostgresConfig::from_env()?,
//!     AclProviderOptions::default(),
//!     Arc::new(MaskGrantingStrategy::new()),
//!     None,
//! )
//! .await?;
//!
//! let oid = ObjectIdentity::new("BlogPost", "42");
//! let acl = provider.create_acl(&oid).await?;
//! acl.insert_object_ace(
//!     0,
//!     SecurityIdentity::role("ROLE_EDITOR"),
//!     0b0011,
//!     true,
//!     GrantingStrategy::All,
//! )?;
//! provider.update_acl(&acl).await?;
//!
//! let allowed = acl.is_granted(&[0b0001], &[SecurityIdentity::role("ROLE_EDITOR")], false)?;
//! assert!(allowed);
//! # Ok(())
//! # }
//! ```
pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod store;
pub mod strategy;

pub use audit::{AuditLogger, TracingAuditLogger};
pub use cache::{AclCache, InMemoryAclCache};
pub use config::{AclProviderOptions, PostgresConfig};
pub use error::{AclError, AclResult};
pub use model::{
    Acl, AclSnapshot, Entry, EntrySnapshot, GrantingStrategy, ObjectIdentity, SecurityIdentity,
};
pub use store::{AclProvider, MutableAclProvider, PostgresAclProvider};
pub use strategy::{MaskGrantingStrategy, PermissionGrantingStrategy};
