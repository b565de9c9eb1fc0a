//! ACL domain model.
//!
//! # Purpose
//! Re-exports the object/security identity types, ACE and ACL containers,
//! and the detached snapshot shapes consumed by caches.
mod acl;
mod changes;
mod entry;
mod oid;
mod sid;
mod snapshot;

pub use acl::Acl;
pub use entry::{Entry, GrantingStrategy};
pub use oid::ObjectIdentity;
pub use sid::SecurityIdentity;
pub use snapshot::{AclSnapshot, EntrySnapshot};

pub(crate) use changes::{AclChangeSet, entries_eq, field_map_eq};
