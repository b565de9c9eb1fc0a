//! Detached, serializable ACL state for external caches.
//!
//! The provider never hands live instances to a cache: a snapshot is plain
//! data carrying the full parent chain inline, and cache hits are folded
//! back into the provider's identity maps entry by entry.

use crate::model::entry::GrantingStrategy;
use crate::model::oid::ObjectIdentity;
use crate::model::sid::SecurityIdentity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub id: i64,
    pub sid: SecurityIdentity,
    pub mask: i32,
    pub granting: bool,
    pub strategy: GrantingStrategy,
    pub audit_success: bool,
    pub audit_failure: bool,
    pub field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclSnapshot {
    pub id: i64,
    pub object_identity: ObjectIdentity,
    pub entries_inheriting: bool,
    pub parent: Option<Box<AclSnapshot>>,
    pub class_aces: Vec<EntrySnapshot>,
    pub class_field_aces: HashMap<String, Vec<EntrySnapshot>>,
    pub object_aces: Vec<EntrySnapshot>,
    pub object_field_aces: HashMap<String, Vec<EntrySnapshot>>,
    /// `None` means every security identity was loaded; a list restricts the
    /// snapshot to those identities.
    pub loaded_sids: Option<Vec<SecurityIdentity>>,
}

impl AclSnapshot {
    /// True when the snapshot covers every requested security identity.
    pub fn covers_sids(&self, sids: &[SecurityIdentity]) -> bool {
        match &self.loaded_sids {
            None => true,
            Some(loaded) => sids.iter().all(|sid| loaded.contains(sid)),
        }
    }
}
