use crate::model::{AclSnapshot, ObjectIdentity};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Cache consumed by the provider: object identity → fully populated ACL
/// snapshot (parent chain included).
///
/// The provider treats any implementation as untrusted; on ambiguity it
/// evicts and falls back to the database.
pub trait AclCache: Send + Sync {
    fn get_by_identity(&self, oid: &ObjectIdentity) -> Option<AclSnapshot>;
    fn put(&self, snapshot: AclSnapshot);
    fn evict_by_identity(&self, oid: &ObjectIdentity);
    fn evict_by_id(&self, acl_id: i64);
    fn clear(&self);
}

#[derive(Default)]
struct CacheState {
    by_oid: HashMap<ObjectIdentity, AclSnapshot>,
    // Secondary index for id-based eviction.
    oid_by_id: HashMap<i64, ObjectIdentity>,
}

/// In-process cache for deployments without an external one.
#[derive(Default)]
pub struct InMemoryAclCache {
    state: Mutex<CacheState>,
}

impl InMemoryAclCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_oid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().by_oid.is_empty()
    }
}

impl AclCache for InMemoryAclCache {
    fn get_by_identity(&self, oid: &ObjectIdentity) -> Option<AclSnapshot> {
        self.state.lock().by_oid.get(oid).cloned()
    }

    fn put(&self, snapshot: AclSnapshot) {
        let mut state = self.state.lock();
        state
            .oid_by_id
            .insert(snapshot.id, snapshot.object_identity.clone());
        state.by_oid.insert(snapshot.object_identity.clone(), snapshot);
    }

    fn evict_by_identity(&self, oid: &ObjectIdentity) {
        let mut state = self.state.lock();
        if let Some(snapshot) = state.by_oid.remove(oid) {
            state.oid_by_id.remove(&snapshot.id);
        }
    }

    fn evict_by_id(&self, acl_id: i64) {
        let mut state = self.state.lock();
        if let Some(oid) = state.oid_by_id.remove(&acl_id) {
            state.by_oid.remove(&oid);
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.by_oid.clear();
        state.oid_by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: i64, identifier: &str) -> AclSnapshot {
        AclSnapshot {
            id,
            object_identity: ObjectIdentity::new("BlogPost", identifier),
            entries_inheriting: true,
            parent: None,
            class_aces: Vec::new(),
            class_field_aces: HashMap::new(),
            object_aces: Vec::new(),
            object_field_aces: HashMap::new(),
            loaded_sids: None,
        }
    }

    #[test]
    fn put_get_round_trip() {
        let cache = InMemoryAclCache::new();
        cache.put(snapshot(1, "42"));
        let hit = cache
            .get_by_identity(&ObjectIdentity::new("BlogPost", "42"))
            .expect("hit");
        assert_eq!(hit.id, 1);
        assert!(cache.get_by_identity(&ObjectIdentity::new("BlogPost", "43")).is_none());
    }

    #[test]
    fn eviction_by_identity_and_id() {
        let cache = InMemoryAclCache::new();
        cache.put(snapshot(1, "42"));
        cache.put(snapshot(2, "43"));

        cache.evict_by_identity(&ObjectIdentity::new("BlogPost", "42"));
        assert!(cache.get_by_identity(&ObjectIdentity::new("BlogPost", "42")).is_none());

        cache.evict_by_id(2);
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let cache = InMemoryAclCache::new();
        cache.put(snapshot(1, "42"));
        cache.put(snapshot(2, "43"));
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn put_replaces_existing_snapshot() {
        let cache = InMemoryAclCache::new();
        cache.put(snapshot(1, "42"));
        let mut updated = snapshot(1, "42");
        updated.entries_inheriting = false;
        cache.put(updated);
        let hit = cache
            .get_by_identity(&ObjectIdentity::new("BlogPost", "42"))
            .expect("hit");
        assert!(!hit.entries_inheriting);
    }
}
