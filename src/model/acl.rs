use crate::error::{AclError, AclResult};
use crate::model::changes::{AclChangeSet, FieldAceMap, SharedChangeSet};
use crate::model::entry::{Entry, GrantingStrategy};
use crate::model::oid::ObjectIdentity;
use crate::model::sid::SecurityIdentity;
use crate::model::snapshot::{AclSnapshot, EntrySnapshot};
use crate::strategy::PermissionGrantingStrategy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Selector for the two flat ACE lists.
#[derive(Debug, Clone, Copy)]
enum FlatList {
    Class,
    Object,
}

/// Selector for the two field-keyed ACE lists.
#[derive(Debug, Clone, Copy)]
enum FieldList {
    ClassField,
    ObjectField,
}

struct AclState {
    id: i64,
    oid: ObjectIdentity,
    entries_inheriting: bool,
    parent: Option<Acl>,
    class_aces: Vec<Entry>,
    class_field_aces: FieldAceMap,
    object_aces: Vec<Entry>,
    object_field_aces: FieldAceMap,
    loaded_sids: Option<Vec<SecurityIdentity>>,
    strategy: Arc<dyn PermissionGrantingStrategy>,
}

impl AclState {
    fn flat_list(&self, list: FlatList) -> &Vec<Entry> {
        match list {
            FlatList::Class => &self.class_aces,
            FlatList::Object => &self.object_aces,
        }
    }

    fn flat_list_mut(&mut self, list: FlatList) -> &mut Vec<Entry> {
        match list {
            FlatList::Class => &mut self.class_aces,
            FlatList::Object => &mut self.object_aces,
        }
    }

    fn field_map(&self, list: FieldList) -> &FieldAceMap {
        match list {
            FieldList::ClassField => &self.class_field_aces,
            FieldList::ObjectField => &self.object_field_aces,
        }
    }

    fn field_map_mut(&mut self, list: FieldList) -> &mut FieldAceMap {
        match list {
            FieldList::ClassField => &mut self.class_field_aces,
            FieldList::ObjectField => &mut self.object_field_aces,
        }
    }
}

/// Access control list of one object identity.
///
/// Shared handle: the provider's identity map, result maps, and child ACLs'
/// parent links all alias one instance per ACL id. Class-scope lists apply
/// to every object of the identity's type; the provider synchronizes them
/// across in-memory siblings when they are persisted.
///
/// All mutations go through the setters here (or on [`Entry`]), which record
/// property changes for `update_acl`. Reads return the current ordered
/// sequences as cloned handles.
#[derive(Clone)]
pub struct Acl {
    inner: Arc<RwLock<AclState>>,
    changes: SharedChangeSet,
}

impl Acl {
    pub(crate) fn new(
        id: i64,
        oid: ObjectIdentity,
        entries_inheriting: bool,
        strategy: Arc<dyn PermissionGrantingStrategy>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(AclState {
                id,
                oid,
                entries_inheriting,
                parent: None,
                class_aces: Vec::new(),
                class_field_aces: HashMap::new(),
                object_aces: Vec::new(),
                object_field_aces: HashMap::new(),
                loaded_sids: None,
                strategy,
            })),
            changes: Arc::new(Mutex::new(AclChangeSet::default())),
        }
    }

    pub fn id(&self) -> i64 {
        self.inner.read().id
    }

    pub fn object_identity(&self) -> ObjectIdentity {
        self.inner.read().oid.clone()
    }

    pub fn is_entries_inheriting(&self) -> bool {
        self.inner.read().entries_inheriting
    }

    pub fn parent_acl(&self) -> Option<Acl> {
        self.inner.read().parent.clone()
    }

    pub fn class_aces(&self) -> Vec<Entry> {
        self.inner.read().class_aces.clone()
    }

    pub fn object_aces(&self) -> Vec<Entry> {
        self.inner.read().object_aces.clone()
    }

    pub fn class_field_aces(&self, field: &str) -> Vec<Entry> {
        self.inner
            .read()
            .class_field_aces
            .get(field)
            .cloned()
            .unwrap_or_default()
    }

    pub fn object_field_aces(&self, field: &str) -> Vec<Entry> {
        self.inner
            .read()
            .object_field_aces
            .get(field)
            .cloned()
            .unwrap_or_default()
    }

    /// True when every requested security identity was loaded into this
    /// instance. The default provider always loads all identities, so this
    /// only returns false for instances restored from a partial snapshot.
    pub fn is_sid_loaded(&self, sids: &[SecurityIdentity]) -> bool {
        match &self.inner.read().loaded_sids {
            None => true,
            Some(loaded) => sids.iter().all(|sid| loaded.contains(sid)),
        }
    }

    /// Instance identity: true when both handles point at the same ACL.
    pub fn ptr_eq(&self, other: &Acl) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------
    // Permission checks (delegated to the configured strategy)
    // ------------------------------------------------------------------

    pub fn is_granted(
        &self,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative: bool,
    ) -> AclResult<bool> {
        let strategy = self.inner.read().strategy.clone();
        strategy.is_granted(self, masks, sids, administrative)
    }

    pub fn is_field_granted(
        &self,
        field: &str,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative: bool,
    ) -> AclResult<bool> {
        let strategy = self.inner.read().strategy.clone();
        strategy.is_field_granted(self, field, masks, sids, administrative)
    }

    // ------------------------------------------------------------------
    // Mutation surface
    // ------------------------------------------------------------------

    pub fn set_entries_inheriting(&self, value: bool) {
        let old = {
            let mut state = self.inner.write();
            if state.entries_inheriting == value {
                return;
            }
            let old = state.entries_inheriting;
            state.entries_inheriting = value;
            old
        };
        self.changes.lock().record_entries_inheriting(old, value);
    }

    pub fn set_parent_acl(&self, parent: Option<Acl>) {
        let old = {
            let mut state = self.inner.write();
            let old = state.parent.clone();
            state.parent = parent.clone();
            old
        };
        self.changes.lock().record_parent(old, parent);
    }

    pub fn insert_class_ace(
        &self,
        index: usize,
        sid: SecurityIdentity,
        mask: i32,
        granting: bool,
        strategy: GrantingStrategy,
    ) -> AclResult<()> {
        self.insert_ace(FlatList::Class, index, sid, mask, granting, strategy)
    }

    pub fn insert_object_ace(
        &self,
        index: usize,
        sid: SecurityIdentity,
        mask: i32,
        granting: bool,
        strategy: GrantingStrategy,
    ) -> AclResult<()> {
        self.insert_ace(FlatList::Object, index, sid, mask, granting, strategy)
    }

    pub fn insert_class_field_ace(
        &self,
        index: usize,
        field: &str,
        sid: SecurityIdentity,
        mask: i32,
        granting: bool,
        strategy: GrantingStrategy,
    ) -> AclResult<()> {
        self.insert_field_ace(FieldList::ClassField, index, field, sid, mask, granting, strategy)
    }

    pub fn insert_object_field_ace(
        &self,
        index: usize,
        field: &str,
        sid: SecurityIdentity,
        mask: i32,
        granting: bool,
        strategy: GrantingStrategy,
    ) -> AclResult<()> {
        self.insert_field_ace(FieldList::ObjectField, index, field, sid, mask, granting, strategy)
    }

    pub fn update_class_ace(
        &self,
        index: usize,
        mask: i32,
        strategy: Option<GrantingStrategy>,
    ) -> AclResult<()> {
        self.update_ace(FlatList::Class, index, mask, strategy)
    }

    pub fn update_object_ace(
        &self,
        index: usize,
        mask: i32,
        strategy: Option<GrantingStrategy>,
    ) -> AclResult<()> {
        self.update_ace(FlatList::Object, index, mask, strategy)
    }

    pub fn update_class_field_ace(
        &self,
        index: usize,
        field: &str,
        mask: i32,
        strategy: Option<GrantingStrategy>,
    ) -> AclResult<()> {
        self.update_field_ace(FieldList::ClassField, index, field, mask, strategy)
    }

    pub fn update_object_field_ace(
        &self,
        index: usize,
        field: &str,
        mask: i32,
        strategy: Option<GrantingStrategy>,
    ) -> AclResult<()> {
        self.update_field_ace(FieldList::ObjectField, index, field, mask, strategy)
    }

    pub fn update_class_auditing(
        &self,
        index: usize,
        success: bool,
        failure: bool,
    ) -> AclResult<()> {
        Ok(self
            .flat_entry_at(FlatList::Class, index)?
            .set_auditing(success, failure))
    }

    pub fn update_object_auditing(
        &self,
        index: usize,
        success: bool,
        failure: bool,
    ) -> AclResult<()> {
        Ok(self
            .flat_entry_at(FlatList::Object, index)?
            .set_auditing(success, failure))
    }

    pub fn update_class_field_auditing(
        &self,
        index: usize,
        field: &str,
        success: bool,
        failure: bool,
    ) -> AclResult<()> {
        Ok(self
            .field_entry_at(FieldList::ClassField, index, field)?
            .set_auditing(success, failure))
    }

    pub fn update_object_field_auditing(
        &self,
        index: usize,
        field: &str,
        success: bool,
        failure: bool,
    ) -> AclResult<()> {
        Ok(self
            .field_entry_at(FieldList::ObjectField, index, field)?
            .set_auditing(success, failure))
    }

    pub fn delete_class_ace(&self, index: usize) -> AclResult<()> {
        self.delete_ace(FlatList::Class, index)
    }

    pub fn delete_object_ace(&self, index: usize) -> AclResult<()> {
        self.delete_ace(FlatList::Object, index)
    }

    pub fn delete_class_field_ace(&self, index: usize, field: &str) -> AclResult<()> {
        self.delete_field_ace(FieldList::ClassField, index, field)
    }

    pub fn delete_object_field_ace(&self, index: usize, field: &str) -> AclResult<()> {
        self.delete_field_ace(FieldList::ObjectField, index, field)
    }

    // ------------------------------------------------------------------
    // List helpers
    // ------------------------------------------------------------------

    fn insert_ace(
        &self,
        list: FlatList,
        index: usize,
        sid: SecurityIdentity,
        mask: i32,
        granting: bool,
        strategy: GrantingStrategy,
    ) -> AclResult<()> {
        let entry = Entry::new_local(
            sid,
            mask,
            granting,
            strategy,
            None,
            Arc::downgrade(&self.changes),
        );
        let (old, new) = {
            let mut state = self.inner.write();
            let aces = state.flat_list_mut(list);
            if index > aces.len() {
                return Err(out_of_range(index, aces.len()));
            }
            let old = aces.clone();
            aces.insert(index, entry);
            (old, aces.clone())
        };
        let mut changes = self.changes.lock();
        match list {
            FlatList::Class => changes.record_class_aces(old, new),
            FlatList::Object => changes.record_object_aces(old, new),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_field_ace(
        &self,
        list: FieldList,
        index: usize,
        field: &str,
        sid: SecurityIdentity,
        mask: i32,
        granting: bool,
        strategy: GrantingStrategy,
    ) -> AclResult<()> {
        let entry = Entry::new_local(
            sid,
            mask,
            granting,
            strategy,
            Some(field.to_string()),
            Arc::downgrade(&self.changes),
        );
        let (old, new) = {
            let mut state = self.inner.write();
            let map = state.field_map_mut(list);
            let len = map.get(field).map_or(0, Vec::len);
            if index > len {
                return Err(out_of_range(index, len));
            }
            let old = map.clone();
            map.entry(field.to_string()).or_default().insert(index, entry);
            (old, map.clone())
        };
        let mut changes = self.changes.lock();
        match list {
            FieldList::ClassField => changes.record_class_field_aces(old, new),
            FieldList::ObjectField => changes.record_object_field_aces(old, new),
        }
        Ok(())
    }

    fn update_ace(
        &self,
        list: FlatList,
        index: usize,
        mask: i32,
        strategy: Option<GrantingStrategy>,
    ) -> AclResult<()> {
        let entry = self.flat_entry_at(list, index)?;
        entry.set_mask(mask);
        if let Some(strategy) = strategy {
            entry.set_strategy(strategy);
        }
        Ok(())
    }

    fn update_field_ace(
        &self,
        list: FieldList,
        index: usize,
        field: &str,
        mask: i32,
        strategy: Option<GrantingStrategy>,
    ) -> AclResult<()> {
        let entry = self.field_entry_at(list, index, field)?;
        entry.set_mask(mask);
        if let Some(strategy) = strategy {
            entry.set_strategy(strategy);
        }
        Ok(())
    }

    fn delete_ace(&self, list: FlatList, index: usize) -> AclResult<()> {
        let (old, new) = {
            let mut state = self.inner.write();
            let aces = state.flat_list_mut(list);
            if index >= aces.len() {
                return Err(out_of_range(index, aces.len()));
            }
            let old = aces.clone();
            aces.remove(index);
            (old, aces.clone())
        };
        let mut changes = self.changes.lock();
        match list {
            FlatList::Class => changes.record_class_aces(old, new),
            FlatList::Object => changes.record_object_aces(old, new),
        }
        Ok(())
    }

    fn delete_field_ace(&self, list: FieldList, index: usize, field: &str) -> AclResult<()> {
        let (old, new) = {
            let mut state = self.inner.write();
            let map = state.field_map_mut(list);
            let len = map.get(field).map_or(0, Vec::len);
            if index >= len {
                return Err(out_of_range(index, len));
            }
            let old = map.clone();
            let aces = map.get_mut(field).expect("field list present");
            aces.remove(index);
            if aces.is_empty() {
                map.remove(field);
            }
            (old, map.clone())
        };
        let mut changes = self.changes.lock();
        match list {
            FieldList::ClassField => changes.record_class_field_aces(old, new),
            FieldList::ObjectField => changes.record_object_field_aces(old, new),
        }
        Ok(())
    }

    fn flat_entry_at(&self, list: FlatList, index: usize) -> AclResult<Entry> {
        let state = self.inner.read();
        let aces = state.flat_list(list);
        aces.get(index)
            .cloned()
            .ok_or_else(|| out_of_range(index, aces.len()))
    }

    fn field_entry_at(&self, list: FieldList, index: usize, field: &str) -> AclResult<Entry> {
        let state = self.inner.read();
        let aces = state.field_map(list).get(field);
        aces.and_then(|aces| aces.get(index))
            .cloned()
            .ok_or_else(|| out_of_range(index, aces.map_or(0, Vec::len)))
    }

    // ------------------------------------------------------------------
    // Hydrator surface (crate-internal, never emits change records)
    // ------------------------------------------------------------------

    pub(crate) fn install_entries(
        &self,
        class_aces: Vec<Entry>,
        class_field_aces: FieldAceMap,
        object_aces: Vec<Entry>,
        object_field_aces: FieldAceMap,
    ) {
        let mut state = self.inner.write();
        state.class_aces = class_aces;
        state.class_field_aces = class_field_aces;
        state.object_aces = object_aces;
        state.object_field_aces = object_field_aces;
        // A full hydration covers every security identity.
        state.loaded_sids = None;
    }

    pub(crate) fn set_parent_internal(&self, parent: Option<Acl>) {
        self.inner.write().parent = parent;
    }

    pub(crate) fn set_loaded_sids(&self, sids: Option<Vec<SecurityIdentity>>) {
        self.inner.write().loaded_sids = sids;
    }

    pub(crate) fn changes_weak(&self) -> Weak<Mutex<AclChangeSet>> {
        Arc::downgrade(&self.changes)
    }

    pub(crate) fn change_set(&self) -> AclChangeSet {
        self.changes.lock().clone()
    }

    pub(crate) fn clear_changes(&self) {
        *self.changes.lock() = AclChangeSet::default();
    }

    pub(crate) fn replace_class_aces_silent(&self, aces: Vec<Entry>) {
        self.inner.write().class_aces = aces;
    }

    pub(crate) fn replace_class_field_aces_silent(&self, aces: FieldAceMap) {
        self.inner.write().class_field_aces = aces;
    }

    pub(crate) fn class_field_ace_map(&self) -> FieldAceMap {
        self.inner.read().class_field_aces.clone()
    }

    /// Detached copy for the external cache, carrying the parent chain.
    /// `None` when any entry is still unpersisted.
    pub(crate) fn to_snapshot(&self) -> Option<AclSnapshot> {
        let state = self.inner.read();
        let parent = match &state.parent {
            None => None,
            Some(parent) => Some(Box::new(parent.to_snapshot()?)),
        };
        Some(AclSnapshot {
            id: state.id,
            object_identity: state.oid.clone(),
            entries_inheriting: state.entries_inheriting,
            parent,
            class_aces: snapshot_list(&state.class_aces)?,
            class_field_aces: snapshot_map(&state.class_field_aces)?,
            object_aces: snapshot_list(&state.object_aces)?,
            object_field_aces: snapshot_map(&state.object_field_aces)?,
            loaded_sids: state.loaded_sids.clone(),
        })
    }
}

impl std::fmt::Debug for Acl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_read() {
            Some(state) => f
                .debug_struct("Acl")
                .field("id", &state.id)
                .field("object_identity", &state.oid)
                .field("entries_inheriting", &state.entries_inheriting)
                .finish_non_exhaustive(),
            None => f.write_str("Acl { .. }"),
        }
    }
}

fn out_of_range(index: usize, len: usize) -> AclError {
    AclError::InvalidArgument(format!(
        "index {index} out of range for ACE list of length {len}"
    ))
}

fn snapshot_list(aces: &[Entry]) -> Option<Vec<EntrySnapshot>> {
    aces.iter().map(Entry::snapshot).collect()
}

fn snapshot_map(map: &FieldAceMap) -> Option<HashMap<String, Vec<EntrySnapshot>>> {
    map.iter()
        .map(|(field, aces)| Some((field.clone(), snapshot_list(aces)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::MaskGrantingStrategy;

    fn test_acl() -> Acl {
        Acl::new(
            1,
            ObjectIdentity::new("BlogPost", "42"),
            true,
            Arc::new(MaskGrantingStrategy::default()),
        )
    }

    fn role() -> SecurityIdentity {
        SecurityIdentity::role("ROLE_USER")
    }

    #[test]
    fn insert_shifts_subsequent_entries() {
        let acl = test_acl();
        acl.insert_object_ace(0, role(), 1, true, GrantingStrategy::All)
            .expect("insert");
        acl.insert_object_ace(0, role(), 2, false, GrantingStrategy::All)
            .expect("insert front");
        let aces = acl.object_aces();
        assert_eq!(aces.len(), 2);
        assert_eq!(aces[0].mask(), 2);
        assert_eq!(aces[1].mask(), 1);
    }

    #[test]
    fn insert_rejects_out_of_range_index() {
        let acl = test_acl();
        let err = acl
            .insert_object_ace(1, role(), 1, true, GrantingStrategy::All)
            .expect_err("out of range");
        assert!(matches!(err, AclError::InvalidArgument(_)));
    }

    #[test]
    fn delete_rejects_out_of_range_index() {
        let acl = test_acl();
        assert!(matches!(
            acl.delete_class_ace(0),
            Err(AclError::InvalidArgument(_))
        ));
    }

    #[test]
    fn field_entries_live_in_field_lists_only() {
        let acl = test_acl();
        acl.insert_object_field_ace(0, "title", role(), 1, true, GrantingStrategy::All)
            .expect("insert field ace");
        assert!(acl.object_aces().is_empty());
        let field_aces = acl.object_field_aces("title");
        assert_eq!(field_aces.len(), 1);
        assert_eq!(field_aces[0].field().as_deref(), Some("title"));
    }

    #[test]
    fn insert_then_delete_leaves_no_change_record() {
        let acl = test_acl();
        acl.insert_object_ace(0, role(), 1, true, GrantingStrategy::All)
            .expect("insert");
        assert!(!acl.change_set().is_empty());
        acl.delete_object_ace(0).expect("delete");
        assert!(acl.change_set().is_empty());
    }

    #[test]
    fn entries_inheriting_revert_drops_record() {
        let acl = test_acl();
        acl.set_entries_inheriting(false);
        assert_eq!(
            acl.change_set().entries_inheriting,
            Some((true, false))
        );
        acl.set_entries_inheriting(true);
        assert!(acl.change_set().is_empty());
    }

    #[test]
    fn parent_change_is_recorded() {
        let acl = test_acl();
        let parent = Acl::new(
            2,
            ObjectIdentity::new("BlogPost", "root"),
            true,
            Arc::new(MaskGrantingStrategy::default()),
        );
        acl.set_parent_acl(Some(parent.clone()));
        let changes = acl.change_set();
        let (old, new) = changes.parent.expect("parent change");
        assert!(old.is_none());
        assert!(new.expect("new parent").ptr_eq(&parent));
        assert!(acl.parent_acl().expect("parent").ptr_eq(&parent));
    }

    #[test]
    fn snapshot_round_trips_structure() {
        let acl = test_acl();
        acl.insert_object_ace(0, role(), 1, true, GrantingStrategy::All)
            .expect("insert");
        // Unpersisted entries cannot be detached into the cache.
        assert!(acl.to_snapshot().is_none());
        acl.object_aces()[0].assign_id(10);
        let snapshot = acl.to_snapshot().expect("snapshot");
        assert_eq!(snapshot.id, 1);
        assert_eq!(snapshot.object_aces.len(), 1);
        assert_eq!(snapshot.object_aces[0].id, 10);
        assert!(snapshot.covers_sids(&[role()]));
    }
}
