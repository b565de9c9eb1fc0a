//! Change tracking for mutable ACLs.
//!
//! Every ACL carries one [`AclChangeSet`] behind an `Arc<Mutex<..>>`; its own
//! setters and the setters of its entries append explicit change records
//! there. The provider drains the set at `update_acl` time. A record whose
//! new value returns to the originally recorded old value is dropped, so a
//! reverted mutation leaves no trace.
//!
//! List snapshots are compared instance-wise (`Arc` identity per element):
//! within one provider every persisted ACE is interned by id, so two list
//! snapshots are equal exactly when they hold the same entries in the same
//! order.

use crate::model::acl::Acl;
use crate::model::entry::{Entry, GrantingStrategy};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type SharedChangeSet = Arc<Mutex<AclChangeSet>>;

/// Snapshot of a field-keyed ACE map.
pub(crate) type FieldAceMap = HashMap<String, Vec<Entry>>;

/// Accumulated changes for one ACL: scalar properties, the four ACE list
/// snapshots (old, new), and per-entry field changes keyed by storage id.
#[derive(Debug, Default, Clone)]
pub(crate) struct AclChangeSet {
    pub entries_inheriting: Option<(bool, bool)>,
    pub parent: Option<(Option<Acl>, Option<Acl>)>,
    pub class_aces: Option<(Vec<Entry>, Vec<Entry>)>,
    pub class_field_aces: Option<(FieldAceMap, FieldAceMap)>,
    pub object_aces: Option<(Vec<Entry>, Vec<Entry>)>,
    pub object_field_aces: Option<(FieldAceMap, FieldAceMap)>,
    pub aces: HashMap<i64, EntryChangeSet>,
}

/// Field changes of a single persisted ACE.
#[derive(Debug, Default, Clone)]
pub(crate) struct EntryChangeSet {
    pub mask: Option<(i32, i32)>,
    pub strategy: Option<(GrantingStrategy, GrantingStrategy)>,
    pub audit_success: Option<(bool, bool)>,
    pub audit_failure: Option<(bool, bool)>,
}

impl EntryChangeSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.mask.is_none()
            && self.strategy.is_none()
            && self.audit_success.is_none()
            && self.audit_failure.is_none()
    }
}

impl AclChangeSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries_inheriting.is_none()
            && self.parent.is_none()
            && self.class_aces.is_none()
            && self.class_field_aces.is_none()
            && self.object_aces.is_none()
            && self.object_field_aces.is_none()
            && self.aces.is_empty()
    }

    /// True when a property shared across all ACLs of the type changed.
    pub(crate) fn class_scope_changed(&self) -> bool {
        self.class_aces.is_some() || self.class_field_aces.is_some()
    }

    pub(crate) fn record_entries_inheriting(&mut self, old: bool, new: bool) {
        self.entries_inheriting = merge_scalar(self.entries_inheriting.take(), old, new);
    }

    pub(crate) fn record_parent(&mut self, old: Option<Acl>, new: Option<Acl>) {
        self.parent = match self.parent.take() {
            None if parent_eq(&old, &new) => None,
            None => Some((old, new)),
            Some((orig, _)) if parent_eq(&orig, &new) => None,
            Some((orig, _)) => Some((orig, new)),
        };
    }

    pub(crate) fn record_class_aces(&mut self, old: Vec<Entry>, new: Vec<Entry>) {
        self.class_aces = merge_list(self.class_aces.take(), old, new);
    }

    pub(crate) fn record_object_aces(&mut self, old: Vec<Entry>, new: Vec<Entry>) {
        self.object_aces = merge_list(self.object_aces.take(), old, new);
    }

    pub(crate) fn record_class_field_aces(&mut self, old: FieldAceMap, new: FieldAceMap) {
        self.class_field_aces = merge_field_map(self.class_field_aces.take(), old, new);
    }

    pub(crate) fn record_object_field_aces(&mut self, old: FieldAceMap, new: FieldAceMap) {
        self.object_field_aces = merge_field_map(self.object_field_aces.take(), old, new);
    }

    pub(crate) fn record_ace_mask(&mut self, id: i64, old: i32, new: i32) {
        let record = self.aces.entry(id).or_default();
        record.mask = merge_scalar(record.mask.take(), old, new);
        self.drop_if_clean(id);
    }

    pub(crate) fn record_ace_strategy(
        &mut self,
        id: i64,
        old: GrantingStrategy,
        new: GrantingStrategy,
    ) {
        let record = self.aces.entry(id).or_default();
        record.strategy = merge_scalar(record.strategy.take(), old, new);
        self.drop_if_clean(id);
    }

    pub(crate) fn record_ace_audit_success(&mut self, id: i64, old: bool, new: bool) {
        let record = self.aces.entry(id).or_default();
        record.audit_success = merge_scalar(record.audit_success.take(), old, new);
        self.drop_if_clean(id);
    }

    pub(crate) fn record_ace_audit_failure(&mut self, id: i64, old: bool, new: bool) {
        let record = self.aces.entry(id).or_default();
        record.audit_failure = merge_scalar(record.audit_failure.take(), old, new);
        self.drop_if_clean(id);
    }

    fn drop_if_clean(&mut self, id: i64) {
        if self.aces.get(&id).is_some_and(EntryChangeSet::is_empty) {
            self.aces.remove(&id);
        }
    }
}

fn merge_scalar<T: PartialEq>(existing: Option<(T, T)>, old: T, new: T) -> Option<(T, T)> {
    match existing {
        None if old == new => None,
        None => Some((old, new)),
        Some((orig, _)) if orig == new => None,
        Some((orig, _)) => Some((orig, new)),
    }
}

fn merge_list(
    existing: Option<(Vec<Entry>, Vec<Entry>)>,
    old: Vec<Entry>,
    new: Vec<Entry>,
) -> Option<(Vec<Entry>, Vec<Entry>)> {
    match existing {
        None if entries_eq(&old, &new) => None,
        None => Some((old, new)),
        Some((orig, _)) if entries_eq(&orig, &new) => None,
        Some((orig, _)) => Some((orig, new)),
    }
}

fn merge_field_map(
    existing: Option<(FieldAceMap, FieldAceMap)>,
    old: FieldAceMap,
    new: FieldAceMap,
) -> Option<(FieldAceMap, FieldAceMap)> {
    match existing {
        None if field_map_eq(&old, &new) => None,
        None => Some((old, new)),
        Some((orig, _)) if field_map_eq(&orig, &new) => None,
        Some((orig, _)) => Some((orig, new)),
    }
}

fn parent_eq(a: &Option<Acl>, b: &Option<Acl>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x.ptr_eq(y),
        _ => false,
    }
}

/// Instance-wise list equality.
pub(crate) fn entries_eq(a: &[Entry], b: &[Entry]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.ptr_eq(y))
}

pub(crate) fn field_map_eq(a: &FieldAceMap, b: &FieldAceMap) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(field, aces)| b.get(field).is_some_and(|other| entries_eq(aces, other)))
}
