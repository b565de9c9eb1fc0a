use crate::model::changes::AclChangeSet;
use crate::model::sid::SecurityIdentity;
use crate::model::snapshot::EntrySnapshot;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Predicate used to match a requested permission mask against an ACE mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantingStrategy {
    /// Requested mask must equal the ACE mask exactly.
    Equal,
    /// Every requested bit must be present in the ACE mask.
    All,
    /// At least one requested bit must be present in the ACE mask.
    Any,
}

impl GrantingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            GrantingStrategy::Equal => "equal",
            GrantingStrategy::All => "all",
            GrantingStrategy::Any => "any",
        }
    }
}

impl std::fmt::Display for GrantingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GrantingStrategy {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "equal" => Ok(GrantingStrategy::Equal),
            "all" => Ok(GrantingStrategy::All),
            "any" => Ok(GrantingStrategy::Any),
            _ => Err(()),
        }
    }
}

struct EntryState {
    id: Option<i64>,
    sid: SecurityIdentity,
    mask: i32,
    granting: bool,
    strategy: GrantingStrategy,
    audit_success: bool,
    audit_failure: bool,
    field: Option<String>,
    /// Change set of the owning ACL. Weak so an entry never keeps its ACL
    /// alive; unpersisted entries are not tracked at all.
    changes: Weak<Mutex<AclChangeSet>>,
}

/// One authorization rule. Shared handle: the provider interns entries by
/// storage id, so the same id always resolves to the same instance within
/// one provider.
///
/// Field entries differ only by carrying `field = Some(..)`; they live in
/// the field-keyed lists of their ACL and never in the flat ones.
#[derive(Clone)]
pub struct Entry {
    inner: Arc<RwLock<EntryState>>,
}

impl Entry {
    pub(crate) fn hydrated(
        id: i64,
        sid: SecurityIdentity,
        mask: i32,
        granting: bool,
        strategy: GrantingStrategy,
        audit_success: bool,
        audit_failure: bool,
        field: Option<String>,
        changes: Weak<Mutex<AclChangeSet>>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(EntryState {
                id: Some(id),
                sid,
                mask,
                granting,
                strategy,
                audit_success,
                audit_failure,
                field,
                changes,
            })),
        }
    }

    /// A caller-created entry that has not been persisted yet; it receives
    /// its id at `update_acl` time.
    pub(crate) fn new_local(
        sid: SecurityIdentity,
        mask: i32,
        granting: bool,
        strategy: GrantingStrategy,
        field: Option<String>,
        changes: Weak<Mutex<AclChangeSet>>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(EntryState {
                id: None,
                sid,
                mask,
                granting,
                strategy,
                audit_success: false,
                audit_failure: false,
                field,
                changes,
            })),
        }
    }

    pub(crate) fn from_snapshot(snapshot: EntrySnapshot, changes: Weak<Mutex<AclChangeSet>>) -> Self {
        Self::hydrated(
            snapshot.id,
            snapshot.sid,
            snapshot.mask,
            snapshot.granting,
            snapshot.strategy,
            snapshot.audit_success,
            snapshot.audit_failure,
            snapshot.field,
            changes,
        )
    }

    pub(crate) fn snapshot(&self) -> Option<EntrySnapshot> {
        let state = self.inner.read();
        Some(EntrySnapshot {
            id: state.id?,
            sid: state.sid.clone(),
            mask: state.mask,
            granting: state.granting,
            strategy: state.strategy,
            audit_success: state.audit_success,
            audit_failure: state.audit_failure,
            field: state.field.clone(),
        })
    }

    pub fn id(&self) -> Option<i64> {
        self.inner.read().id
    }

    pub fn security_identity(&self) -> SecurityIdentity {
        self.inner.read().sid.clone()
    }

    pub fn mask(&self) -> i32 {
        self.inner.read().mask
    }

    pub fn is_granting(&self) -> bool {
        self.inner.read().granting
    }

    pub fn strategy(&self) -> GrantingStrategy {
        self.inner.read().strategy
    }

    pub fn is_audit_success(&self) -> bool {
        self.inner.read().audit_success
    }

    pub fn is_audit_failure(&self) -> bool {
        self.inner.read().audit_failure
    }

    pub fn field(&self) -> Option<String> {
        self.inner.read().field.clone()
    }

    /// Instance identity: true when both handles point at the same entry.
    pub fn ptr_eq(&self, other: &Entry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_mask(&self, mask: i32) {
        let (id, old, changes) = {
            let mut state = self.inner.write();
            if state.mask == mask {
                return;
            }
            let old = state.mask;
            state.mask = mask;
            (state.id, old, state.changes.clone())
        };
        let Some(id) = id else { return };
        if let Some(log) = changes.upgrade() {
            log.lock().record_ace_mask(id, old, mask);
        }
    }

    pub fn set_strategy(&self, strategy: GrantingStrategy) {
        let (id, old, changes) = {
            let mut state = self.inner.write();
            if state.strategy == strategy {
                return;
            }
            let old = state.strategy;
            state.strategy = strategy;
            (state.id, old, state.changes.clone())
        };
        let Some(id) = id else { return };
        if let Some(log) = changes.upgrade() {
            log.lock().record_ace_strategy(id, old, strategy);
        }
    }

    pub fn set_auditing(&self, success: bool, failure: bool) {
        let (id, old_success, old_failure, changes) = {
            let mut state = self.inner.write();
            if state.audit_success == success && state.audit_failure == failure {
                return;
            }
            let old = (state.audit_success, state.audit_failure);
            state.audit_success = success;
            state.audit_failure = failure;
            (state.id, old.0, old.1, state.changes.clone())
        };
        let Some(id) = id else { return };
        if let Some(log) = changes.upgrade() {
            let mut log = log.lock();
            if old_success != success {
                log.record_ace_audit_success(id, old_success, success);
            }
            if old_failure != failure {
                log.record_ace_audit_failure(id, old_failure, failure);
            }
        }
    }

    /// Id assignment after the first persist.
    pub(crate) fn assign_id(&self, id: i64) {
        self.inner.write().id = Some(id);
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_read() {
            Some(state) => f
                .debug_struct("Entry")
                .field("id", &state.id)
                .field("sid", &state.sid)
                .field("mask", &state.mask)
                .field("granting", &state.granting)
                .field("strategy", &state.strategy)
                .field("field", &state.field)
                .finish_non_exhaustive(),
            None => f.write_str("Entry { .. }"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn granting_strategy_round_trip() {
        for strategy in [
            GrantingStrategy::Equal,
            GrantingStrategy::All,
            GrantingStrategy::Any,
        ] {
            assert_eq!(
                GrantingStrategy::from_str(strategy.as_str()).ok(),
                Some(strategy)
            );
        }
        assert!(GrantingStrategy::from_str("most").is_err());
    }

    #[test]
    fn unpersisted_entry_changes_are_not_tracked() {
        let log = Arc::new(Mutex::new(AclChangeSet::default()));
        let entry = Entry::new_local(
            SecurityIdentity::role("ROLE_USER"),
            1,
            true,
            GrantingStrategy::All,
            None,
            Arc::downgrade(&log),
        );
        entry.set_mask(4);
        assert_eq!(entry.mask(), 4);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn persisted_entry_changes_record_and_revert() {
        let log = Arc::new(Mutex::new(AclChangeSet::default()));
        let entry = Entry::hydrated(
            7,
            SecurityIdentity::role("ROLE_USER"),
            1,
            true,
            GrantingStrategy::All,
            false,
            false,
            None,
            Arc::downgrade(&log),
        );
        entry.set_mask(4);
        assert_eq!(log.lock().aces.get(&7).unwrap().mask, Some((1, 4)));
        entry.set_mask(1);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn snapshot_requires_persisted_id() {
        let log = Arc::new(Mutex::new(AclChangeSet::default()));
        let entry = Entry::new_local(
            SecurityIdentity::role("ROLE_USER"),
            1,
            true,
            GrantingStrategy::All,
            None,
            Arc::downgrade(&log),
        );
        assert!(entry.snapshot().is_none());
        entry.assign_id(3);
        assert_eq!(entry.snapshot().unwrap().id, 3);
    }
}
