//! Permission-granting strategy.
//!
//! # Purpose
//! Decides a permission check over an ACL: scans the ordered ACE lists of
//! the relevant scope, walks the parent chain when inheritance is enabled,
//! and emits audit events for the deciding ACE.
//!
//! # Decision order
//! Object-scope entries are consulted first. The inheritance flag gates both
//! the class-scope entries and the parent walk: with it cleared, only the
//! object's own entries can decide. Within a scope the requested masks form
//! the outer loop, the presented identities the inner loop, and entries are
//! scanned in ascending order; the first applicable entry decides the check
//! immediately, granting or denying.
use crate::audit::AuditLogger;
use crate::error::{AclError, AclResult};
use crate::model::{Acl, Entry, GrantingStrategy, SecurityIdentity};
use std::sync::Arc;

pub trait PermissionGrantingStrategy: Send + Sync {
    fn is_granted(
        &self,
        acl: &Acl,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative: bool,
    ) -> AclResult<bool>;

    fn is_field_granted(
        &self,
        acl: &Acl,
        field: &str,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative: bool,
    ) -> AclResult<bool>;
}

/// Default strategy: bitmask matching per the ACE's granting strategy.
#[derive(Default)]
pub struct MaskGrantingStrategy {
    audit: Option<Arc<dyn AuditLogger>>,
}

impl MaskGrantingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_audit_logger(audit: Arc<dyn AuditLogger>) -> Self {
        Self { audit: Some(audit) }
    }

    /// First applicable entry for the cross product masks × sids, in that
    /// order; `None` when nothing applies.
    fn first_decision(
        &self,
        aces: &[Entry],
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative: bool,
    ) -> Option<bool> {
        for &mask in masks {
            for sid in sids {
                for ace in aces {
                    if is_ace_applicable(mask, sid, ace) {
                        let granting = ace.is_granting();
                        if !administrative {
                            if let Some(audit) = &self.audit {
                                audit.log_if_needed(granting, ace);
                            }
                        }
                        return Some(granting);
                    }
                }
            }
        }
        None
    }
}

impl PermissionGrantingStrategy for MaskGrantingStrategy {
    fn is_granted(
        &self,
        acl: &Acl,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative: bool,
    ) -> AclResult<bool> {
        if let Some(decision) = self.first_decision(&acl.object_aces(), masks, sids, administrative)
        {
            return Ok(decision);
        }
        if acl.is_entries_inheriting() {
            if let Some(decision) =
                self.first_decision(&acl.class_aces(), masks, sids, administrative)
            {
                return Ok(decision);
            }
            if let Some(parent) = acl.parent_acl() {
                return self.is_granted(&parent, masks, sids, administrative);
            }
        }
        Err(AclError::NoApplicableAce)
    }

    fn is_field_granted(
        &self,
        acl: &Acl,
        field: &str,
        masks: &[i32],
        sids: &[SecurityIdentity],
        administrative: bool,
    ) -> AclResult<bool> {
        if let Some(decision) =
            self.first_decision(&acl.object_field_aces(field), masks, sids, administrative)
        {
            return Ok(decision);
        }
        if acl.is_entries_inheriting() {
            if let Some(decision) =
                self.first_decision(&acl.class_field_aces(field), masks, sids, administrative)
            {
                return Ok(decision);
            }
            if let Some(parent) = acl.parent_acl() {
                // The parent is consulted with the caller's field policy.
                return self.is_field_granted(&parent, field, masks, sids, administrative);
            }
        }
        Err(AclError::NoApplicableAce)
    }
}

/// An ACE applies when its identity is the presented one and its mask
/// matches the requested mask under the ACE's strategy.
fn is_ace_applicable(required: i32, sid: &SecurityIdentity, ace: &Entry) -> bool {
    if ace.security_identity() != *sid {
        return false;
    }
    let mask = ace.mask();
    match ace.strategy() {
        GrantingStrategy::Equal => required == mask,
        GrantingStrategy::All => required & mask == required,
        GrantingStrategy::Any => required & mask != 0,
    }
}
