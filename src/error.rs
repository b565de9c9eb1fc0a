use crate::model::{Acl, ObjectIdentity};
use std::collections::HashMap;
use thiserror::Error;

/// Error surface of the ACL subsystem.
///
/// Decision errors (`NoApplicableAce`) propagate through the granting
/// strategy up to the caller. Persistence errors roll back the enclosing
/// transaction and arrive as `Unexpected`. Integrity errors indicate
/// corrupted authorization data and are fatal to the operation that hit them.
#[derive(Debug, Error)]
pub enum AclError {
    #[error("no ACL found for {0}")]
    AclNotFound(ObjectIdentity),
    /// Multi-identity lookup missing some identities; carries what was found.
    #[error("{} object identities had no ACL", .missing.len())]
    NotAllAclsFound {
        partial: HashMap<ObjectIdentity, Acl>,
        missing: Vec<ObjectIdentity>,
    },
    #[error("an ACL already exists for {0}")]
    AclAlreadyExists(ObjectIdentity),
    #[error("no applicable ACE found")]
    NoApplicableAce,
    #[error("concurrent modification detected: {0}")]
    ConcurrentModification(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type AclResult<T> = Result<T, AclError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_variants() {
        let oid = ObjectIdentity::new("BlogPost", "42");
        let errors = vec![
            AclError::AclNotFound(oid.clone()),
            AclError::AclAlreadyExists(oid.clone()),
            AclError::NoApplicableAce,
            AclError::ConcurrentModification("class aces diverged".to_string()),
            AclError::InvalidArgument("bad index".to_string()),
            AclError::IntegrityViolation("unresolved parent".to_string()),
            AclError::NotImplemented("partial SID reload".to_string()),
            AclError::NotAllAclsFound {
                partial: HashMap::new(),
                missing: vec![oid],
            },
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
