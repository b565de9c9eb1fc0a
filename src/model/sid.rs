use crate::error::{AclError, AclResult};
use serde::{Deserialize, Serialize};

/// Security identity: the principal an ACE applies to.
///
/// A closed variant: either a concrete user (class name plus username) or a
/// role string. The persistence layer stores a single identifier column plus
/// a `username` flag; [`SecurityIdentity::wire_form`] and
/// [`SecurityIdentity::from_wire`] round-trip through that encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityIdentity {
    User { class: String, username: String },
    Role(String),
}

impl SecurityIdentity {
    pub fn user(class: impl Into<String>, username: impl Into<String>) -> Self {
        SecurityIdentity::User {
            class: class.into(),
            username: username.into(),
        }
    }

    pub fn role(name: impl Into<String>) -> Self {
        SecurityIdentity::Role(name.into())
    }

    /// The `username` flag stored alongside the identifier; disambiguates the
    /// two wire forms.
    pub fn is_username(&self) -> bool {
        matches!(self, SecurityIdentity::User { .. })
    }

    /// Stored identifier: `"{class}-{username}"` for users, the raw name for
    /// roles.
    pub fn wire_form(&self) -> String {
        match self {
            SecurityIdentity::User { class, username } => format!("{class}-{username}"),
            SecurityIdentity::Role(name) => name.clone(),
        }
    }

    /// Reconstruct a security identity from its stored columns. User
    /// identifiers split on the first `-` to recover `(class, username)`.
    pub fn from_wire(identifier: &str, username_flag: bool) -> AclResult<Self> {
        if !username_flag {
            return Ok(SecurityIdentity::Role(identifier.to_string()));
        }
        let (class, username) = identifier.split_once('-').ok_or_else(|| {
            AclError::InvalidArgument(format!(
                "user security identifier missing class separator: {identifier}"
            ))
        })?;
        Ok(SecurityIdentity::user(class, username))
    }
}

impl std::fmt::Display for SecurityIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityIdentity::User { class, username } => write!(f, "user:{class}-{username}"),
            SecurityIdentity::Role(name) => write!(f, "role:{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SecurityIdentity;

    #[test]
    fn wire_form_round_trip() {
        let sids = [
            SecurityIdentity::user("App\\Security\\User", "alice"),
            SecurityIdentity::role("ROLE_ADMIN"),
        ];
        for sid in sids {
            let restored =
                SecurityIdentity::from_wire(&sid.wire_form(), sid.is_username()).expect("wire");
            assert_eq!(restored, sid);
        }
    }

    #[test]
    fn user_split_takes_first_dash() {
        // Usernames may themselves contain dashes; only the first separates
        // the class.
        let sid = SecurityIdentity::from_wire("AcmeUser-mary-jane", true).expect("wire");
        assert_eq!(sid, SecurityIdentity::user("AcmeUser", "mary-jane"));
    }

    #[test]
    fn user_without_separator_is_rejected() {
        assert!(SecurityIdentity::from_wire("alice", true).is_err());
    }

    #[test]
    fn role_wire_form_is_raw_name() {
        let sid = SecurityIdentity::role("ROLE_USER");
        assert_eq!(sid.wire_form(), "ROLE_USER");
        assert!(!sid.is_username());
    }
}
