use anyhow::{Context, Result};

/// Postgres connection settings sourced from environment variables.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl PostgresConfig {
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("PALISADE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .context("set PALISADE_DATABASE_URL or DATABASE_URL")?;
        let max_connections = match std::env::var("PALISADE_PG_MAX_CONNECTIONS") {
            Ok(value) => value.parse().context("parse PALISADE_PG_MAX_CONNECTIONS")?,
            Err(_) => 5,
        };
        let acquire_timeout_ms = match std::env::var("PALISADE_PG_ACQUIRE_TIMEOUT_MS") {
            Ok(value) => value
                .parse()
                .context("parse PALISADE_PG_ACQUIRE_TIMEOUT_MS")?,
            Err(_) => 5_000,
        };
        Ok(Self {
            url,
            max_connections,
            acquire_timeout_ms,
        })
    }
}

/// Provider options: the five table names and the read-path batch size.
/// Everything else is hardcoded to the provider's contracts.
#[derive(Debug, Clone)]
pub struct AclProviderOptions {
    pub class_table_name: String,
    pub oid_table_name: String,
    pub oid_ancestors_table_name: String,
    pub entry_table_name: String,
    pub sid_table_name: String,
    pub max_batch_size: usize,
}

impl Default for AclProviderOptions {
    fn default() -> Self {
        Self {
            class_table_name: "acl_classes".to_string(),
            oid_table_name: "acl_object_identities".to_string(),
            oid_ancestors_table_name: "acl_object_identity_ancestors".to_string(),
            entry_table_name: "acl_entries".to_string(),
            sid_table_name: "acl_security_identities".to_string(),
            max_batch_size: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_use_acl_table_names() {
        let options = AclProviderOptions::default();
        assert_eq!(options.class_table_name, "acl_classes");
        assert_eq!(options.oid_table_name, "acl_object_identities");
        assert_eq!(
            options.oid_ancestors_table_name,
            "acl_object_identity_ancestors"
        );
        assert_eq!(options.entry_table_name, "acl_entries");
        assert_eq!(options.sid_table_name, "acl_security_identities");
        assert_eq!(options.max_batch_size, 30);
    }
}
