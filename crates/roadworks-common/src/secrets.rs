//! Credential lookup
//!
//! Pipelines never read credentials directly. They ask a [`SecretSource`] for a
//! named set of secrets once at start-up and build their configuration from the
//! returned mapping.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{CommonError, Result};

/// A provider of named secrets
pub trait SecretSource: Send + Sync {
    /// Look up a single secret, `None` when it is not set
    fn get_secret(&self, name: &str) -> Option<String>;

    /// Fetch every named secret, failing on the first one that is missing or blank
    fn get_secrets(&self, names: &[&str]) -> Result<HashMap<String, String>> {
        let mut secrets = HashMap::with_capacity(names.len());

        for name in names {
            let value = self.get_secret(name).ok_or_else(|| {
                warn!(secret = %name, "Secret not found");
                CommonError::MissingSecret((*name).to_string())
            })?;

            if value.trim().is_empty() {
                return Err(CommonError::InvalidSecret {
                    name: (*name).to_string(),
                    reason: "value is empty".to_string(),
                });
            }

            secrets.insert((*name).to_string(), value);
        }

        debug!(count = secrets.len(), "Secrets retrieved");
        Ok(secrets)
    }
}

/// Reads secrets from environment variables
///
/// A secret called `motherduck_token` is read from `MOTHERDUCK_TOKEN`, or from
/// `<PREFIX>_MOTHERDUCK_TOKEN` when a prefix is configured.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretSource {
    prefix: Option<String>,
}

impl EnvSecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    /// Environment variable name used for a secret
    pub fn var_name(&self, name: &str) -> String {
        let upper = name.to_uppercase();
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix.to_uppercase(), upper),
            None => upper,
        }
    }
}

impl SecretSource for EnvSecretSource {
    fn get_secret(&self, name: &str) -> Option<String> {
        std::env::var(self.var_name(name)).ok()
    }
}

/// Fixed in-memory secrets, handy for local runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticSecretSource {
    values: HashMap<String, String>,
}

impl StaticSecretSource {
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl SecretSource for StaticSecretSource {
    fn get_secret(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_static_source_returns_requested_secrets() {
        let source = StaticSecretSource::new([("motherduck_token", "abc"), ("motherdb", "roads")]);
        let secrets = source.get_secrets(&["motherduck_token", "motherdb"]).unwrap();

        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets["motherdb"], "roads");
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let source = StaticSecretSource::new([("motherdb", "roads")]);
        let err = source.get_secrets(&["motherduck_token"]).unwrap_err();

        assert!(matches!(err, CommonError::MissingSecret(name) if name == "motherduck_token"));
    }

    #[test]
    fn test_blank_secret_is_rejected() {
        let source = StaticSecretSource::new([("motherduck_token", "   ")]);
        assert!(matches!(
            source.get_secrets(&["motherduck_token"]),
            Err(CommonError::InvalidSecret { .. })
        ));
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(EnvSecretSource::new().var_name("motherdb"), "MOTHERDB");
        assert_eq!(
            EnvSecretSource::with_prefix("roadworks").var_name("motherduck_token"),
            "ROADWORKS_MOTHERDUCK_TOKEN"
        );
    }

    #[test]
    #[serial]
    fn test_env_source_reads_environment() {
        std::env::set_var("RWTEST_MOTHERDB", "warehouse");
        let source = EnvSecretSource::with_prefix("rwtest");

        assert_eq!(source.get_secret("motherdb").as_deref(), Some("warehouse"));
        std::env::remove_var("RWTEST_MOTHERDB");
        assert!(source.get_secret("motherdb").is_none());
    }
}
