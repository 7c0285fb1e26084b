//! Environment variable secret provider.
//!
//! Read-only and first in the resolution chain: an exported variable
//! overrides whatever the vault holds under the same name.

use stepwise_core::secret::SecretProvider;
use stepwise_types::error::SecretError;
use stepwise_types::llm::ProviderKind;
use stepwise_types::secret::{SecretEntry, SecretSource};

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretProvider;

impl EnvSecretProvider {
    pub fn new() -> Self {
        Self
    }
}

impl SecretProvider for EnvSecretProvider {
    fn name(&self) -> &str {
        "environment"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        match std::env::var(key) {
            Ok(val) => Ok(Some(val)),
            // Non-unicode values cannot be used as secrets.
            Err(std::env::VarError::NotPresent | std::env::VarError::NotUnicode(_)) => Ok(None),
        }
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), SecretError> {
        Err(SecretError::ReadOnly)
    }

    async fn delete(&self, _key: &str) -> Result<(), SecretError> {
        Err(SecretError::ReadOnly)
    }

    /// Only the well-known provider key names are reported; arbitrary
    /// environment variables are never enumerated.
    async fn list(&self) -> Result<Vec<SecretEntry>, SecretError> {
        Ok(ProviderKind::ALL
            .iter()
            .map(ProviderKind::api_key_name)
            .filter(|name| std::env::var(name).is_ok())
            .map(|name| SecretEntry {
                key: name.to_string(),
                source: SecretSource::Environment,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_existing_and_missing_vars() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("STEPWISE_TEST_SECRET_1", "test-value-123") };

        let provider = EnvSecretProvider::new();
        assert_eq!(
            provider.get("STEPWISE_TEST_SECRET_1").await.unwrap(),
            Some("test-value-123".to_string())
        );
        assert!(provider.get("NONEXISTENT_VAR_XYZ_123").await.unwrap().is_none());

        // SAFETY: set above, not shared with other tests.
        unsafe { std::env::remove_var("STEPWISE_TEST_SECRET_1") };
    }

    #[tokio::test]
    async fn is_read_only() {
        let provider = EnvSecretProvider::new();
        assert!(matches!(provider.set("K", "v").await, Err(SecretError::ReadOnly)));
        assert!(matches!(provider.delete("K").await, Err(SecretError::ReadOnly)));
    }
}
