//! Secret chain builder: wires concrete providers in priority order.
//!
//! The resulting chain is handed to `SecretService` in `stepwise-core`.

use stepwise_core::secret::{DynSecretProvider, dyn_provider};

use super::env::EnvSecretProvider;
use super::vault::FileVaultProvider;

/// Build the secret resolution chain (first match wins):
/// 1. Environment variables (if `include_env`)
/// 2. Encrypted vault (if available)
pub fn build_secret_chain(
    vault: Option<FileVaultProvider>,
    include_env: bool,
) -> Vec<DynSecretProvider> {
    let mut chain = Vec::new();

    if include_env {
        chain.push(dyn_provider(EnvSecretProvider::new()));
    }
    if let Some(vault) = vault {
        chain.push(dyn_provider(vault));
    }

    tracing::debug!(providers = chain.len(), "built secret chain");
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::vault::VaultCrypto;
    use stepwise_core::secret::{SecretProvider, SecretService};

    #[tokio::test]
    async fn env_overrides_vault() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVaultProvider::new(dir.path().join("vault.enc"), VaultCrypto::new(&[1u8; 32]));
        vault.set("STEPWISE_CHAIN_TEST_KEY", "from-vault").await.unwrap();
        vault.set("STEPWISE_CHAIN_VAULT_ONLY", "only-here").await.unwrap();

        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("STEPWISE_CHAIN_TEST_KEY", "from-env") };

        let service = SecretService::new(build_secret_chain(Some(vault), true));
        assert_eq!(
            service.get_secret("STEPWISE_CHAIN_TEST_KEY").await.as_deref(),
            Some("from-env")
        );
        assert_eq!(
            service.get_secret("STEPWISE_CHAIN_VAULT_ONLY").await.as_deref(),
            Some("only-here")
        );
        // The environment is read-only, so writes land in the vault.
        service.set_secret("NEW_KEY", "x").await.unwrap();
        assert_eq!(service.get_secret("NEW_KEY").await.as_deref(), Some("x"));

        // SAFETY: set above, not shared with other tests.
        unsafe { std::env::remove_var("STEPWISE_CHAIN_TEST_KEY") };
    }

    #[test]
    fn chain_order() {
        assert!(build_secret_chain(None, false).is_empty());
        let chain = build_secret_chain(None, true);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].name(), "environment");
    }
}
