//! Encrypted file vault.
//!
//! All secrets live in one file (`vault.enc`): a JSON object of
//! name -> value, encrypted with [`VaultCrypto`] and base64-encoded.
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a crash never leaves a half-written vault.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use stepwise_core::secret::SecretProvider;
use stepwise_types::error::SecretError;
use stepwise_types::secret::{SecretEntry, SecretSource};
use tokio::sync::Mutex;

use crate::crypto::vault::{VaultCrypto, VaultError};

pub const VAULT_FILE: &str = "vault.enc";
pub const VAULT_KEY_FILE: &str = "vault.key";

/// Environment variable holding a vault password. When set, the key is
/// derived from it instead of read from `vault.key`.
pub const VAULT_PASSWORD_ENV: &str = "STEPWISE_VAULT_PASSWORD";

type SecretMap = BTreeMap<String, String>;

pub struct FileVaultProvider {
    path: PathBuf,
    crypto: VaultCrypto,
    /// Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl FileVaultProvider {
    pub fn new(path: PathBuf, crypto: VaultCrypto) -> Self {
        Self {
            path,
            crypto,
            lock: Mutex::new(()),
        }
    }

    /// Open the vault in `data_dir`, deriving the key from
    /// `STEPWISE_VAULT_PASSWORD` if set, else from `vault.key`.
    pub fn open(data_dir: &Path) -> Result<Self, SecretError> {
        let crypto = match std::env::var(VAULT_PASSWORD_ENV) {
            Ok(password) if !password.is_empty() => VaultCrypto::from_password(&password),
            _ => VaultCrypto::from_key_file(&data_dir.join(VAULT_KEY_FILE)),
        }
        .map_err(map_vault_error)?;
        Ok(Self::new(data_dir.join(VAULT_FILE), crypto))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<SecretMap, SecretError> {
        let encoded = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SecretMap::new()),
            Err(e) => return Err(SecretError::Io(e.to_string())),
        };
        if encoded.trim().is_empty() {
            return Ok(SecretMap::new());
        }

        let sealed = STANDARD
            .decode(encoded.trim())
            .map_err(|_| SecretError::Format("vault file is not valid base64".to_string()))?;
        let plain = self.crypto.decrypt(&sealed).map_err(map_vault_error)?;
        serde_json::from_slice(&plain).map_err(|e| SecretError::Format(e.to_string()))
    }

    async fn store(&self, secrets: &SecretMap) -> Result<(), SecretError> {
        let plain = serde_json::to_vec(secrets).map_err(|e| SecretError::Format(e.to_string()))?;
        let sealed = self.crypto.encrypt(&plain).map_err(map_vault_error)?;
        let encoded = STANDARD.encode(sealed);

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, encoded.as_bytes()))
            .await
            .map_err(|e| SecretError::Io(e.to_string()))?
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), SecretError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| SecretError::Io(e.to_string()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| SecretError::Io(e.to_string()))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| SecretError::Io(e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| SecretError::Io(e.error.to_string()))?;
    Ok(())
}

fn map_vault_error(err: VaultError) -> SecretError {
    match err {
        VaultError::EncryptionFailed | VaultError::KeyDerivationFailed => SecretError::EncryptionError,
        VaultError::DecryptionFailed | VaultError::CiphertextTooShort => SecretError::DecryptionError,
        VaultError::KeyFile(msg) => SecretError::Io(msg),
    }
}

impl SecretProvider for FileVaultProvider {
    fn name(&self) -> &str {
        "vault"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SecretError> {
        let _guard = self.lock.lock().await;
        let mut secrets = self.load().await?;
        secrets.insert(key.to_string(), value.to_string());
        self.store(&secrets).await?;
        tracing::info!(key, "stored secret in vault");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretError> {
        let _guard = self.lock.lock().await;
        let mut secrets = self.load().await?;
        if secrets.remove(key).is_none() {
            return Err(SecretError::NotFound);
        }
        self.store(&secrets).await?;
        tracing::info!(key, "deleted secret from vault");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SecretEntry>, SecretError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .into_keys()
            .map(|key| SecretEntry {
                key,
                source: SecretSource::Vault,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(dir: &Path) -> FileVaultProvider {
        FileVaultProvider::new(dir.join(VAULT_FILE), VaultCrypto::new(&[7u8; 32]))
    }

    #[tokio::test]
    async fn set_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(dir.path());

        assert!(vault.get("OPENAI_API_KEY").await.unwrap().is_none());
        vault.set("OPENAI_API_KEY", "sk-one").await.unwrap();
        vault.set("MISTRAL_API_KEY", "m-two").await.unwrap();
        vault.set("OPENAI_API_KEY", "sk-three").await.unwrap();

        assert_eq!(
            vault.get("OPENAI_API_KEY").await.unwrap().as_deref(),
            Some("sk-three")
        );
        let keys: Vec<String> = vault.list().await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["MISTRAL_API_KEY", "OPENAI_API_KEY"]);

        vault.delete("MISTRAL_API_KEY").await.unwrap();
        assert!(matches!(
            vault.delete("MISTRAL_API_KEY").await,
            Err(SecretError::NotFound)
        ));
        assert_eq!(vault.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_never_contains_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(dir.path());
        vault.set("KEY", "very-secret-value").await.unwrap();

        let raw = std::fs::read_to_string(vault.path()).unwrap();
        assert!(!raw.contains("very-secret-value"));
        assert!(!raw.contains("KEY"));
    }

    #[tokio::test]
    async fn wrong_key_cannot_read() {
        let dir = tempfile::tempdir().unwrap();
        vault(dir.path()).set("KEY", "v").await.unwrap();

        let other = FileVaultProvider::new(dir.path().join(VAULT_FILE), VaultCrypto::new(&[8u8; 32]));
        assert!(matches!(other.get("KEY").await, Err(SecretError::DecryptionError)));
    }

    #[tokio::test]
    async fn open_creates_key_file_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        FileVaultProvider::open(dir.path())
            .unwrap()
            .set("KEY", "v")
            .await
            .unwrap();
        assert!(dir.path().join(VAULT_KEY_FILE).exists());

        let reopened = FileVaultProvider::open(dir.path()).unwrap();
        assert_eq!(reopened.get("KEY").await.unwrap().as_deref(), Some("v"));
    }
}
