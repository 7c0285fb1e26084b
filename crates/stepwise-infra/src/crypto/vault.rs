//! AES-256-GCM vault encryption for secrets at rest.
//!
//! The master key comes from either:
//! - a key file (`vault.key`, 32 random bytes base64-encoded, created on first use)
//! - a password (Argon2id key derivation)
//!
//! Encrypted format: `nonce (12 bytes) || ciphertext`
//!
//! SECURITY: Error types never contain plaintext or key material.

use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

/// Nonce size for AES-256-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Argon2 salt. Deterministic so the same password always yields the same key.
const PASSWORD_SALT: &[u8] = b"stepwise-vault-v1";

/// Errors from vault encryption operations.
///
/// These never include plaintext, key material, or ciphertext in their
/// Display/Debug output.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("key derivation failed")]
    KeyDerivationFailed,

    #[error("key file error: {0}")]
    KeyFile(String),
}

/// AES-256-GCM encryption for vault secrets at rest.
///
/// Every encryption uses a fresh random nonce, prepended to the ciphertext.
pub struct VaultCrypto {
    cipher: Aes256Gcm,
}

impl VaultCrypto {
    /// Create a new VaultCrypto from a raw 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Derive the key from a password using Argon2id
    /// (19 MiB memory, 2 iterations, 1 lane).
    pub fn from_password(password: &str) -> Result<Self, VaultError> {
        use argon2::{Algorithm, Argon2, Params, Version};

        let params =
            Params::new(19456, 2, 1, Some(32)).map_err(|_| VaultError::KeyDerivationFailed)?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(password.as_bytes(), PASSWORD_SALT, &mut key)
            .map_err(|_| VaultError::KeyDerivationFailed)?;

        Ok(Self::new(&key))
    }

    /// Load the key from `path`, generating and writing a new one if the
    /// file does not exist.
    ///
    /// A new key is written to a temporary file (mode 0600 from creation on
    /// unix) in the same directory and then moved into place, so the key is
    /// never readable by others. If another process created the file first,
    /// its key wins.
    pub fn from_key_file(path: &Path) -> Result<Self, VaultError> {
        match std::fs::read_to_string(path) {
            Ok(encoded) => Self::from_encoded_key(&encoded),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = rand_bytes();
                let dir = match path.parent() {
                    Some(dir) if !dir.as_os_str().is_empty() => dir,
                    _ => Path::new("."),
                };
                std::fs::create_dir_all(dir).map_err(|e| VaultError::KeyFile(e.to_string()))?;

                let mut tmp = tempfile::NamedTempFile::new_in(dir)
                    .map_err(|e| VaultError::KeyFile(e.to_string()))?;
                tmp.write_all(STANDARD.encode(key).as_bytes())
                    .and_then(|()| tmp.as_file().sync_all())
                    .map_err(|e| VaultError::KeyFile(e.to_string()))?;
                match tmp.persist_noclobber(path) {
                    Ok(_) => {
                        tracing::info!(path = %path.display(), "generated new vault key");
                        Ok(Self::new(&key))
                    }
                    Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                        let encoded = std::fs::read_to_string(path)
                            .map_err(|e| VaultError::KeyFile(e.to_string()))?;
                        Self::from_encoded_key(&encoded)
                    }
                    Err(e) => Err(VaultError::KeyFile(e.error.to_string())),
                }
            }
            Err(e) => Err(VaultError::KeyFile(e.to_string())),
        }
    }

    fn from_encoded_key(encoded: &str) -> Result<Self, VaultError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| VaultError::KeyFile("corrupted key file".to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| VaultError::KeyFile("invalid key length".to_string()))?;
        Ok(Self::new(&key))
    }

    /// Encrypt plaintext. Returns `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data produced by `encrypt()`.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, VaultError> {
        if data.len() < NONCE_SIZE {
            return Err(VaultError::CiphertextTooShort);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)
    }
}

/// Generate 32 random bytes using the OS CSPRNG.
fn rand_bytes() -> [u8; 32] {
    use aes_gcm::aead::rand_core::RngCore;
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}
