use thiserror::Error;

/// Memory store failures, split by direction so callers can tell a lost
/// write (never durable) from a failed read (context unavailable).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("memory store write failed: {0}")]
    Write(String),

    #[error("memory store read failed: {0}")]
    Read(String),

    #[error("memory store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_write(&self) -> bool {
        matches!(self, StoreError::Write(_))
    }
}

/// Errors related to secret operations.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found")]
    NotFound,

    #[error("secret provider unavailable")]
    ProviderUnavailable,

    #[error("provider is read-only")]
    ReadOnly,

    #[error("encryption error")]
    EncryptionError,

    #[error("decryption error")]
    DecryptionError,

    #[error("vault I/O error: {0}")]
    Io(String),

    #[error("vault format error: {0}")]
    Format(String),
}
