use std::fmt;

use serde::{Deserialize, Serialize};

/// Metadata about a stored secret (the value itself is never in this struct).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    /// The key name (e.g., "ANTHROPIC_API_KEY").
    pub key: String,
    pub source: SecretSource,
}

/// Backend a secret was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    /// Encrypted vault file (`~/.stepwise/vault.enc`).
    Vault,
    /// Environment variable.
    Environment,
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretSource::Vault => write!(f, "vault"),
            SecretSource::Environment => write!(f, "environment"),
        }
    }
}
