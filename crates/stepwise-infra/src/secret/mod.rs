//! Secret provider implementations.
//!
//! - `env`: read-only environment variables (highest priority)
//! - `vault`: AES-256-GCM encrypted file in the data directory
//! - `chain`: wires the providers in resolution order

pub mod chain;
pub mod env;
pub mod vault;

pub use chain::build_secret_chain;
pub use env::EnvSecretProvider;
pub use vault::FileVaultProvider;
