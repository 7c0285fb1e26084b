//! Cryptographic operations for Stepwise.
//!
//! - `vault`: AES-256-GCM encryption for secrets at rest

pub mod vault;
