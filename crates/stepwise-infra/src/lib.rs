//! Infrastructure layer for Stepwise.
//!
//! Implements the ports defined in `stepwise-core`: the SQLite memory store,
//! the encrypted secret vault, and HTTP clients for model providers. Also
//! owns the on-disk layout (data directory, config, workflow files).

pub mod config;
pub mod crypto;
pub mod filesystem;
pub mod llm;
pub mod secret;
pub mod sqlite;
