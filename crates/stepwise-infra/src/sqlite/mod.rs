//! SQLite storage layer.
//!
//! The durable memory store, backed by SQLite in WAL mode with split
//! read/write connection pools.

pub mod memory;
pub mod pool;
