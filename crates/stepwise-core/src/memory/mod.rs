//! Run memory: the slice store port, an in-process store, and the manager
//! that turns declared needs into scope bindings.

pub mod manager;
pub mod store;
pub mod volatile;

pub use manager::MemoryManager;
pub use store::MemoryStore;
pub use volatile::VolatileMemoryStore;
