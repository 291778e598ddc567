//! Storage contracts and the in-memory reference backend.
//!
//! The engine only sees the [`LoreStore`] trait; any transactional backend
//! (relational or embedded) can implement it. The whole world/chapter/fact
//! state is one transaction domain because cascading deletes and per-chapter
//! reconciliation must commit across all tables atomically.

mod memory;
mod traits;

pub use memory::InMemoryLoreStore;
pub use traits::{LoreStore, StorageError, WriteBatch, WriteOp};
