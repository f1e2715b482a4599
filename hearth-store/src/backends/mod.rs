//! Backend storage implementations
//!
//! - `memory`: In-memory tables for development and single-process use
//! - `test`: Memory tables plus synchronization and failure injection

pub mod memory;

pub use memory::MemoryMessageStore;
pub use test::TestMessageStore;
