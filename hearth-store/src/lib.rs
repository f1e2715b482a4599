//! Persistent store interface for delivered and dead-lettered messages
//!
//! The real database is an external collaborator. This crate defines the
//! [`MessageStore`] seam the delivery core talks to, the row types for the
//! `messages` and `failed_messages` tables, and in-memory backends used for
//! development and tests.

pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;
pub mod types;

pub use backends::{MemoryMessageStore, TestMessageStore};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use r#trait::MessageStore;
pub use types::{FailedMessage, KeyTransitionRecord, MessageRecord};
