//! Reliable delivery for end-to-end encrypted chat messages
//!
//! This crate provides:
//! - The [`DeliveryPipeline`] that encrypts, persists and pushes messages
//! - [`Recovery`]: a retry queue with fixed backoff, key-transition aware
//!   re-encryption, dead-lettering and bulk recovery of dead letters
//! - The collaborator interfaces it is wired with: [`LockService`],
//!   [`EncryptionProvider`] and [`Transport`], each with an in-process
//!   implementation

pub mod crypto;
mod error;
pub mod lock;
mod pipeline;
pub mod policy;
pub mod queue;
mod recovery;
pub mod transport;
mod types;
mod writer;

pub use crypto::{EncryptedPayload, EncryptionProvider, SessionContext, TestEncryptionProvider};
pub use error::{CryptoError, DeliveryError, LockError, SystemError};
pub use lock::{Lease, LockService, MemoryLockService};
pub use pipeline::DeliveryPipeline;
pub use policy::RetryPolicy;
pub use queue::RetryQueue;
pub use recovery::{Recovery, RecoveryBuilder};
pub use transport::{ChannelTransport, DeliveredMessage, Transport, TransportEvent};
pub use types::{
    FailedMessageStats, KeyTransitionContext, QueueOutcome, RetryOutcome, RetryQueueItem,
};
pub use writer::MessageWriter;
