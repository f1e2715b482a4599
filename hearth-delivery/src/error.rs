//! Typed error handling for delivery and recovery operations.
//!
//! Failures are grouped by the collaborator that produced them:
//! - Encryption provider failures
//! - Persistent store failures
//! - Lock service failures
//! - System errors (configuration, wiring)
//!
//! Lock contention is deliberately absent: losing a lock race is an expected
//! outcome and is reported through the return values of the recovery
//! operations instead.

use hearth_store::StoreError;
use thiserror::Error;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The encryption provider could not produce ciphertext.
    #[error("Encryption failure: {0}")]
    Encryption(#[from] CryptoError),

    /// The persistent store rejected a read or write.
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    /// The lock service could not be reached.
    #[error("Lock service failure: {0}")]
    Lock(#[from] LockError),

    /// Internal or configuration error.
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Errors raised by an [`EncryptionProvider`](crate::EncryptionProvider).
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No session key exists for the sender/recipient pair.
    #[error("Session key unavailable: {0}")]
    SessionKeyUnavailable(String),

    /// Encrypting with the session key failed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Moving ciphertext between key versions failed.
    #[error("Re-encryption from {from} to {to} failed: {reason}")]
    ReEncryptionFailed {
        from: String,
        to: String,
        reason: String,
    },
}

/// Errors raised by a [`LockService`](crate::LockService).
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock backend is unreachable or refused the request.
    #[error("Lock service unavailable: {0}")]
    Unavailable(String),
}

/// System-level errors that indicate internal problems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// A required collaborator was not provided.
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DeliveryError {
    /// Returns `true` if retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::System(_))
    }
}
