//! Error types for the hearth-store crate.

use thiserror::Error;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend refused the write because it is full.
    #[error("Store capacity exceeded: {used}/{capacity} messages")]
    CapacityExceeded { used: usize, capacity: usize },

    /// The backend is unreachable or rejected the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use super::*;

    #[test]
    fn test_poison_error_conversion() {
        let lock = Arc::new(RwLock::new(0));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            panic!("poison the lock");
        })
        .join();

        let err: StoreError = lock.read().map(|_| ()).unwrap_err().into();
        assert!(matches!(err, StoreError::Internal(_)));
        assert!(err.to_string().contains("Lock poisoned"));
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::CapacityExceeded {
            used: 2,
            capacity: 2,
        };
        assert_eq!(err.to_string(), "Store capacity exceeded: 2/2 messages");
    }
}
