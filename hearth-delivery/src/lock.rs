//! Distributed locking for recovery operations
//!
//! Every mutation of a message's retry state happens under a lease on
//! `message_recovery:<id>`. Key transitions additionally hold
//! `key_transition:<id>`, and bulk recovery of a thread holds
//! `thread_recovery:<thread>`.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use hearth_common::{MessageId, ThreadId, tracing};

use crate::error::LockError;

#[must_use]
pub fn message_key(message_id: &MessageId) -> String {
    format!("message_recovery:{message_id}")
}

#[must_use]
pub fn transition_key(message_id: &MessageId) -> String {
    format!("key_transition:{message_id}")
}

#[must_use]
pub fn thread_key(thread_id: &ThreadId) -> String {
    format!("thread_recovery:{thread_id}")
}

/// A cluster-wide named lock with time-to-live
#[async_trait]
pub trait LockService: Send + Sync + fmt::Debug {
    /// Make a single, non-blocking attempt to take `key` for `holder`
    ///
    /// Returns `false` when another holder owns an unexpired lock on `key`.
    ///
    /// # Errors
    /// If the lock backend cannot be reached
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Release `key` if `holder` still owns it
    ///
    /// Releasing a lock that is free, expired, or owned by someone else is a
    /// no-op.
    ///
    /// # Errors
    /// If the lock backend cannot be reached
    async fn release(&self, key: &str, holder: &str) -> Result<(), LockError>;
}

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    expires_at: Instant,
}

/// Process-local [`LockService`]
///
/// Suitable for a single instance and for tests; a deployment with more
/// than one instance needs a shared backend behind the same trait.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    locks: DashMap<String, LockEntry>,
    unavailable: AtomicBool,
}

impl MemoryLockService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unexpired holder of `key`
    #[must_use]
    pub fn holder_of(&self, key: &str) -> Option<String> {
        self.locks
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.holder.clone())
    }

    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.holder_of(key).is_some()
    }

    /// Simulate an unreachable backend
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LockError::Unavailable(
                "memory lock service disabled".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError> {
        self.check_available()?;

        let now = Instant::now();
        let entry = LockEntry {
            holder: holder.to_string(),
            expires_at: now + ttl,
        };

        match self.locks.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
            Entry::Occupied(mut occupied) if occupied.get().expires_at <= now => {
                occupied.insert(entry);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<(), LockError> {
        self.check_available()?;
        self.locks.remove_if(key, |_, entry| entry.holder == holder);
        Ok(())
    }
}

/// An acquired lock, released on [`Lease::release`] or on drop
///
/// Dropping an unreleased lease (a panic or a cancelled future) schedules
/// the release on the current tokio runtime. Outside a runtime the lock is
/// left to expire through its TTL.
pub struct Lease {
    locks: Arc<dyn LockService>,
    key: String,
    holder: String,
    released: bool,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Lease {
    /// Try once to lease `key`
    ///
    /// Returns `Ok(None)` when another holder owns it.
    ///
    /// # Errors
    /// If the lock backend cannot be reached
    pub async fn acquire(
        locks: &Arc<dyn LockService>,
        key: String,
        holder: String,
        ttl: Duration,
    ) -> Result<Option<Self>, LockError> {
        if locks.acquire(&key, &holder, ttl).await? {
            tracing::trace!(key = %key, holder = %holder, "Lease acquired");
            Ok(Some(Self {
                locks: Arc::clone(locks),
                key,
                holder,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock now
    ///
    /// A release failure is logged; the lock then expires through its TTL.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.locks.release(&self.key, &self.holder).await {
            tracing::warn!(key = %self.key, error = %e, "Failed to release lease");
        } else {
            tracing::trace!(key = %self.key, "Lease released");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "Lease dropped outside a runtime, left to expire");
            return;
        };

        let locks = Arc::clone(&self.locks);
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        handle.spawn(async move {
            if let Err(e) = locks.release(&key, &holder).await {
                tracing::warn!(key = %key, error = %e, "Failed to release dropped lease");
            }
        });
    }
}
