//! Type definitions for the retry queue and recovery results

use std::time::SystemTime;

use hearth_common::Message;
use serde::{Deserialize, Serialize};

/// An in-flight forward-secrecy key rotation affecting one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTransitionContext {
    pub from_version: String,
    pub to_version: String,
    pub key_id: Option<String>,
    /// Start of the transition window; the window is bounded by time, not attempts
    pub transition_started: SystemTime,
    pub retry_count: u32,
}

impl KeyTransitionContext {
    /// Open a new transition window starting now
    #[must_use]
    pub fn new(from_version: impl Into<String>, to_version: impl Into<String>) -> Self {
        Self {
            from_version: from_version.into(),
            to_version: to_version.into(),
            key_id: None,
            transition_started: SystemTime::now(),
            retry_count: 0,
        }
    }
}

/// A message waiting in the in-memory retry queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub message: Message,
    /// 1 after the first failure; 0 for messages re-queued from the dead-letter table
    pub attempts: u32,
    pub last_attempt: SystemTime,
    pub error: String,
    pub transition: Option<KeyTransitionContext>,
}

/// Result of [`Recovery::queue_for_retry`](crate::Recovery::queue_for_retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// The message is queued with the given attempt count
    Queued { attempts: u32 },
    /// The retry budget was already spent, so the message was dead-lettered
    DeadLettered,
    /// Another worker holds the message lock; nothing was changed
    Contended,
}

/// Result of a single retry attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Persisted and removed from the queue
    Delivered,
    /// The attempt failed and was recorded against the queue entry
    Failed,
    /// Another worker holds the message or transition lock; nothing was changed
    Contended,
}

impl RetryOutcome {
    #[must_use]
    pub const fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Aggregate view of a thread's dead-letter rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessageStats {
    /// Rows that are `failed`, `transition_failed` or `transition_pending`
    pub total: usize,
    /// Of those, rows stored under a key version other than the current one
    pub needs_key_transition: usize,
    /// Rows currently `transition_pending`
    pub in_transition: usize,
}
