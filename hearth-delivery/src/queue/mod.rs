//! In-memory retry queue

pub mod retry;

use std::{sync::Arc, time::SystemTime};

use dashmap::DashMap;
use hearth_common::MessageId;
use hearth_tracing::traced;

use crate::types::RetryQueueItem;

/// Messages awaiting another delivery attempt, keyed by message id
///
/// Local to one process. Callers serialize mutations of a given entry with
/// the distributed message lock; the map itself only guarantees that each
/// individual operation is atomic.
#[derive(Debug, Clone, Default)]
pub struct RetryQueue {
    pub(crate) queue: Arc<DashMap<MessageId, RetryQueueItem>>,
}

impl RetryQueue {
    /// Create a new empty retry queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for a message
    pub fn insert(&self, item: RetryQueueItem) -> Option<RetryQueueItem> {
        self.queue.insert(item.message.id, item)
    }

    pub fn get(&self, message_id: &MessageId) -> Option<RetryQueueItem> {
        self.queue
            .get(message_id)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.queue.contains_key(message_id)
    }

    /// Remove a message from the queue
    pub fn remove(&self, message_id: &MessageId) -> Option<RetryQueueItem> {
        self.queue.remove(message_id).map(|(_, item)| item)
    }

    /// Record a failed retry attempt
    ///
    /// The attempt count grows until it reaches `max_retries` and stays
    /// there. A transition context, if any, counts every failure.
    pub fn record_failure(
        &self,
        message_id: &MessageId,
        error: String,
        max_retries: u32,
        now: SystemTime,
    ) {
        if let Some(mut entry) = self.queue.get_mut(message_id) {
            let item = entry.value_mut();
            if item.attempts < max_retries {
                item.attempts += 1;
            }
            item.last_attempt = now;
            item.error = error;
            if let Some(transition) = item.transition.as_mut() {
                transition.retry_count += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Snapshot of every queued item, oldest message first
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub fn all_items(&self) -> Vec<RetryQueueItem> {
        let mut items: Vec<RetryQueueItem> = self
            .queue
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by_key(|item| item.message.id);
        items
    }
}
