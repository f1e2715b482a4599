//! Re-queueing dead letters and reporting on them

use std::time::SystemTime;

use hearth_common::{Message, MessageId, MessageStatus, ThreadId, internal, tracing};
use hearth_store::FailedMessage;
use hearth_tracing::traced;

use super::Recovery;
use crate::{
    error::DeliveryError,
    lock::{message_key, thread_key},
    types::{FailedMessageStats, KeyTransitionContext, RetryQueueItem},
};

const RECOVERABLE: [MessageStatus; 2] = [MessageStatus::Failed, MessageStatus::TransitionFailed];

const UNRESOLVED: [MessageStatus; 3] = [
    MessageStatus::Failed,
    MessageStatus::TransitionFailed,
    MessageStatus::TransitionPending,
];

impl Recovery {
    /// Put every dead letter of a thread back on the retry queue
    ///
    /// Rows stored under an old key version get a fresh key transition.
    /// Returns the number of messages queued, which is 0 when another worker
    /// is already recovering the thread.
    ///
    /// # Errors
    /// If the lock service or the store fails
    #[traced(instrument(level = tracing::Level::TRACE, skip(self)), timing(precision = "ms"))]
    pub async fn recover_failed_messages(&self, thread_id: &ThreadId) -> Result<usize, DeliveryError> {
        let Some(lease) = self
            .lease(thread_key(thread_id), self.policy.lock_ttl())
            .await?
        else {
            tracing::warn!(thread_id = %thread_id, "Thread recovery already in progress elsewhere");
            return Ok(0);
        };

        let result = self.recover_thread_locked(thread_id).await;
        lease.release().await;
        result
    }

    async fn recover_thread_locked(&self, thread_id: &ThreadId) -> Result<usize, DeliveryError> {
        let rows = self.store.failed_in_thread(thread_id, &RECOVERABLE).await?;
        let current = self.encryption.current_key_version().await;
        let now = SystemTime::now();

        let recovered = rows
            .iter()
            .filter(|row| self.requeue_row(row, &current, now))
            .count();

        internal!(
            level = INFO,
            "Re-queued {} of {} dead letters in thread {}",
            recovered,
            rows.len(),
            thread_id
        );

        Ok(recovered)
    }

    /// Put a single dead letter back on the retry queue
    ///
    /// Returns `false` if there is no such row, the row is not in a failure
    /// status, the message is already queued, or another worker holds it.
    ///
    /// # Errors
    /// If the lock service or the store fails
    pub async fn requeue_failed_message(&self, message_id: &MessageId) -> Result<bool, DeliveryError> {
        let Some(lease) = self
            .lease(message_key(message_id), self.policy.lock_ttl())
            .await?
        else {
            tracing::warn!(message_id = %message_id, "Message is locked by another worker, not re-queueing");
            return Ok(false);
        };

        let result = self.requeue_locked(message_id).await;
        lease.release().await;
        result
    }

    async fn requeue_locked(&self, message_id: &MessageId) -> Result<bool, DeliveryError> {
        let Some(row) = self.store.get_failed(&message_id.to_string()).await? else {
            return Ok(false);
        };
        if !row.status.is_dead_lettered() {
            return Ok(false);
        }

        let current = self.encryption.current_key_version().await;
        Ok(self.requeue_row(&row, &current, SystemTime::now()))
    }

    /// Rebuild the message of a dead-letter row and queue it for an
    /// immediate attempt
    fn requeue_row(&self, row: &FailedMessage, current_version: &str, now: SystemTime) -> bool {
        let id = match row.message_id.parse::<MessageId>() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    message_id = %row.message_id,
                    thread_id = %row.thread_id,
                    error = %e,
                    "Skipping dead letter with unreadable id"
                );
                return false;
            }
        };

        if self.queue.contains(&id) {
            tracing::debug!(message_id = %id, "Dead letter already queued");
            return false;
        }

        let transition = row
            .needs_key_transition(current_version)
            .then(|| KeyTransitionContext {
                from_version: row.encryption_key_version.clone(),
                to_version: current_version.to_string(),
                key_id: None,
                transition_started: now,
                retry_count: 0,
            });

        self.queue.insert(RetryQueueItem {
            message: Message {
                id,
                thread_id: row.thread_id.clone(),
                sender_id: row.sender_id.clone(),
                recipient_id: row.recipient_id.clone(),
                content: row.content.clone(),
                timestamp: SystemTime::from(row.sent_at),
            },
            attempts: 0,
            last_attempt: SystemTime::UNIX_EPOCH,
            error: row.error.clone(),
            transition,
        });

        true
    }

    /// Counts of a thread's unresolved dead letters
    ///
    /// # Errors
    /// If the store cannot be read
    pub async fn get_failed_message_stats(
        &self,
        thread_id: &ThreadId,
    ) -> Result<FailedMessageStats, DeliveryError> {
        let rows = self.store.failed_in_thread(thread_id, &UNRESOLVED).await?;
        let current = self.encryption.current_key_version().await;

        Ok(FailedMessageStats {
            total: rows.len(),
            needs_key_transition: rows
                .iter()
                .filter(|row| row.needs_key_transition(&current))
                .count(),
            in_transition: rows
                .iter()
                .filter(|row| row.status == MessageStatus::TransitionPending)
                .count(),
        })
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_items(&self) -> Vec<RetryQueueItem> {
        self.queue.all_items()
    }

    pub fn queued_item(&self, message_id: &MessageId) -> Option<RetryQueueItem> {
        self.queue.get(message_id)
    }
}
