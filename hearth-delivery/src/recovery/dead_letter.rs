//! Dead-lettering of messages that cannot be delivered

use chrono::{DateTime, Utc};
use hearth_common::{Message, MessageStatus, tracing};
use hearth_store::{FailedMessage, KeyTransitionRecord};

use super::Recovery;
use crate::{error::DeliveryError, lock::message_key, types::KeyTransitionContext};

impl Recovery {
    /// Move a message from the retry queue to the dead-letter table
    ///
    /// The row gets status `TransitionFailed` when a key transition was in
    /// progress and `Failed` otherwise. Returns `false` without changing
    /// anything if another worker holds the message.
    ///
    /// # Errors
    /// If the lock service or the store fails; the queue entry is kept
    pub async fn handle_max_retries_exceeded(
        &self,
        message: Message,
        transition: Option<KeyTransitionContext>,
        attempts: u32,
        error: String,
    ) -> Result<bool, DeliveryError> {
        let Some(lease) = self
            .lease(message_key(&message.id), self.policy.lock_ttl())
            .await?
        else {
            tracing::warn!(
                message_id = %message.id,
                thread_id = %message.thread_id,
                "Message is locked by another worker, not dead-lettering"
            );
            return Ok(false);
        };

        let result = self
            .dead_letter_locked(&message, transition.as_ref(), attempts, &error)
            .await;
        lease.release().await;
        result.map(|()| true)
    }

    /// Dead-letter while already holding the message lease
    pub(super) async fn dead_letter_locked(
        &self,
        message: &Message,
        transition: Option<&KeyTransitionContext>,
        attempts: u32,
        error: &str,
    ) -> Result<(), DeliveryError> {
        let message_id = message.id.to_string();
        let existing = self.store.get_failed(&message_id).await?;
        let now = Utc::now();

        let status = if transition.is_some() {
            MessageStatus::TransitionFailed
        } else {
            MessageStatus::Failed
        };

        let encryption_key_version = match (&existing, transition) {
            (Some(row), _) => row.encryption_key_version.clone(),
            (None, Some(transition)) => transition.from_version.clone(),
            (None, None) => self.encryption.current_key_version().await,
        };

        let key_transitions = existing
            .as_ref()
            .map(|row| row.key_transitions.clone())
            .unwrap_or_default();

        let mut row = FailedMessage {
            message_id,
            thread_id: message.thread_id.clone(),
            content: message.content.clone(),
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            status,
            error: error.to_string(),
            retry_count: attempts,
            encryption_key_version,
            key_transitions,
            sent_at: DateTime::<Utc>::from(message.timestamp),
            created_at: existing.as_ref().map_or(now, |row| row.created_at),
            updated_at: now,
        };
        if let Some(transition) = transition {
            row.push_transition(KeyTransitionRecord {
                from_version: transition.from_version.clone(),
                to_version: transition.to_version.clone(),
                timestamp: now,
            });
        }

        if let Err(e) = self.store.upsert_failed(&row).await {
            tracing::error!(
                message_id = %message.id,
                thread_id = %message.thread_id,
                error = %e,
                "Failed to dead-letter message, keeping it queued"
            );
            return Err(e.into());
        }

        self.queue.remove(&message.id);

        tracing::error!(
            message_id = %message.id,
            thread_id = %message.thread_id,
            attempts,
            status = %status,
            error = %error,
            "Message dead-lettered"
        );

        self.notify_sender(message, status);
        Ok(())
    }
}
