//! Queueing and single retry attempts

use std::time::{Instant, SystemTime};

use chrono::Utc;
use hearth_common::{Message, MessageStatus, tracing};
use hearth_store::KeyTransitionRecord;

use super::Recovery;
use crate::{
    error::DeliveryError,
    lock::{message_key, transition_key},
    transport::{DeliveredMessage, TransportEvent},
    types::{KeyTransitionContext, QueueOutcome, RetryOutcome, RetryQueueItem},
};

impl Recovery {
    /// Put a message that failed to deliver on the retry queue
    ///
    /// An entry that has already used its retry budget is dead-lettered
    /// instead. When `transition` is `None` an existing entry keeps its
    /// transition.
    ///
    /// # Errors
    /// If the lock service or, when dead-lettering, the store fails
    pub async fn queue_for_retry(
        &self,
        message: Message,
        error: String,
        transition: Option<KeyTransitionContext>,
    ) -> Result<QueueOutcome, DeliveryError> {
        let lease = match self
            .lease(message_key(&message.id), self.policy.lock_ttl())
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::warn!(
                    message_id = %message.id,
                    thread_id = %message.thread_id,
                    "Message is locked by another worker, not queueing"
                );
                return Ok(QueueOutcome::Contended);
            }
            Err(e) => {
                tracing::error!(
                    message_id = %message.id,
                    error = %e,
                    "Failed to lock message for queueing"
                );
                return Err(e.into());
            }
        };

        let result = self.queue_locked(message, error, transition).await;
        lease.release().await;
        result
    }

    async fn queue_locked(
        &self,
        message: Message,
        error: String,
        transition: Option<KeyTransitionContext>,
    ) -> Result<QueueOutcome, DeliveryError> {
        let existing = self.queue.get(&message.id);

        if let Some(existing) = &existing
            && self.policy.is_exhausted(existing.attempts)
        {
            let transition = transition.or_else(|| existing.transition.clone());
            self.dead_letter_locked(&message, transition.as_ref(), existing.attempts, &error)
                .await?;
            return Ok(QueueOutcome::DeadLettered);
        }

        let (attempts, transition) = match existing {
            Some(existing) => (existing.attempts + 1, transition.or(existing.transition)),
            None => (1, transition),
        };

        tracing::info!(
            message_id = %message.id,
            thread_id = %message.thread_id,
            attempts,
            error = %error,
            "Queued message for retry"
        );

        self.queue.insert(RetryQueueItem {
            message,
            attempts,
            last_attempt: SystemTime::now(),
            error,
            transition,
        });

        Ok(QueueOutcome::Queued { attempts })
    }

    /// Retry delivery of a queued message now
    ///
    /// # Errors
    /// If the message lock cannot be requested. Failures of the attempt
    /// itself are recorded on the queue entry and reported as
    /// [`RetryOutcome::Failed`].
    pub async fn retry_message(&self, item: RetryQueueItem) -> Result<RetryOutcome, DeliveryError> {
        self.retry_message_at(item, SystemTime::now()).await
    }

    /// [`Recovery::retry_message`] with an explicit clock reading
    ///
    /// `now` is when the attempt starts. A failure is recorded as of the
    /// moment the attempt finished, which is where the next backoff
    /// interval counts from.
    ///
    /// # Errors
    /// If the message lock cannot be requested
    pub async fn retry_message_at(
        &self,
        item: RetryQueueItem,
        now: SystemTime,
    ) -> Result<RetryOutcome, DeliveryError> {
        let Some(lease) = self
            .lease(message_key(&item.message.id), self.policy.lock_ttl())
            .await?
        else {
            tracing::warn!(
                message_id = %item.message.id,
                thread_id = %item.message.thread_id,
                "Message is locked by another worker, skipping retry"
            );
            return Ok(RetryOutcome::Contended);
        };

        let started = Instant::now();
        let outcome = match self.deliver_locked(&item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    message_id = %item.message.id,
                    thread_id = %item.message.thread_id,
                    attempts = item.attempts,
                    error = %e,
                    "Retry attempt failed"
                );
                self.queue.record_failure(
                    &item.message.id,
                    e.to_string(),
                    self.policy.max_retries,
                    now + started.elapsed(),
                );
                RetryOutcome::Failed
            }
        };

        lease.release().await;
        Ok(outcome)
    }

    async fn deliver_locked(&self, item: &RetryQueueItem) -> Result<RetryOutcome, DeliveryError> {
        let message = &item.message;
        let message_id = message.id.to_string();

        // A message may already have made it to the store, e.g. through
        // another instance's queue
        if self.store.get_message(&message_id).await?.is_some() {
            self.store
                .update_failed(&message_id, MessageStatus::Recovered, None)
                .await?;
            self.queue.remove(&message.id);
            tracing::debug!(message_id = %message.id, "Message already persisted, dropping retry");
            return Ok(RetryOutcome::Delivered);
        }

        let ciphertext = match &item.transition {
            Some(transition) => {
                let Some(lease) = self
                    .lease(transition_key(&message.id), self.policy.transition_timeout())
                    .await?
                else {
                    tracing::warn!(
                        message_id = %message.id,
                        from = %transition.from_version,
                        to = %transition.to_version,
                        "Key transition is locked by another worker, skipping retry"
                    );
                    return Ok(RetryOutcome::Contended);
                };

                let result = self.transition_locked(message, transition).await;
                lease.release().await;
                Some(result?)
            }
            None => None,
        };

        let record = self
            .writer
            .write(message, ciphertext, MessageStatus::Recovered)
            .await?;

        if self
            .store
            .update_failed(&message_id, MessageStatus::Recovered, None)
            .await?
        {
            tracing::debug!(message_id = %message.id, "Dead letter marked recovered");
        }

        self.queue.remove(&message.id);

        tracing::info!(
            message_id = %message.id,
            thread_id = %message.thread_id,
            attempts = item.attempts,
            message_number = record.message_number,
            "Message recovered"
        );

        if self.transport.is_connected(&message.recipient_id) {
            self.transport.push(
                &message.recipient_id,
                TransportEvent::Message(DeliveredMessage::from_record(message, &record)),
            );
        }
        self.notify_sender(message, MessageStatus::Recovered);

        Ok(RetryOutcome::Delivered)
    }

    /// Re-encrypt for the new key version and record the step on the
    /// dead-letter row, if there is one
    async fn transition_locked(
        &self,
        message: &Message,
        transition: &KeyTransitionContext,
    ) -> Result<String, DeliveryError> {
        let ciphertext = self
            .encryption
            .re_encrypt_with_new_key(
                &message.content,
                &message.sender_id,
                &message.recipient_id,
                &transition.from_version,
                &transition.to_version,
            )
            .await?;

        let record = KeyTransitionRecord {
            from_version: transition.from_version.clone(),
            to_version: transition.to_version.clone(),
            timestamp: Utc::now(),
        };
        self.store
            .update_failed(
                &message.id.to_string(),
                MessageStatus::TransitionPending,
                Some(record),
            )
            .await?;

        tracing::debug!(
            message_id = %message.id,
            from = %transition.from_version,
            to = %transition.to_version,
            "Re-encrypted message for new key version"
        );

        Ok(ciphertext)
    }
}
