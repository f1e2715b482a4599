//! Entry point for sending messages

use std::sync::Arc;

use dashmap::DashMap;
use hearth_common::{Message, MessageStatus, ThreadId, incoming, tracing};
use hearth_store::MessageRecord;
use hearth_tracing::traced;

use crate::{
    error::DeliveryError,
    recovery::Recovery,
    transport::{DeliveredMessage, TransportEvent},
    types::{FailedMessageStats, QueueOutcome},
};

/// Sends messages and hands failures to [`Recovery`]
#[derive(Debug)]
pub struct DeliveryPipeline {
    recovery: Arc<Recovery>,
    history: DashMap<ThreadId, Vec<Message>>,
}

impl DeliveryPipeline {
    #[must_use]
    pub fn new(recovery: Arc<Recovery>) -> Self {
        Self {
            recovery,
            history: DashMap::new(),
        }
    }

    pub const fn recovery(&self) -> &Arc<Recovery> {
        &self.recovery
    }

    /// Encrypt, persist and push a message
    ///
    /// The recipient being offline is not an error. On failure the message
    /// is queued for retry and the original error is returned.
    ///
    /// # Errors
    /// If encryption or the store write fails
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, fields(message_id = %message.id)))]
    pub async fn send_message(&self, message: Message) -> Result<MessageRecord, DeliveryError> {
        incoming!(
            message = message,
            "Sending from {} to {}",
            message.sender_id,
            message.recipient_id
        );

        match self
            .recovery
            .writer()
            .write(&message, None, MessageStatus::Sent)
            .await
        {
            Ok(record) => {
                let transport = self.recovery.transport();
                if transport.is_connected(&message.recipient_id) {
                    transport.push(
                        &message.recipient_id,
                        TransportEvent::Message(DeliveredMessage::from_record(&message, &record)),
                    );
                }

                self.history
                    .entry(message.thread_id.clone())
                    .or_default()
                    .push(message);

                Ok(record)
            }
            Err(e) => {
                tracing::error!(
                    message_id = %message.id,
                    thread_id = %message.thread_id,
                    sender_id = %message.sender_id,
                    recipient_id = %message.recipient_id,
                    error = %e,
                    "Failed to send message"
                );

                let id = message.id;
                match self
                    .recovery
                    .queue_for_retry(message, e.to_string(), None)
                    .await
                {
                    Ok(QueueOutcome::Queued { attempts }) => {
                        tracing::debug!(message_id = %id, attempts, "Message handed to recovery");
                    }
                    Ok(outcome) => {
                        tracing::warn!(message_id = %id, ?outcome, "Message not queued for retry");
                    }
                    Err(queue_error) => {
                        tracing::error!(
                            message_id = %id,
                            error = %queue_error,
                            "Failed to queue message for retry"
                        );
                    }
                }

                Err(e)
            }
        }
    }

    /// Re-queue a thread's dead letters and tell its online participants
    ///
    /// # Errors
    /// If the lock service or the store fails
    pub async fn recover_thread_messages(&self, thread_id: &ThreadId) -> Result<usize, DeliveryError> {
        let count = self.recovery.recover_failed_messages(thread_id).await?;
        if count == 0 {
            return Ok(0);
        }

        let transport = self.recovery.transport();
        for participant in self.recovery.store().thread_participants(thread_id).await? {
            if transport.is_connected(&participant) {
                transport.push(
                    &participant,
                    TransportEvent::ThreadRecovered {
                        thread_id: thread_id.clone(),
                        count,
                    },
                );
            }
        }

        Ok(count)
    }

    /// # Errors
    /// If the store cannot be read
    pub async fn get_failed_message_stats(
        &self,
        thread_id: &ThreadId,
    ) -> Result<FailedMessageStats, DeliveryError> {
        self.recovery.get_failed_message_stats(thread_id).await
    }

    /// Messages sent through this pipeline in a thread, in send order
    #[must_use]
    pub fn thread_history(&self, thread_id: &ThreadId) -> Vec<Message> {
        self.history
            .get(thread_id)
            .map(|messages| messages.value().clone())
            .unwrap_or_default()
    }
}
