//! Encrypt-and-persist path shared by first sends and retries

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hearth_common::{Message, MessageStatus, ThreadId};
use hearth_store::{MessageRecord, MessageStore};

use crate::{
    crypto::{EncryptionProvider, SessionContext},
    error::DeliveryError,
    transport::DeliveredMessage,
};

/// Writes messages to the `messages` table
///
/// Owns the per-thread message counter. Numbers are handed out before the
/// write, so a failed write leaves a gap and a retry gets a fresh number.
#[derive(Debug)]
pub struct MessageWriter {
    store: Arc<dyn MessageStore>,
    encryption: Arc<dyn EncryptionProvider>,
    counters: DashMap<ThreadId, u64>,
}

impl MessageWriter {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, encryption: Arc<dyn EncryptionProvider>) -> Self {
        Self {
            store,
            encryption,
            counters: DashMap::new(),
        }
    }

    /// Reserve the next message number of a thread, starting at 1
    pub fn next_message_number(&self, thread_id: &ThreadId) -> u64 {
        let mut counter = self.counters.entry(thread_id.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Persist `message` with `status`
    ///
    /// With `ciphertext` the content is stored as given (the output of a key
    /// re-encryption); otherwise the plaintext is encrypted with the session
    /// key first.
    ///
    /// # Errors
    /// If encryption or the store write fails
    pub async fn write(
        &self,
        message: &Message,
        ciphertext: Option<String>,
        status: MessageStatus,
    ) -> Result<MessageRecord, DeliveryError> {
        let message_number = self.next_message_number(&message.thread_id);
        let created_at = DateTime::<Utc>::from(message.timestamp);
        let previous_chain_length = self
            .store
            .count_messages_before(&message.thread_id, created_at)
            .await?;

        let (content, iv, proof) = match ciphertext {
            Some(content) => (content, None, None),
            None => {
                let context = SessionContext {
                    message_id: message.id,
                    sender_id: message.sender_id.clone(),
                    thread_id: message.thread_id.clone(),
                    message_number,
                    previous_chain_length,
                };
                let payload = self
                    .encryption
                    .encrypt_with_session_key(&message.content, &message.recipient_id, &context)
                    .await?;
                (payload.encrypted_content, Some(payload.iv), Some(payload.proof))
            }
        };

        let record = MessageRecord {
            id: message.id.to_string(),
            thread_id: message.thread_id.clone(),
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            content,
            iv,
            proof,
            message_number,
            previous_chain_length,
            status,
            created_at,
            updated_at: Utc::now(),
        };

        self.store.put_message(&record).await?;
        Ok(record)
    }
}

impl DeliveredMessage {
    /// What the recipient receives for a persisted `record` of `message`
    #[must_use]
    pub fn from_record(message: &Message, record: &MessageRecord) -> Self {
        Self {
            id: message.id,
            thread_id: record.thread_id.clone(),
            sender_id: record.sender_id.clone(),
            encrypted_content: record.content.clone(),
            iv: record.iv.clone(),
            proof: record.proof.clone(),
            message_number: record.message_number,
            previous_chain_length: record.previous_chain_length,
            created_at: record.created_at,
        }
    }
}
