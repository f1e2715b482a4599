use chrono::{DateTime, Utc};
use hearth_common::{MessageStatus, ThreadId, UserId};

use crate::types::{FailedMessage, KeyTransitionRecord, MessageRecord};

/// Durable storage shared by every server instance
///
/// Implementations must be safe to call concurrently. Writes to a given
/// message id are serialized by the caller's distributed lock, not by the
/// store.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Insert or replace a row of the `messages` table
    ///
    /// # Errors
    /// If the row cannot be written
    async fn put_message(&self, record: &MessageRecord) -> crate::Result<()>;

    /// Fetch a delivered message by id
    ///
    /// # Errors
    /// If the backend cannot be read
    async fn get_message(&self, id: &str) -> crate::Result<Option<MessageRecord>>;

    /// Count delivered messages in `thread_id` created strictly before `before`
    ///
    /// # Errors
    /// If the backend cannot be read
    async fn count_messages_before(
        &self,
        thread_id: &ThreadId,
        before: DateTime<Utc>,
    ) -> crate::Result<u64>;

    /// All delivered messages of a thread, oldest first
    ///
    /// # Errors
    /// If the backend cannot be read
    async fn messages_in_thread(&self, thread_id: &ThreadId) -> crate::Result<Vec<MessageRecord>>;

    /// Insert or replace a dead-letter row
    ///
    /// # Errors
    /// If the row cannot be written
    async fn upsert_failed(&self, failed: &FailedMessage) -> crate::Result<()>;

    /// Fetch a dead-letter row by message id
    ///
    /// # Errors
    /// If the backend cannot be read
    async fn get_failed(&self, message_id: &str) -> crate::Result<Option<FailedMessage>>;

    /// Update the status of an existing dead-letter row
    ///
    /// When `transition` is given, the row's key version becomes its
    /// `to_version` and the record is appended to the transition history,
    /// unless it repeats the latest recorded step.
    /// Returns `false` if there is no row for `message_id`.
    ///
    /// # Errors
    /// If the row cannot be written
    async fn update_failed(
        &self,
        message_id: &str,
        status: MessageStatus,
        transition: Option<KeyTransitionRecord>,
    ) -> crate::Result<bool>;

    /// Dead-letter rows of a thread whose status is one of `statuses`
    ///
    /// # Errors
    /// If the backend cannot be read
    async fn failed_in_thread(
        &self,
        thread_id: &ThreadId,
        statuses: &[MessageStatus],
    ) -> crate::Result<Vec<FailedMessage>>;

    /// Every sender and recipient seen in a thread, across both tables
    ///
    /// # Errors
    /// If the backend cannot be read
    async fn thread_participants(&self, thread_id: &ThreadId) -> crate::Result<Vec<UserId>>;
}
