use std::sync::{Arc, RwLock};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hearth_common::{MessageStatus, ThreadId, UserId};

use crate::{
    StoreError,
    r#trait::MessageStore,
    types::{FailedMessage, KeyTransitionRecord, MessageRecord},
};

#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) messages: AHashMap<String, MessageRecord>,
    pub(crate) failed: AHashMap<String, FailedMessage>,
}

/// In-memory store implementation
///
/// Both tables live in `HashMap`s behind a single `RwLock`. Cloning the
/// store shares the tables, which is how tests model several server
/// instances talking to one database.
///
/// # Capacity Management
/// An optional capacity bounds the `messages` table. Inserting a new row
/// past the limit fails with [`StoreError::CapacityExceeded`]; replacing an
/// existing row always succeeds.
#[derive(Debug, Clone)]
pub struct MemoryMessageStore {
    pub(crate) tables: Arc<RwLock<Tables>>,
    capacity: Option<usize>,
}

impl MemoryMessageStore {
    /// Create a new empty store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            capacity: None,
        }
    }

    /// Create a new store whose `messages` table holds at most `capacity` rows
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            capacity: Some(capacity),
        }
    }

    /// Number of rows in the `messages` table
    ///
    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .messages
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of rows in the `failed_messages` table, whatever their status
    #[must_use]
    pub fn failed_len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .failed
            .len()
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn put_message(&self, record: &MessageRecord) -> crate::Result<()> {
        let mut tables = self.tables.write()?;

        if let Some(capacity) = self.capacity
            && !tables.messages.contains_key(&record.id)
            && tables.messages.len() >= capacity
        {
            return Err(StoreError::CapacityExceeded {
                used: tables.messages.len(),
                capacity,
            });
        }

        tables.messages.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_message(&self, id: &str) -> crate::Result<Option<MessageRecord>> {
        Ok(self.tables.read()?.messages.get(id).cloned())
    }

    async fn count_messages_before(
        &self,
        thread_id: &ThreadId,
        before: DateTime<Utc>,
    ) -> crate::Result<u64> {
        let count = self
            .tables
            .read()?
            .messages
            .values()
            .filter(|record| &record.thread_id == thread_id && record.created_at < before)
            .count();

        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn messages_in_thread(&self, thread_id: &ThreadId) -> crate::Result<Vec<MessageRecord>> {
        let mut records: Vec<_> = self
            .tables
            .read()?
            .messages
            .values()
            .filter(|record| &record.thread_id == thread_id)
            .cloned()
            .collect();

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn upsert_failed(&self, failed: &FailedMessage) -> crate::Result<()> {
        self.tables
            .write()?
            .failed
            .insert(failed.message_id.clone(), failed.clone());
        Ok(())
    }

    async fn get_failed(&self, message_id: &str) -> crate::Result<Option<FailedMessage>> {
        Ok(self.tables.read()?.failed.get(message_id).cloned())
    }

    async fn update_failed(
        &self,
        message_id: &str,
        status: MessageStatus,
        transition: Option<KeyTransitionRecord>,
    ) -> crate::Result<bool> {
        let mut tables = self.tables.write()?;
        let Some(row) = tables.failed.get_mut(message_id) else {
            return Ok(false);
        };

        row.status = status;
        row.updated_at = Utc::now();
        if let Some(transition) = transition {
            row.encryption_key_version.clone_from(&transition.to_version);
            row.push_transition(transition);
        }

        Ok(true)
    }

    async fn failed_in_thread(
        &self,
        thread_id: &ThreadId,
        statuses: &[MessageStatus],
    ) -> crate::Result<Vec<FailedMessage>> {
        let mut rows: Vec<_> = self
            .tables
            .read()?
            .failed
            .values()
            .filter(|row| &row.thread_id == thread_id && statuses.contains(&row.status))
            .cloned()
            .collect();

        rows.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.message_id.cmp(&b.message_id)));
        Ok(rows)
    }

    async fn thread_participants(&self, thread_id: &ThreadId) -> crate::Result<Vec<UserId>> {
        let tables = self.tables.read()?;

        let delivered = tables
            .messages
            .values()
            .filter(|record| &record.thread_id == thread_id)
            .flat_map(|record| [record.sender_id.clone(), record.recipient_id.clone()]);
        let failed = tables
            .failed
            .values()
            .filter(|row| &row.thread_id == thread_id)
            .flat_map(|row| [row.sender_id.clone(), row.recipient_id.clone()]);

        let unique: AHashSet<UserId> = delivered.chain(failed).collect();
        let mut participants: Vec<_> = unique.into_iter().collect();
        participants.sort();
        Ok(participants)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use hearth_common::MessageId;
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(thread: &str, created_at: DateTime<Utc>) -> MessageRecord {
        MessageRecord {
            id: MessageId::generate().to_string(),
            thread_id: ThreadId::from(thread),
            sender_id: UserId::from("alice"),
            recipient_id: UserId::from("bob"),
            content: "ciphertext".to_string(),
            iv: Some("iv".to_string()),
            proof: None,
            message_number: 1,
            previous_chain_length: 0,
            status: MessageStatus::Sent,
            created_at,
            updated_at: created_at,
        }
    }

    fn failed(thread: &str, status: MessageStatus) -> FailedMessage {
        let now = Utc::now();
        FailedMessage {
            message_id: MessageId::generate().to_string(),
            thread_id: ThreadId::from(thread),
            content: "hello".to_string(),
            sender_id: UserId::from("alice"),
            recipient_id: UserId::from("carol"),
            status,
            error: "store unavailable".to_string(),
            retry_count: 3,
            encryption_key_version: "v1".to_string(),
            key_transitions: Vec::new(),
            sent_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let store = MemoryMessageStore::new();
        let row = record("t1", Utc::now());

        store.put_message(&row).await.expect("write");
        assert_eq!(store.get_message(&row.id).await.expect("read"), Some(row));
        assert_eq!(store.len(), 1);
        assert!(store.get_message("missing").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_count_messages_before_is_strict_and_per_thread() {
        let store = MemoryMessageStore::new();
        let base = Utc::now();

        store.put_message(&record("t1", base - Duration::seconds(10))).await.expect("write");
        store.put_message(&record("t1", base - Duration::seconds(5))).await.expect("write");
        store.put_message(&record("t1", base)).await.expect("write");
        store.put_message(&record("t2", base - Duration::seconds(10))).await.expect("write");

        let t1 = ThreadId::from("t1");
        assert_eq!(store.count_messages_before(&t1, base).await.expect("count"), 2);
        assert_eq!(
            store
                .count_messages_before(&t1, base - Duration::seconds(10))
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn test_capacity_limit_applies_to_new_rows_only() {
        let store = MemoryMessageStore::with_capacity(1);
        let mut row = record("t1", Utc::now());

        store.put_message(&row).await.expect("first write");
        let err = store
            .put_message(&record("t1", Utc::now()))
            .await
            .expect_err("second row exceeds capacity");
        assert!(err.to_string().contains("capacity exceeded"));

        row.status = MessageStatus::Recovered;
        store.put_message(&row).await.expect("replacing a row is allowed");
    }

    #[tokio::test]
    async fn test_update_failed_records_each_transition_once() {
        let store = MemoryMessageStore::new();
        let row = failed("t1", MessageStatus::Failed);
        store.upsert_failed(&row).await.expect("write");

        let updated = store
            .update_failed(
                &row.message_id,
                MessageStatus::TransitionPending,
                Some(KeyTransitionRecord {
                    from_version: "v1".to_string(),
                    to_version: "v2".to_string(),
                    timestamp: Utc::now(),
                }),
            )
            .await
            .expect("update");
        assert!(updated);

        let stored = store
            .get_failed(&row.message_id)
            .await
            .expect("read")
            .expect("row exists");
        assert_eq!(stored.status, MessageStatus::TransitionPending);
        assert_eq!(stored.encryption_key_version, "v2");
        assert_eq!(stored.key_transitions.len(), 1);

        let step = |from: &str, to: &str| KeyTransitionRecord {
            from_version: from.to_string(),
            to_version: to.to_string(),
            timestamp: Utc::now(),
        };
        store
            .update_failed(&row.message_id, MessageStatus::TransitionPending, Some(step("v1", "v2")))
            .await
            .expect("repeat update");
        store
            .update_failed(&row.message_id, MessageStatus::TransitionPending, Some(step("v2", "v3")))
            .await
            .expect("next step");

        let stored = store
            .get_failed(&row.message_id)
            .await
            .expect("read")
            .expect("row exists");
        let steps: Vec<_> = stored
            .key_transitions
            .iter()
            .map(|t| (t.from_version.as_str(), t.to_version.as_str()))
            .collect();
        assert_eq!(steps, [("v1", "v2"), ("v2", "v3")]);
        assert_eq!(stored.encryption_key_version, "v3");

        assert!(
            !store
                .update_failed("missing", MessageStatus::Recovered, None)
                .await
                .expect("update")
        );
    }

    #[tokio::test]
    async fn test_failed_in_thread_filters_by_status() {
        let store = MemoryMessageStore::new();
        store.upsert_failed(&failed("t1", MessageStatus::Failed)).await.expect("write");
        store
            .upsert_failed(&failed("t1", MessageStatus::TransitionFailed))
            .await
            .expect("write");
        store.upsert_failed(&failed("t1", MessageStatus::Recovered)).await.expect("write");
        store.upsert_failed(&failed("t2", MessageStatus::Failed)).await.expect("write");

        let rows = store
            .failed_in_thread(
                &ThreadId::from("t1"),
                &[MessageStatus::Failed, MessageStatus::TransitionFailed],
            )
            .await
            .expect("query");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.status.is_dead_lettered()));
    }

    #[tokio::test]
    async fn test_thread_participants_spans_both_tables() {
        let store = MemoryMessageStore::new();
        store.put_message(&record("t1", Utc::now())).await.expect("write");
        store.upsert_failed(&failed("t1", MessageStatus::Failed)).await.expect("write");
        store.upsert_failed(&failed("t2", MessageStatus::Failed)).await.expect("write");

        let participants = store
            .thread_participants(&ThreadId::from("t1"))
            .await
            .expect("query");
        assert_eq!(
            participants,
            vec![UserId::from("alice"), UserId::from("bob"), UserId::from("carol")]
        );
    }
}
