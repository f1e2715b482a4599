//! Row types for the `messages` and `failed_messages` tables

use chrono::{DateTime, Utc};
use hearth_common::{MessageStatus, ThreadId, UserId};
use serde::{Deserialize, Serialize};

/// A row of the `messages` table
///
/// `content` is ciphertext. `iv` and `proof` are absent when the content was
/// produced by a key-version re-encryption rather than a session-key
/// encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub iv: Option<String>,
    pub proof: Option<String>,
    pub message_number: u64,
    pub previous_chain_length: u64,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One step of a key-version transition recorded against a dead letter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTransitionRecord {
    pub from_version: String,
    pub to_version: String,
    pub timestamp: DateTime<Utc>,
}

/// A row of the `failed_messages` (dead-letter) table
///
/// `message_id` is kept as the raw column value; turning it back into a
/// typed id can fail and callers must handle that per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessage {
    pub message_id: String,
    pub thread_id: ThreadId,
    /// Plaintext of the message, the input to re-encryption on recovery
    pub content: String,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub status: MessageStatus,
    pub error: String,
    pub retry_count: u32,
    pub encryption_key_version: String,
    /// Oldest first
    #[serde(default)]
    pub key_transitions: Vec<KeyTransitionRecord>,
    /// When the original message was sent
    pub sent_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FailedMessage {
    /// `true` if the stored ciphertext was produced under a different key
    /// version than `current`
    #[must_use]
    pub fn needs_key_transition(&self, current: &str) -> bool {
        self.encryption_key_version != current
    }

    /// Append `record` to the transition history
    ///
    /// A record repeating the latest step (same `from_version` and
    /// `to_version`) is dropped, so retried attempts at one transition are
    /// recorded once. Returns whether the history grew.
    pub fn push_transition(&mut self, record: KeyTransitionRecord) -> bool {
        let repeated = self.key_transitions.last().is_some_and(|last| {
            last.from_version == record.from_version && last.to_version == record.to_version
        });
        if !repeated {
            self.key_transitions.push(record);
        }
        !repeated
    }
}
