use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{MessageId, ThreadId, UserId};

/// An outbound chat message
///
/// `content` is plaintext here. The `messages` table only ever receives the
/// ciphertext produced by the encryption provider. A dead-letter row keeps
/// this plaintext, since re-encrypting under a newer key version starts
/// from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub timestamp: SystemTime,
}

impl Message {
    /// Create a message with a fresh id, timestamped now
    #[must_use]
    pub fn new(
        thread_id: impl Into<ThreadId>,
        sender_id: impl Into<UserId>,
        recipient_id: impl Into<UserId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            thread_id: thread_id.into(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            content: content.into(),
            timestamp: SystemTime::now(),
        }
    }
}
