//! Best-effort push to connected clients

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hearth_common::{MessageId, MessageStatus, ThreadId, UserId, tracing};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Ciphertext and chain metadata handed to a recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub encrypted_content: String,
    pub iv: Option<String>,
    pub proof: Option<String>,
    pub message_number: u64,
    pub previous_chain_length: u64,
    pub created_at: DateTime<Utc>,
}

/// Events pushed to connected users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    Message(DeliveredMessage),
    /// Dead letters of a thread were put back on the retry queue
    ThreadRecovered { thread_id: ThreadId, count: usize },
    /// A message the user sent changed status
    StatusChanged {
        message_id: MessageId,
        thread_id: ThreadId,
        status: MessageStatus,
    },
}

/// Realtime channel to users
///
/// Delivery through the transport is best-effort: the store is the source
/// of truth, and a user that is offline picks messages up from there.
pub trait Transport: Send + Sync + fmt::Debug {
    fn is_connected(&self, user: &UserId) -> bool;

    /// Returns `false` if the event was not handed over
    fn push(&self, user: &UserId, event: TransportEvent) -> bool;
}

/// [`Transport`] with one bounded channel per connected user
#[derive(Debug)]
pub struct ChannelTransport {
    connections: DashMap<UserId, mpsc::Sender<TransportEvent>>,
    capacity: usize,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ChannelTransport {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register `user`, replacing any previous connection
    pub fn connect(&self, user: impl Into<UserId>) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.connections.insert(user.into(), tx);
        rx
    }

    pub fn disconnect(&self, user: &UserId) {
        self.connections.remove(user);
    }

    #[must_use]
    pub fn connected_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        users.sort();
        users
    }
}

impl Transport for ChannelTransport {
    fn is_connected(&self, user: &UserId) -> bool {
        self.connections
            .get(user)
            .is_some_and(|tx| !tx.is_closed())
    }

    fn push(&self, user: &UserId, event: TransportEvent) -> bool {
        let Some(tx) = self.connections.get(user).map(|tx| tx.clone()) else {
            return false;
        };

        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(user = %user, "Transport channel full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(user = %user, "Transport channel closed, disconnecting");
                self.connections.remove_if(user, |_, tx| tx.is_closed());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn status_event() -> TransportEvent {
        TransportEvent::StatusChanged {
            message_id: MessageId::generate(),
            thread_id: ThreadId::from("t1"),
            status: MessageStatus::Recovered,
        }
    }

    #[tokio::test]
    async fn test_push_to_connected_user() {
        let transport = ChannelTransport::default();
        let bob = UserId::from("bob");
        let mut rx = transport.connect(bob.clone());

        assert!(transport.is_connected(&bob));
        let event = status_event();
        assert!(transport.push(&bob, event.clone()));
        assert_eq!(rx.recv().await, Some(event));
    }

    #[test]
    fn test_push_to_offline_user() {
        let transport = ChannelTransport::default();
        let bob = UserId::from("bob");

        assert!(!transport.is_connected(&bob));
        assert!(!transport.push(&bob, status_event()));
    }

    #[test]
    fn test_closed_receiver_disconnects() {
        let transport = ChannelTransport::default();
        let bob = UserId::from("bob");
        drop(transport.connect(bob.clone()));

        assert!(!transport.is_connected(&bob));
        assert!(!transport.push(&bob, status_event()));
        assert!(transport.connected_users().is_empty());
    }

    #[test]
    fn test_full_channel_drops_event() {
        let transport = ChannelTransport::new(1);
        let bob = UserId::from("bob");
        let _rx = transport.connect(bob.clone());

        assert!(transport.push(&bob, status_event()));
        assert!(!transport.push(&bob, status_event()));
        assert!(transport.is_connected(&bob));
    }
}
