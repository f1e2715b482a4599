//! Shared fixtures for the hearth-delivery integration tests

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use hearth_common::{Message, MessageId, MessageStatus, ThreadId};
use hearth_delivery::{
    ChannelTransport, DeliveryPipeline, MemoryLockService, Recovery, RetryPolicy,
    TestEncryptionProvider, TransportEvent,
};
use hearth_store::{FailedMessage, MessageStore, TestMessageStore};
use tokio::sync::mpsc;

/// One server instance wired to in-process collaborators
pub struct Harness {
    pub store: Arc<TestMessageStore>,
    pub locks: Arc<MemoryLockService>,
    pub encryption: Arc<TestEncryptionProvider>,
    pub transport: Arc<ChannelTransport>,
    pub recovery: Arc<Recovery>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self::build(
            Arc::new(TestMessageStore::new()),
            Arc::new(MemoryLockService::new()),
            Arc::new(TestEncryptionProvider::new("v1")),
            policy,
            "instance-a",
        )
    }

    /// A second instance sharing this one's store, locks and keys
    pub fn peer(&self, instance_id: &str) -> Self {
        Self::build(
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
            Arc::clone(&self.encryption),
            self.recovery.policy().clone(),
            instance_id,
        )
    }

    fn build(
        store: Arc<TestMessageStore>,
        locks: Arc<MemoryLockService>,
        encryption: Arc<TestEncryptionProvider>,
        policy: RetryPolicy,
        instance_id: &str,
    ) -> Self {
        let transport = Arc::new(ChannelTransport::default());
        let recovery = Recovery::builder()
            .store(store.clone())
            .locks(locks.clone())
            .encryption(encryption.clone())
            .transport(transport.clone())
            .policy(policy)
            .instance_id(instance_id)
            .build()
            .expect("complete wiring");

        Self {
            store,
            locks,
            encryption,
            transport,
            recovery: Arc::new(recovery),
        }
    }

    pub fn pipeline(&self) -> DeliveryPipeline {
        DeliveryPipeline::new(Arc::clone(&self.recovery))
    }

    pub fn connect(&self, user: &str) -> mpsc::Receiver<TransportEvent> {
        self.transport.connect(user)
    }

    pub async fn failed_row(&self, message_id: &MessageId) -> FailedMessage {
        self.store
            .get_failed(&message_id.to_string())
            .await
            .expect("store readable")
            .expect("dead letter exists")
    }

    /// Insert a dead letter as a previous run would have left it
    pub async fn seed_dead_letter(
        &self,
        thread: &str,
        content: &str,
        version: &str,
        status: MessageStatus,
    ) -> MessageId {
        let id = MessageId::generate();
        self.seed_dead_letter_with_id(&id.to_string(), thread, content, version, status)
            .await;
        id
    }

    pub async fn seed_dead_letter_with_id(
        &self,
        message_id: &str,
        thread: &str,
        content: &str,
        version: &str,
        status: MessageStatus,
    ) {
        let now = Utc::now();
        let row = FailedMessage {
            message_id: message_id.to_string(),
            thread_id: ThreadId::from(thread),
            content: content.to_string(),
            sender_id: "alice".into(),
            recipient_id: "bob".into(),
            status,
            error: "Encryption failure: Encryption failed: no session".to_string(),
            retry_count: 3,
            encryption_key_version: version.to_string(),
            key_transitions: Vec::new(),
            sent_at: now - chrono::Duration::seconds(60),
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_failed(&row).await.expect("seeded");
    }
}

pub fn message(thread: &str, content: &str) -> Message {
    Message::new(thread, "alice", "bob", content)
}

/// Next event on `rx`, failing the test if none arrives promptly
pub async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event within a second")
        .expect("channel open")
}
