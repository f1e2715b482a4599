//! Retry, key-transition and dead-letter handling for failed deliveries
//!
//! A [`Recovery`] owns the process-local retry queue and drives it from a
//! background processor. Every mutation of a message's retry state happens
//! under a lease on that message, so several instances sharing one store
//! and one lock service never work the same message at the same time.

mod bulk;
mod dead_letter;
mod process;
mod retry;

use std::{sync::Arc, time::Duration};

use hearth_common::{Message, MessageStatus, Signal, internal, outgoing, tracing};
use hearth_store::MessageStore;
use hearth_tracing::traced;

use crate::{
    crypto::EncryptionProvider,
    error::{DeliveryError, LockError, SystemError},
    lock::{Lease, LockService},
    policy::RetryPolicy,
    queue::RetryQueue,
    transport::{Transport, TransportEvent},
    writer::MessageWriter,
};

/// Recovery service for failed message deliveries
#[derive(Debug)]
pub struct Recovery {
    store: Arc<dyn MessageStore>,
    locks: Arc<dyn LockService>,
    encryption: Arc<dyn EncryptionProvider>,
    transport: Arc<dyn Transport>,
    writer: Arc<MessageWriter>,
    policy: RetryPolicy,
    queue: RetryQueue,
    instance_id: String,
}

/// Wires the collaborators of a [`Recovery`]
#[derive(Debug, Default)]
pub struct RecoveryBuilder {
    store: Option<Arc<dyn MessageStore>>,
    locks: Option<Arc<dyn LockService>>,
    encryption: Option<Arc<dyn EncryptionProvider>>,
    transport: Option<Arc<dyn Transport>>,
    policy: RetryPolicy,
    instance_id: Option<String>,
}

impl RecoveryBuilder {
    #[must_use]
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn locks(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = Some(locks);
        self
    }

    #[must_use]
    pub fn encryption(mut self, encryption: Arc<dyn EncryptionProvider>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Prefix of every lease holder id taken by this instance
    ///
    /// Defaults to `process-<pid>`.
    #[must_use]
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// # Errors
    /// If a collaborator is missing or the policy is invalid
    pub fn build(self) -> Result<Recovery, SystemError> {
        self.policy.validate()?;

        let store = self
            .store
            .ok_or_else(|| SystemError::NotInitialized("message store".to_string()))?;
        let locks = self
            .locks
            .ok_or_else(|| SystemError::NotInitialized("lock service".to_string()))?;
        let encryption = self
            .encryption
            .ok_or_else(|| SystemError::NotInitialized("encryption provider".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| SystemError::NotInitialized("transport".to_string()))?;

        let writer = Arc::new(MessageWriter::new(
            Arc::clone(&store),
            Arc::clone(&encryption),
        ));

        Ok(Recovery {
            store,
            locks,
            encryption,
            transport,
            writer,
            policy: self.policy,
            queue: RetryQueue::new(),
            instance_id: self
                .instance_id
                .unwrap_or_else(|| format!("process-{}", std::process::id())),
        })
    }
}

impl Recovery {
    #[must_use]
    pub fn builder() -> RecoveryBuilder {
        RecoveryBuilder::default()
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn encryption(&self) -> &Arc<dyn EncryptionProvider> {
        &self.encryption
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn writer(&self) -> &Arc<MessageWriter> {
        &self.writer
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub const fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Lease `key` under a holder id unique to this call
    async fn lease(&self, key: String, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let holder = format!("{}:{}", self.instance_id, ulid::Ulid::new());
        Lease::acquire(&self.locks, key, holder, ttl).await
    }

    /// Tell the sender of `message` about its new status, if they are online
    fn notify_sender(&self, message: &Message, status: MessageStatus) {
        if !self.transport.is_connected(&message.sender_id) {
            return;
        }

        let event = TransportEvent::StatusChanged {
            message_id: message.id,
            thread_id: message.thread_id.clone(),
            status,
        };
        if self.transport.push(&message.sender_id, event) {
            outgoing!(
                message = message,
                level = DEBUG,
                "Notified {} of status {}",
                message.sender_id,
                status
            );
        }
    }

    /// Run the background processor until a shutdown signal arrives
    ///
    /// Every `process_interval` the queue is walked once: expired key
    /// transitions and exhausted messages are dead-lettered and due messages
    /// are retried. A tick in progress runs to completion before shutdown is
    /// acknowledged.
    ///
    /// # Errors
    /// Currently infallible; kept fallible for backends that need setup
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!("Recovery processor starting");

        let mut process_timer = tokio::time::interval(self.policy.process_interval());
        process_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Skip the first tick to avoid immediate execution
        process_timer.tick().await;

        loop {
            tokio::select! {
                _ = process_timer.tick() => {
                    let handled = self.process_queue().await;
                    if handled > 0 {
                        tracing::debug!(handled, remaining = self.queue.len(), "Processed retry queue");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Recovery processor received shutdown signal");
                            if !self.queue.is_empty() {
                                tracing::warn!(
                                    queued = self.queue.len(),
                                    "Retry queue is not persisted, queued messages are dropped"
                                );
                            }
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Recovery processor shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        internal!("Recovery processor shutdown complete");
        Ok(())
    }
}
