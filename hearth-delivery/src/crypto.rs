//! Encryption provider interface

use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use hearth_common::{MessageId, ThreadId, UserId};
use parking_lot::RwLock;
use tokio::sync::{Notify, RwLockWriteGuard};

use crate::error::CryptoError;

/// Ratchet position of a message within its thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub thread_id: ThreadId,
    pub message_number: u64,
    pub previous_chain_length: u64,
}

/// Output of a session-key encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub id: String,
    pub encrypted_content: String,
    pub iv: String,
    pub proof: String,
}

/// End-to-end encryption for outbound messages
///
/// Key versions are opaque strings; two versions are the same key iff the
/// strings are equal.
#[async_trait]
pub trait EncryptionProvider: Send + Sync + fmt::Debug {
    /// Key version new ciphertext is produced under
    async fn current_key_version(&self) -> String;

    /// Encrypt `plaintext` for `recipient` with the session key
    ///
    /// # Errors
    /// If no session exists or encryption fails
    async fn encrypt_with_session_key(
        &self,
        plaintext: &str,
        recipient: &UserId,
        context: &SessionContext,
    ) -> Result<EncryptedPayload, CryptoError>;

    /// Produce ciphertext of `plaintext` under key version `to`
    ///
    /// # Errors
    /// If either key version is unknown or encryption fails
    async fn re_encrypt_with_new_key(
        &self,
        plaintext: &str,
        sender: &UserId,
        recipient: &UserId,
        from: &str,
        to: &str,
    ) -> Result<String, CryptoError>;
}

/// Deterministic provider for tests
///
/// Ciphertext is `"<version>:<hex plaintext>"`, readable back with
/// [`TestEncryptionProvider::decrypt`]. Failures can be injected, and
/// encryption can be paused to hold an attempt in flight.
#[derive(Debug)]
pub struct TestEncryptionProvider {
    version: RwLock<String>,
    failing_encryptions: AtomicUsize,
    failing_re_encryptions: AtomicUsize,
    encryptions: AtomicUsize,
    re_encryptions: AtomicUsize,
    gate: tokio::sync::RwLock<()>,
    attempted: Notify,
}

impl Default for TestEncryptionProvider {
    fn default() -> Self {
        Self::new("v1")
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl TestEncryptionProvider {
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: RwLock::new(version.into()),
            failing_encryptions: AtomicUsize::new(0),
            failing_re_encryptions: AtomicUsize::new(0),
            encryptions: AtomicUsize::new(0),
            re_encryptions: AtomicUsize::new(0),
            gate: tokio::sync::RwLock::new(()),
            attempted: Notify::new(),
        }
    }

    /// Move the current key version forward
    pub fn rotate_to(&self, version: impl Into<String>) {
        *self.version.write() = version.into();
    }

    /// Make the next `count` session-key encryptions fail
    pub fn fail_encryptions(&self, count: usize) {
        self.failing_encryptions.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` re-encryptions fail
    pub fn fail_re_encryptions(&self, count: usize) {
        self.failing_re_encryptions.store(count, Ordering::SeqCst);
    }

    /// Number of successful session-key encryptions
    pub fn encryption_count(&self) -> usize {
        self.encryptions.load(Ordering::SeqCst)
    }

    /// Number of successful re-encryptions
    pub fn re_encryption_count(&self) -> usize {
        self.re_encryptions.load(Ordering::SeqCst)
    }

    /// Hold every encryption until the returned guard is dropped
    pub async fn pause(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    /// Wait until an encryption of either kind has started
    pub async fn wait_for_attempt(&self) {
        self.attempted.notified().await;
    }

    /// Split test ciphertext back into `(version, plaintext)`
    #[must_use]
    pub fn decrypt(ciphertext: &str) -> Option<(String, String)> {
        let (version, body) = ciphertext.split_once(':')?;
        let bytes = hex::decode(body).ok()?;
        let plaintext = String::from_utf8(bytes).ok()?;
        Some((version.to_string(), plaintext))
    }

    async fn enter(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.attempted.notify_one();
        self.gate.read().await
    }
}

#[async_trait]
impl EncryptionProvider for TestEncryptionProvider {
    async fn current_key_version(&self) -> String {
        self.version.read().clone()
    }

    async fn encrypt_with_session_key(
        &self,
        plaintext: &str,
        recipient: &UserId,
        context: &SessionContext,
    ) -> Result<EncryptedPayload, CryptoError> {
        let _gate = self.enter().await;

        if take_failure(&self.failing_encryptions) {
            return Err(CryptoError::EncryptionFailed(format!(
                "injected failure encrypting {} for {recipient}",
                context.message_id
            )));
        }

        let version = self.version.read().clone();
        self.encryptions.fetch_add(1, Ordering::SeqCst);

        Ok(EncryptedPayload {
            id: context.message_id.to_string(),
            encrypted_content: format!("{version}:{}", hex::encode(plaintext)),
            iv: format!("iv-{}-{}", context.thread_id, context.message_number),
            proof: format!("proof-{}-{recipient}", context.sender_id),
        })
    }

    async fn re_encrypt_with_new_key(
        &self,
        plaintext: &str,
        _sender: &UserId,
        _recipient: &UserId,
        from: &str,
        to: &str,
    ) -> Result<String, CryptoError> {
        let _gate = self.enter().await;

        if take_failure(&self.failing_re_encryptions) {
            return Err(CryptoError::ReEncryptionFailed {
                from: from.to_string(),
                to: to.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        self.re_encryptions.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{to}:{}", hex::encode(plaintext)))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn context() -> SessionContext {
        SessionContext {
            message_id: MessageId::generate(),
            sender_id: UserId::from("alice"),
            thread_id: ThreadId::from("t1"),
            message_number: 4,
            previous_chain_length: 3,
        }
    }

    #[tokio::test]
    async fn test_ciphertext_is_versioned() {
        let provider = TestEncryptionProvider::new("v1");
        let payload = provider
            .encrypt_with_session_key("hello", &UserId::from("bob"), &context())
            .await
            .unwrap();

        assert_eq!(
            TestEncryptionProvider::decrypt(&payload.encrypted_content),
            Some(("v1".to_string(), "hello".to_string()))
        );
        assert_eq!(payload.iv, "iv-t1-4");

        provider.rotate_to("v2");
        assert_eq!(provider.current_key_version().await, "v2");

        let ciphertext = provider
            .re_encrypt_with_new_key(
                "hello",
                &UserId::from("alice"),
                &UserId::from("bob"),
                "v1",
                "v2",
            )
            .await
            .unwrap();
        assert_eq!(ciphertext, "v2:68656c6c6f");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let provider = TestEncryptionProvider::default();
        provider.fail_encryptions(1);

        let recipient = UserId::from("bob");
        assert!(
            provider
                .encrypt_with_session_key("x", &recipient, &context())
                .await
                .is_err()
        );
        assert!(
            provider
                .encrypt_with_session_key("x", &recipient, &context())
                .await
                .is_ok()
        );
        assert_eq!(provider.encryption_count(), 1);

        provider.fail_re_encryptions(1);
        let error = provider
            .re_encrypt_with_new_key("x", &recipient, &recipient, "v1", "v2")
            .await
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "Re-encryption from v1 to v2 failed: injected failure"
        );
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        assert_eq!(TestEncryptionProvider::decrypt("no-separator"), None);
        assert_eq!(TestEncryptionProvider::decrypt("v1:abc"), None);
        assert_eq!(TestEncryptionProvider::decrypt("v1:zz"), None);
        assert_eq!(TestEncryptionProvider::decrypt("v1:ff"), None);
    }
}
