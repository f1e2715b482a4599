mod support;

use std::time::Duration;

use hearth_common::{MessageStatus, ThreadId};
use hearth_delivery::{DeliveryError, QueueOutcome, TestEncryptionProvider, TransportEvent};
use hearth_store::MessageStore;
use pretty_assertions::assert_eq;
use support::{Harness, message, next_event};

#[tokio::test]
async fn test_send_pushes_ciphertext_to_connected_recipient() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let mut bob = harness.connect("bob");

    let first = message("t1", "hello");
    let mut second = message("t1", "again");
    second.timestamp = first.timestamp + Duration::from_millis(5);

    pipeline.send_message(first.clone()).await.unwrap();
    let record = pipeline.send_message(second.clone()).await.unwrap();
    assert_eq!(record.status, MessageStatus::Sent);
    assert_eq!(record.message_number, 2);
    assert_eq!(record.previous_chain_length, 1);

    let TransportEvent::Message(delivered) = next_event(&mut bob).await else {
        panic!("expected a message");
    };
    assert_eq!(delivered.id, first.id);
    assert_eq!(delivered.message_number, 1);
    assert_eq!(
        TestEncryptionProvider::decrypt(&delivered.encrypted_content),
        Some(("v1".to_string(), "hello".to_string()))
    );
    assert!(delivered.iv.is_some());
    assert!(delivered.proof.is_some());

    let TransportEvent::Message(delivered) = next_event(&mut bob).await else {
        panic!("expected a message");
    };
    assert_eq!(delivered.id, second.id);

    assert_eq!(
        pipeline.thread_history(&ThreadId::from("t1")),
        vec![first, second]
    );
}

#[tokio::test]
async fn test_offline_recipient_is_not_an_error() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let msg = message("t1", "hello");

    pipeline.send_message(msg.clone()).await.unwrap();

    let stored = harness
        .store
        .get_message(&msg.id.to_string())
        .await
        .unwrap()
        .expect("persisted");
    assert_eq!(stored.status, MessageStatus::Sent);
    assert_eq!(harness.recovery.queue_len(), 0);
}

#[tokio::test]
async fn test_encryption_failure_is_returned_and_queued() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    harness.encryption.fail_encryptions(1);
    let msg = message("t1", "hello");

    let error = pipeline.send_message(msg.clone()).await.unwrap_err();
    assert!(matches!(error, DeliveryError::Encryption(_)));
    assert!(error.is_transient());

    let item = harness.recovery.queued_item(&msg.id).expect("queued");
    assert_eq!(item.attempts, 1);
    assert_eq!(item.error, error.to_string());
    assert!(item.transition.is_none());
    assert!(pipeline.thread_history(&msg.thread_id).is_empty());

    // The processor picks it up once the first backoff has passed
    let due = item.last_attempt + Duration::from_millis(1000);
    assert_eq!(harness.recovery.process_queue_at(due).await, 1);
    assert_eq!(harness.recovery.queue_len(), 0);
    assert_eq!(harness.store.message_count(), 1);
}

#[tokio::test]
async fn test_store_failure_is_returned_and_queued() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    harness.store.fail_message_writes(1);
    let msg = message("t1", "hello");

    let error = pipeline.send_message(msg.clone()).await.unwrap_err();
    assert!(matches!(error, DeliveryError::Store(_)));
    assert!(harness.recovery.queued_item(&msg.id).is_some());
    assert_eq!(harness.store.message_count(), 0);
}

#[tokio::test]
async fn test_queueing_failure_keeps_original_error() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    harness.encryption.fail_encryptions(1);
    harness.locks.set_unavailable(true);

    let error = pipeline
        .send_message(message("t1", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(error, DeliveryError::Encryption(_)));
    assert_eq!(harness.recovery.queue_len(), 0);
}

#[tokio::test]
async fn test_recovery_notifies_connected_participants() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let mut alice = harness.connect("alice");
    let mut bob = harness.connect("bob");
    let thread = ThreadId::from("t1");

    harness
        .seed_dead_letter("t1", "one", "v1", MessageStatus::Failed)
        .await;
    harness
        .seed_dead_letter("t1", "two", "v1", MessageStatus::Failed)
        .await;

    assert_eq!(pipeline.recover_thread_messages(&thread).await.unwrap(), 2);

    let expected = TransportEvent::ThreadRecovered {
        thread_id: thread.clone(),
        count: 2,
    };
    assert_eq!(next_event(&mut alice).await, expected);
    assert_eq!(next_event(&mut bob).await, expected);
}

#[tokio::test]
async fn test_nothing_to_recover_sends_no_event() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let mut bob = harness.connect("bob");

    assert_eq!(
        pipeline
            .recover_thread_messages(&ThreadId::from("t1"))
            .await
            .unwrap(),
        0
    );
    assert!(bob.try_recv().is_err());
}

#[tokio::test]
async fn test_peer_instances_share_dead_letters() {
    let harness = Harness::new();
    let peer = harness.peer("instance-b");
    harness.encryption.fail_encryptions(1);
    let msg = message("t1", "hello");

    harness.pipeline().send_message(msg.clone()).await.unwrap_err();
    let outcome = harness
        .recovery
        .queue_for_retry(msg.clone(), "again".to_string(), None)
        .await
        .unwrap();
    assert_eq!(outcome, QueueOutcome::Queued { attempts: 2 });

    // Dead-letter on one instance, recover and deliver on the other
    assert!(
        harness
            .recovery
            .handle_max_retries_exceeded(msg.clone(), None, 2, "gave up".to_string())
            .await
            .unwrap()
    );
    assert_eq!(
        peer.recovery
            .recover_failed_messages(&msg.thread_id)
            .await
            .unwrap(),
        1
    );
    assert_eq!(peer.recovery.process_queue().await, 1);

    let record = harness
        .store
        .get_message(&msg.id.to_string())
        .await
        .unwrap()
        .expect("delivered by the peer");
    assert_eq!(record.status, MessageStatus::Recovered);
    assert_eq!(
        harness.failed_row(&msg.id).await.status,
        MessageStatus::Recovered
    );
}
