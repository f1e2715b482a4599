//! One pass of the background processor over the retry queue

use std::{sync::Arc, time::SystemTime};

use hearth_common::tracing::{self, debug, error, info, warn};
use tokio::task::JoinSet;

use super::Recovery;
use crate::types::{RetryOutcome, RetryQueueItem};

impl Recovery {
    /// Process the retry queue once, as of now
    pub async fn process_queue(self: &Arc<Self>) -> usize {
        self.process_queue_at(SystemTime::now()).await
    }

    /// Process the retry queue once, as of `now`
    ///
    /// Expired key transitions are dead-lettered first, regardless of the
    /// attempts left. Every other item whose backoff has elapsed is retried,
    /// at most `max_concurrent_retries` at a time. Returns the number of
    /// items acted on.
    pub async fn process_queue_at(self: &Arc<Self>, now: SystemTime) -> usize {
        let mut ready = Vec::new();

        for item in self.queue.all_items() {
            if let Some(transition) = &item.transition
                && self
                    .policy
                    .transition_expired(transition.transition_started, now)
            {
                warn!(
                    message_id = %item.message.id,
                    from = %transition.from_version,
                    to = %transition.to_version,
                    retry_count = transition.retry_count,
                    "Key transition timed out"
                );
                ready.push(Work::TransitionExpired(item));
                continue;
            }

            if self.policy.is_due(item.attempts, item.last_attempt, now) {
                ready.push(Work::Retry(item));
            } else {
                tracing::trace!(
                    message_id = %item.message.id,
                    attempts = item.attempts,
                    "Skipping message, not yet time to retry"
                );
            }
        }

        let handled = ready.len();
        if handled == 0 {
            return 0;
        }

        info!(
            ready = handled,
            max_concurrent = self.policy.max_concurrent_retries,
            "Processing retry queue"
        );

        let mut join_set = JoinSet::new();
        let mut ready = ready.into_iter();

        for work in ready.by_ref().take(self.policy.max_concurrent_retries) {
            join_set.spawn(Arc::clone(self).run(work, now));
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!("Retry task failed: {e}");
            }
            if let Some(work) = ready.next() {
                join_set.spawn(Arc::clone(self).run(work, now));
            }
        }

        handled
    }

    async fn run(self: Arc<Self>, work: Work, now: SystemTime) {
        match work {
            Work::TransitionExpired(item) => self.dead_letter(item).await,
            Work::Retry(item) => {
                let exhausted = self.policy.is_exhausted(item.attempts);
                let message_id = item.message.id;

                match self.retry_message_at(item.clone(), now).await {
                    Ok(RetryOutcome::Failed) if exhausted => {
                        // Carry the failure just recorded into the dead letter
                        let latest = self.queue.get(&message_id).unwrap_or(item);
                        self.dead_letter(latest).await;
                    }
                    Ok(outcome) => {
                        debug!(message_id = %message_id, ?outcome, "Retry attempt finished");
                    }
                    Err(e) => {
                        warn!(message_id = %message_id, error = %e, "Retry attempt not started");
                    }
                }
            }
        }
    }

    async fn dead_letter(&self, item: RetryQueueItem) {
        let message_id = item.message.id;
        match self
            .handle_max_retries_exceeded(item.message, item.transition, item.attempts, item.error)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(message_id = %message_id, "Dead-lettering deferred, message locked"),
            Err(e) => error!(message_id = %message_id, error = %e, "Failed to dead-letter message"),
        }
    }
}

/// What a tick decided to do with a queued item
#[derive(Debug)]
enum Work {
    TransitionExpired(RetryQueueItem),
    Retry(RetryQueueItem),
}
