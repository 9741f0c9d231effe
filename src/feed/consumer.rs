use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::EtlError;
use crate::feed::{ChangeFeed, ChangeStream, CheckpointStore, FeedRequest};
use crate::types::{ChangeEvent, Offset};
use crate::Result;

/// Subscription of one ETL task to the change feed.
///
/// Events are handed out in feed order. The stream is (re)opened from the
/// last acknowledged offset, so after a crash or reconnect only events that
/// were delivered but not yet acknowledged are seen again.
pub struct ChangeFeedConsumer {
    task: String,
    feed: Arc<dyn ChangeFeed>,
    checkpoints: Arc<dyn CheckpointStore>,
    collections: BTreeSet<String>,
    apply_to_all_documents: bool,
    retry: RetryPolicy,
    position: Option<Offset>,
    stream: Option<ChangeStream>,
}

impl ChangeFeedConsumer {
    pub fn new(
        task: impl Into<String>,
        feed: Arc<dyn ChangeFeed>,
        checkpoints: Arc<dyn CheckpointStore>,
        collections: BTreeSet<String>,
        apply_to_all_documents: bool,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            task: task.into(),
            feed,
            checkpoints,
            collections,
            apply_to_all_documents,
            retry,
            position: None,
            stream: None,
        }
    }

    /// Loads the stored checkpoint. Must be called before `next`.
    pub async fn resume(&mut self) -> Result<Option<Offset>> {
        self.position = self.checkpoints.load(&self.task).await?;
        self.stream = None;
        match self.position {
            Some(offset) => info!("Task '{}' resuming after offset {}", self.task, offset),
            None => info!("Task '{}' starting from the beginning of the feed", self.task),
        }
        Ok(self.position)
    }

    /// Last acknowledged offset.
    pub fn position(&self) -> Option<Offset> {
        self.position
    }

    fn request(&self) -> FeedRequest {
        FeedRequest {
            collections: self.collections.clone(),
            apply_to_all_documents: self.apply_to_all_documents,
            from_checkpoint: self.position,
        }
    }

    fn is_wanted(&self, event: &ChangeEvent) -> bool {
        let after = self.position.map_or(true, |position| event.offset > position);
        after && (self.apply_to_all_documents || self.collections.contains(&event.collection))
    }

    /// Next change for this subscription. `Ok(None)` means the feed ended.
    pub async fn next(&mut self) -> Result<Option<ChangeEvent>> {
        let mut failures = 0;

        loop {
            if self.stream.is_none() {
                match self.feed.open(self.request()).await {
                    Ok(stream) => {
                        debug!("Task '{}' opened change feed", self.task);
                        self.stream = Some(stream);
                    }
                    Err(e) => {
                        back_off(&self.task, &self.retry, &mut failures, e).await?;
                        continue;
                    }
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                continue;
            };

            match stream.next().await {
                Some(Ok(event)) => {
                    if self.is_wanted(&event) {
                        return Ok(Some(event));
                    }
                    debug!(
                        "Task '{}' skipping {} at offset {}",
                        self.task,
                        event.event_id(),
                        event.offset
                    );
                }
                Some(Err(e)) => {
                    self.stream = None;
                    back_off(&self.task, &self.retry, &mut failures, e).await?;
                }
                None => {
                    info!("Change feed for task '{}' ended", self.task);
                    self.stream = None;
                    return Ok(None);
                }
            }
        }
    }

    /// Durably records that everything up to `offset` has been processed.
    pub async fn acknowledge(&mut self, offset: Offset) -> Result<()> {
        self.checkpoints.commit(&self.task, offset).await?;
        if self.position.map_or(true, |position| offset > position) {
            self.position = Some(offset);
        }
        Ok(())
    }
}

/// Waits before the next reconnect, or gives up once the policy is spent.
/// Free function: the consumer is not `Sync`, so only its fields may be
/// borrowed across the sleep.
async fn back_off(
    task: &str,
    retry: &RetryPolicy,
    failures: &mut usize,
    error: EtlError,
) -> Result<()> {
    *failures += 1;
    if *failures >= retry.max_attempts {
        return Err(EtlError::Feed(format!(
            "change feed for task '{}' unavailable after {} attempts: {}",
            task, failures, error
        )));
    }

    let delay = retry.delay_for(*failures - 1);
    warn!(
        "Change feed for task '{}' failed (attempt {}), reconnecting in {}ms: {}",
        task,
        failures,
        delay.as_millis(),
        error
    );
    sleep(delay).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryBackoffStrategy;
    use crate::feed::{InMemoryChangeFeed, MemoryCheckpointStore};
    use serde_json::json;

    fn retry(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: RetryBackoffStrategy::Fixed { delay_ms: 1 },
        }
    }

    fn consumer(
        feed: &InMemoryChangeFeed,
        checkpoints: Arc<MemoryCheckpointStore>,
        max_attempts: usize,
    ) -> ChangeFeedConsumer {
        ChangeFeedConsumer::new(
            "orders-etl",
            Arc::new(feed.clone()),
            checkpoints,
            ["Orders".to_string()].into_iter().collect(),
            false,
            retry(max_attempts),
        )
    }

    #[tokio::test]
    async fn test_restart_resumes_after_checkpoint() {
        let feed = InMemoryChangeFeed::new();
        for i in 1..=4 {
            feed.put("Orders", format!("orders/{i}"), json!({ "n": i }));
        }
        let checkpoints = Arc::new(MemoryCheckpointStore::new());

        let mut first = consumer(&feed, checkpoints.clone(), 3);
        first.resume().await.unwrap();
        for expected in 1..=2 {
            let event = first.next().await.unwrap().unwrap();
            assert_eq!(event.offset, expected);
            first.acknowledge(event.offset).await.unwrap();
        }
        // Delivered but never acknowledged: redelivered after restart.
        assert_eq!(first.next().await.unwrap().unwrap().offset, 3);
        drop(first);

        let mut second = consumer(&feed, checkpoints, 3);
        assert_eq!(second.resume().await.unwrap(), Some(2));
        assert_eq!(second.next().await.unwrap().unwrap().offset, 3);
    }

    #[tokio::test]
    async fn test_reconnects_after_stream_error() {
        let feed = InMemoryChangeFeed::new();
        feed.put("Orders", "orders/1", json!({}));
        feed.put("Orders", "orders/2", json!({}));
        let mut consumer = consumer(&feed, Arc::new(MemoryCheckpointStore::new()), 3);
        consumer.resume().await.unwrap();

        let first = consumer.next().await.unwrap().unwrap();
        consumer.acknowledge(first.offset).await.unwrap();

        feed.fail_next_reads(1);
        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.offset, 2);
        assert_eq!(feed.open_count(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_retries() {
        let feed = InMemoryChangeFeed::new();
        feed.fail_next_opens(10);
        let mut consumer = consumer(&feed, Arc::new(MemoryCheckpointStore::new()), 3);
        consumer.resume().await.unwrap();

        assert!(matches!(consumer.next().await, Err(EtlError::Feed(_))));
    }

    #[tokio::test]
    async fn test_recovers_when_feed_comes_back() {
        let feed = InMemoryChangeFeed::new();
        feed.put("Orders", "orders/1", json!({}));
        feed.fail_next_opens(2);
        let mut consumer = consumer(&feed, Arc::new(MemoryCheckpointStore::new()), 3);
        consumer.resume().await.unwrap();

        assert_eq!(consumer.next().await.unwrap().unwrap().offset, 1);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_reconnect_future_is_send() {
        let feed = InMemoryChangeFeed::new();
        feed.fail_next_opens(1);
        feed.put("Orders", "orders/1", json!({}));
        let mut spawned = consumer(&feed, Arc::new(MemoryCheckpointStore::new()), 3);
        spawned.resume().await.unwrap();

        // Runners poll `next` from spawned tasks.
        let handle =
            tokio::spawn(async move { spawned.next().await.map(|e| e.map(|e| e.offset)) });
        assert_eq!(handle.await.unwrap().unwrap(), Some(1));

        let mut other = consumer(&feed, Arc::new(MemoryCheckpointStore::new()), 3);
        let next = other.next();
        assert_send(&next);
    }

    #[tokio::test]
    async fn test_acknowledge_never_moves_back() {
        let feed = InMemoryChangeFeed::new();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut consumer = consumer(&feed, checkpoints.clone(), 3);
        consumer.acknowledge(7).await.unwrap();
        consumer.acknowledge(5).await.unwrap();
        assert_eq!(consumer.position(), Some(7));
        assert_eq!(checkpoints.load("orders-etl").await.unwrap(), Some(7));
    }
}
