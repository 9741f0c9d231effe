use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::EtlError;
use crate::feed::{ChangeFeed, ChangeStream, FeedRequest};
use crate::types::{ChangeEvent, Offset};
use crate::Result;

/// Change feed backed by an in-process log. Offsets start at 1.
///
/// Used by the replay binary and by tests; supports injecting open and
/// stream failures to exercise reconnect handling.
#[derive(Clone, Default)]
pub struct InMemoryChangeFeed {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    log: Mutex<Vec<ChangeEvent>>,
    notify: Notify,
    faults: Mutex<Faults>,
}

#[derive(Default)]
struct Faults {
    failing_opens: usize,
    failing_reads: usize,
    opens: usize,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        collection: impl Into<String>,
        document_id: impl Into<String>,
        snapshot: serde_json::Value,
    ) -> Offset {
        let (collection, document_id) = (collection.into(), document_id.into());
        self.append(|offset| ChangeEvent::put(offset, collection, document_id, snapshot))
    }

    pub fn delete(&self, collection: impl Into<String>, document_id: impl Into<String>) -> Offset {
        let (collection, document_id) = (collection.into(), document_id.into());
        self.append(|offset| ChangeEvent::delete(offset, collection, document_id))
    }

    fn append(&self, build: impl FnOnce(Offset) -> ChangeEvent) -> Offset {
        let offset = {
            let mut log = self.shared.log.lock();
            let offset = log.len() as Offset + 1;
            log.push(build(offset));
            offset
        };
        self.shared.notify.notify_waiters();
        offset
    }

    pub fn len(&self) -> usize {
        self.shared.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.shared.faults.lock().failing_opens = count;
    }

    /// The next `count` reads from any open stream fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.shared.faults.lock().failing_reads = count;
        self.shared.notify.notify_waiters();
    }

    /// Number of successful `open` calls so far.
    pub fn open_count(&self) -> usize {
        self.shared.faults.lock().opens
    }
}

impl Shared {
    fn next_after(
        &self,
        request: &FeedRequest,
        cursor: usize,
    ) -> Option<Result<(ChangeEvent, usize)>> {
        {
            let mut faults = self.faults.lock();
            if faults.failing_reads > 0 {
                faults.failing_reads -= 1;
                return Some(Err(EtlError::Feed("change feed read failed".to_string())));
            }
        }

        let log = self.log.lock();
        log.iter()
            .enumerate()
            .skip(cursor)
            .find(|(_, event)| {
                request.is_after_checkpoint(event.offset) && request.matches(&event.collection)
            })
            .map(|(index, event)| Ok((event.clone(), index + 1)))
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn open(&self, request: FeedRequest) -> Result<ChangeStream> {
        {
            let mut faults = self.shared.faults.lock();
            if faults.failing_opens > 0 {
                faults.failing_opens -= 1;
                return Err(EtlError::Feed("change feed unavailable".to_string()));
            }
            faults.opens += 1;
        }

        debug!(
            "Opening in-memory change feed for {:?} from {:?}",
            request.collections, request.from_checkpoint
        );

        let shared = self.shared.clone();
        let stream = futures::stream::unfold(
            (shared, request, 0_usize),
            |(shared, request, mut cursor)| async move {
                loop {
                    let next = {
                        let notified = shared.notify.notified();
                        tokio::pin!(notified);
                        notified.as_mut().enable();

                        match shared.next_after(&request, cursor) {
                            Some(found) => Some(found),
                            None => {
                                notified.await;
                                None
                            }
                        }
                    };

                    match next {
                        Some(Ok((event, next_cursor))) => {
                            cursor = next_cursor;
                            return Some((Ok(event), (shared, request, cursor)));
                        }
                        Some(Err(e)) => return Some((Err(e), (shared, request, cursor))),
                        None => continue,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}
