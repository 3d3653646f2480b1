use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::counter;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use pipeline_common::envelope::EventEnvelope;
use pipeline_common::jobqueue::JobSink;
use pipeline_common::storage::Storage;

use crate::stream::PartnerStream;

/// Polls the partner shard stream on a fixed tick and forwards decoded
/// records into storage and the scoring queue, bypassing the internal log.
///
/// The cursor map is owned by this instance and only touched from its own
/// tick; ticks never overlap (an overrunning tick delays the next one), so
/// no lock is needed. Cursors live in process memory only: on restart the
/// stream is re-read from its earliest retained position, which trades
/// duplicate processing for completeness.
pub struct PartnerPoller {
    stream: Arc<dyn PartnerStream + Send + Sync>,
    storage: Arc<dyn Storage + Send + Sync>,
    jobs: Arc<dyn JobSink + Send + Sync>,
    enabled: bool,
    fetch_limit: i32,
    poll_interval: Duration,
    cursors: HashMap<String, String>,
    liveness: HealthHandle,
}

impl PartnerPoller {
    pub fn new(
        stream: Arc<dyn PartnerStream + Send + Sync>,
        storage: Arc<dyn Storage + Send + Sync>,
        jobs: Arc<dyn JobSink + Send + Sync>,
        enabled: bool,
        fetch_limit: i32,
        poll_interval: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            stream,
            storage,
            jobs,
            enabled,
            fetch_limit,
            poll_interval,
            cursors: HashMap::new(),
            liveness,
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;
            self.tick().await;
        }
    }

    /// One poll pass over all shards. Shards are processed sequentially
    /// within a tick, so a slow shard delays the others.
    pub async fn tick(&mut self) {
        if !self.enabled {
            return;
        }

        let shards = match self.stream.list_shards().await {
            Ok(shards) => shards,
            Err(err) => {
                error!("failed to list partner stream shards: {}", err);
                return;
            }
        };

        for shard_id in shards {
            self.poll_shard(&shard_id).await;
        }
    }

    async fn poll_shard(&mut self, shard_id: &str) {
        let cursor = match self.cursors.get(shard_id) {
            Some(cursor) => cursor.clone(),
            None => {
                // First sight of this shard: start from the oldest retained
                // record, favoring completeness over latency.
                match self.stream.oldest_cursor(shard_id).await {
                    Ok(Some(cursor)) => {
                        self.cursors.insert(shard_id.to_owned(), cursor.clone());
                        cursor
                    }
                    Ok(None) => return,
                    Err(err) => {
                        error!(shard_id, "failed to obtain initial cursor: {}", err);
                        return;
                    }
                }
            }
        };

        let batch = match self.stream.fetch(&cursor, self.fetch_limit).await {
            Ok(batch) => batch,
            Err(err) => {
                // Cursor untouched: the same position is retried next tick.
                error!(shard_id, "failed to fetch partner records: {}", err);
                return;
            }
        };

        for record in &batch.records {
            self.handle_record(record).await;
        }

        // Advance unconditionally once the fetch succeeded: a poison record
        // must not wedge the shard.
        match batch.next_cursor {
            Some(next) => {
                self.cursors.insert(shard_id.to_owned(), next);
            }
            None => {
                debug!(shard_id, "shard closed, dropping its cursor");
                self.cursors.remove(shard_id);
            }
        }
    }

    /// Decode, persist and enqueue a single record. Failures are logged
    /// and the record skipped; they never stall cursor advancement.
    async fn handle_record(&self, data: &[u8]) {
        counter!("partner_poll_records_total").increment(1);

        let raw = match std::str::from_utf8(data) {
            Ok(raw) => raw,
            Err(err) => {
                counter!("partner_poll_records_skipped_total", "cause" => "encoding").increment(1);
                warn!("skipping partner record with invalid encoding: {}", err);
                return;
            }
        };

        let envelope = match EventEnvelope::from_payload(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                counter!("partner_poll_records_skipped_total", "cause" => "decode").increment(1);
                warn!("skipping undecodable partner record: {}", err);
                return;
            }
        };

        if let Err(err) = self.storage.persist_event(&envelope).await {
            counter!("partner_poll_records_skipped_total", "cause" => "storage").increment(1);
            error!("failed to persist partner record: {}", err);
            return;
        }

        if let Err(err) = self.jobs.enqueue_payload(raw).await {
            counter!("partner_poll_records_skipped_total", "cause" => "queue").increment(1);
            error!("failed to enqueue partner record for scoring: {}", err);
            return;
        }

        counter!("partner_poll_records_forwarded_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use health::HealthRegistry;

    use crate::poller::PartnerPoller;
    use crate::stream::{PartnerStream, RecordBatch, StreamError};
    use crate::testing::{MemoryJobSink, MemoryStorage};

    /// Scripted stream double: hands out configured batches in order and
    /// records which cursors were requested.
    #[derive(Default)]
    struct MemoryStream {
        shards: Vec<String>,
        initial_cursor: Option<String>,
        batches: Mutex<VecDeque<Result<RecordBatch, StreamError>>>,
        oldest_requests: Mutex<Vec<String>>,
        fetched_cursors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PartnerStream for MemoryStream {
        async fn list_shards(&self) -> Result<Vec<String>, StreamError> {
            Ok(self.shards.clone())
        }

        async fn oldest_cursor(&self, shard_id: &str) -> Result<Option<String>, StreamError> {
            self.oldest_requests.lock().unwrap().push(shard_id.to_owned());
            Ok(self.initial_cursor.clone())
        }

        async fn fetch(&self, cursor: &str, _limit: i32) -> Result<RecordBatch, StreamError> {
            self.fetched_cursors.lock().unwrap().push(cursor.to_owned());
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(RecordBatch {
                    records: vec![],
                    next_cursor: Some(cursor.to_owned()),
                }))
        }
    }

    async fn poller(
        stream: Arc<MemoryStream>,
        storage: Arc<MemoryStorage>,
        jobs: Arc<MemoryJobSink>,
        enabled: bool,
    ) -> PartnerPoller {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry
            .register("poller".to_string(), time::Duration::seconds(30))
            .await;
        PartnerPoller::new(
            stream,
            storage,
            jobs,
            enabled,
            100,
            Duration::from_millis(10),
            liveness,
        )
    }

    fn valid_record(tenant: &str) -> Vec<u8> {
        format!(
            r#"{{"tenantId":"{tenant}","source":"partner","schemaVersion":"v1","payload":{{}}}}"#
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn first_sight_of_a_shard_starts_at_the_oldest_record() {
        let stream = Arc::new(MemoryStream {
            shards: vec!["shard-1".to_string()],
            initial_cursor: Some("cursor-0".to_string()),
            batches: Mutex::new(VecDeque::from([Ok(RecordBatch {
                records: vec![valid_record("t-1")],
                next_cursor: Some("cursor-1".to_string()),
            })])),
            ..Default::default()
        });
        let storage = Arc::new(MemoryStorage::default());
        let jobs = Arc::new(MemoryJobSink::default());
        let mut poller = poller(stream.clone(), storage.clone(), jobs.clone(), true).await;

        poller.tick().await;

        assert_eq!(
            stream.oldest_requests.lock().unwrap().clone(),
            vec!["shard-1".to_string()]
        );
        assert_eq!(
            stream.fetched_cursors.lock().unwrap().clone(),
            vec!["cursor-0".to_string()]
        );
        assert_eq!(storage.events().len(), 1);
        assert_eq!(jobs.payloads().len(), 1);

        // A second tick resumes from the advanced cursor, no re-initialization
        poller.tick().await;
        assert_eq!(stream.oldest_requests.lock().unwrap().len(), 1);
        assert_eq!(
            stream.fetched_cursors.lock().unwrap().last().unwrap(),
            "cursor-1"
        );
    }

    #[tokio::test]
    async fn cursor_advances_past_undecodable_records() {
        let stream = Arc::new(MemoryStream {
            shards: vec!["shard-1".to_string()],
            initial_cursor: Some("cursor-0".to_string()),
            batches: Mutex::new(VecDeque::from([Ok(RecordBatch {
                records: vec![
                    b"definitely not json".to_vec(),
                    valid_record("t-2"),
                ],
                next_cursor: Some("cursor-9".to_string()),
            })])),
            ..Default::default()
        });
        let storage = Arc::new(MemoryStorage::default());
        let jobs = Arc::new(MemoryJobSink::default());
        let mut poller = poller(stream.clone(), storage.clone(), jobs.clone(), true).await;

        poller.tick().await;

        // The poison record was skipped, the valid one flowed through
        assert_eq!(storage.events().len(), 1);
        assert_eq!(storage.events()[0].tenant_id, "t-2");
        assert_eq!(jobs.payloads().len(), 1);

        // The cursor is the fetch's next token regardless of the bad record
        assert_eq!(
            poller.cursors.get("shard-1"),
            Some(&"cursor-9".to_string())
        );
    }

    #[tokio::test]
    async fn fetch_failure_leaves_the_cursor_untouched() {
        let stream = Arc::new(MemoryStream {
            shards: vec!["shard-1".to_string()],
            initial_cursor: Some("cursor-0".to_string()),
            batches: Mutex::new(VecDeque::from([Err(StreamError::Request(
                "stream unavailable".to_string(),
            ))])),
            ..Default::default()
        });
        let storage = Arc::new(MemoryStorage::default());
        let jobs = Arc::new(MemoryJobSink::default());
        let mut poller = poller(stream.clone(), storage, jobs, true).await;

        poller.tick().await;

        // Same position is retried on the next tick
        assert_eq!(
            poller.cursors.get("shard-1"),
            Some(&"cursor-0".to_string())
        );
        poller.tick().await;
        assert_eq!(
            stream.fetched_cursors.lock().unwrap().clone(),
            vec!["cursor-0".to_string(), "cursor-0".to_string()]
        );
    }

    #[tokio::test]
    async fn disabled_poller_tick_is_a_noop() {
        let stream = Arc::new(MemoryStream {
            shards: vec!["shard-1".to_string()],
            initial_cursor: Some("cursor-0".to_string()),
            ..Default::default()
        });
        let storage = Arc::new(MemoryStorage::default());
        let jobs = Arc::new(MemoryJobSink::default());
        let mut poller = poller(stream.clone(), storage, jobs, false).await;

        poller.tick().await;

        assert!(stream.oldest_requests.lock().unwrap().is_empty());
        assert!(stream.fetched_cursors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_shards_drop_their_cursor() {
        let stream = Arc::new(MemoryStream {
            shards: vec!["shard-1".to_string()],
            initial_cursor: Some("cursor-0".to_string()),
            batches: Mutex::new(VecDeque::from([Ok(RecordBatch {
                records: vec![],
                next_cursor: None,
            })])),
            ..Default::default()
        });
        let storage = Arc::new(MemoryStorage::default());
        let jobs = Arc::new(MemoryJobSink::default());
        let mut poller = poller(stream.clone(), storage, jobs, true).await;

        poller.tick().await;

        assert!(poller.cursors.is_empty());
    }
}
