//! Batch publisher for metric documents.
//!
//! Decouples the rate of metric production from the rate of datastore
//! writes by coalescing every document recorded within a flush interval into
//! a single bulk request.
//!
//! ## Architecture
//!
//! ```text
//! Event path                  Background publisher
//! ──────────                  ────────────────────
//! [listener]                  [BatchPublisher]
//!     │                            │
//!     │ record()                   │ recv()
//!     ▼                            ▼
//! [Unbounded Channel] ──────► [BulkBuffer] ──tick──► [shim] ──► [bulk write]
//! ```
//!
//! ## Delivery
//!
//! - `record()` never blocks and never fails
//! - A flush snapshots and clears the buffer before the write is issued, so
//!   documents recorded while a write is in flight land in the next batch
//! - A failed write is logged and its batch discarded: at-most-once,
//!   best-effort delivery with no retry and no requeue

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use elk_common::{
    BulkRequest, DatastoreClient, DatastoreVersion, Envelope, MetricDocument, MetricEvent,
};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{MissedTickBehavior, interval};

use crate::config::{DEFAULT_FLUSH_INTERVAL, DEFAULT_INDEX};
use crate::shim;

/// Configuration for the batch publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Destination index.
    pub index: String,
    /// Period between flushes.
    pub flush_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            index: DEFAULT_INDEX.to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Statistics for the publisher.
#[derive(Debug, Default)]
pub struct PublisherStats {
    /// Documents handed to `record()`.
    pub recorded: AtomicU64,
    /// Bulk requests issued.
    pub flushes: AtomicU64,
    /// Documents acknowledged by the datastore.
    pub written: AtomicU64,
    /// Documents the datastore rejected inside a successful bulk request.
    pub rejected: AtomicU64,
    /// Failed bulk requests.
    pub write_errors: AtomicU64,
    /// Documents lost with a failed bulk request.
    pub discarded: AtomicU64,
}

impl PublisherStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            recorded: self.recorded.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of publisher statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStatsSnapshot {
    pub recorded: u64,
    pub flushes: u64,
    pub written: u64,
    pub rejected: u64,
    pub write_errors: u64,
    pub discarded: u64,
}

impl PublisherStatsSnapshot {
    /// Documents recorded but not yet written, rejected or discarded.
    pub fn pending(&self) -> u64 {
        self.recorded
            .saturating_sub(self.written + self.rejected + self.discarded)
    }
}

/// Result of a single flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing buffered; no request issued.
    Empty,
    /// Bulk request accepted.
    Written { count: usize, rejected: usize },
    /// Bulk request failed; the batch was discarded.
    Failed { count: usize },
}

/// Ordered, append-only buffer drained as a whole on flush.
#[derive(Debug, Default)]
pub struct BulkBuffer {
    documents: Vec<MetricDocument>,
}

impl BulkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, document: MetricDocument) {
        self.documents.push(document);
    }

    /// Takes every buffered document, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<MetricDocument> {
        std::mem::take(&mut self.documents)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Producer side of the publisher.
///
/// Cheap to clone; safe to call from the event path at any frequency.
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    sender: mpsc::UnboundedSender<MetricDocument>,
    envelope: Arc<Envelope>,
    stats: Arc<PublisherStats>,
}

impl PublisherHandle {
    /// Wraps the fields in the process envelope and queues the document.
    pub fn record(&self, metric_type: &str, timestamp: DateTime<Utc>, fields: Map<String, Value>) {
        self.record_event(MetricEvent::new(metric_type, timestamp, fields));
    }

    pub fn record_event(&self, event: MetricEvent) {
        let document = MetricDocument::new(Arc::clone(&self.envelope), event);
        if self.sender.send(document).is_ok() {
            self.stats.recorded.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::trace!("Publisher stopped, dropping metric");
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn stats_snapshot(&self) -> PublisherStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Owns the buffer and performs the bulk writes.
pub struct BatchPublisher {
    config: PublisherConfig,
    version: DatastoreVersion,
    client: Arc<dyn DatastoreClient>,
    receiver: mpsc::UnboundedReceiver<MetricDocument>,
    buffer: BulkBuffer,
    stats: Arc<PublisherStats>,
}

impl BatchPublisher {
    /// Creates the publisher and the handle producers record through.
    pub fn new(
        config: PublisherConfig,
        envelope: Arc<Envelope>,
        version: DatastoreVersion,
        client: Arc<dyn DatastoreClient>,
    ) -> (Self, PublisherHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(PublisherStats::new());

        let handle = PublisherHandle {
            sender,
            envelope,
            stats: Arc::clone(&stats),
        };
        let publisher = Self {
            config,
            version,
            client,
            receiver,
            buffer: BulkBuffer::new(),
            stats,
        };

        (publisher, handle)
    }

    pub fn version(&self) -> DatastoreVersion {
        self.version
    }

    /// Documents currently buffered, not counting ones still in the channel.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats_snapshot(&self) -> PublisherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Moves every document already recorded into the buffer.
    fn absorb_pending(&mut self) {
        while let Ok(document) = self.receiver.try_recv() {
            self.buffer.push(document);
        }
    }

    /// Writes everything recorded so far as one bulk request.
    ///
    /// The buffer is empty once this returns, whatever the write outcome.
    pub async fn flush(&mut self) -> FlushOutcome {
        self.absorb_pending();
        if self.buffer.is_empty() {
            return FlushOutcome::Empty;
        }

        let batch = self.buffer.drain();
        let count = batch.len();
        let request = BulkRequest::new(
            batch
                .iter()
                .map(|doc| shim::bulk_operation(self.version, &self.config.index, doc))
                .collect(),
        );

        self.stats.flushes.fetch_add(1, Ordering::Relaxed);

        match self.client.bulk(&request).await {
            Ok(response) => {
                let rejected = response.failed.min(count);
                self.stats
                    .written
                    .fetch_add((count - rejected) as u64, Ordering::Relaxed);
                if rejected > 0 {
                    self.stats
                        .rejected
                        .fetch_add(rejected as u64, Ordering::Relaxed);
                    tracing::warn!(count, rejected, index = %self.config.index, "Bulk update partially rejected");
                } else {
                    tracing::debug!(count, took_ms = response.took, "Published bulk update");
                }
                FlushOutcome::Written { count, rejected }
            }
            Err(e) => {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .discarded
                    .fetch_add(count as u64, Ordering::Relaxed);
                tracing::error!(error = %e, count, index = %self.config.index, "Error doing bulk update, batch discarded");
                FlushOutcome::Failed { count }
            }
        }
    }

    /// Run the publisher loop.
    ///
    /// Flushes on every tick. Stops with a final flush when shutdown is
    /// signaled or every handle has been dropped. A shutdown sender dropped
    /// without sending is not a shutdown signal: the loop keeps flushing
    /// until the handles are gone.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut flush_timer = interval(self.config.flush_interval);
        let mut shutdown_open = true;
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            index = %self.config.index,
            version = %self.version,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "Publisher started"
        );

        loop {
            tokio::select! {
                document = self.receiver.recv() => {
                    match document {
                        Some(doc) => self.buffer.push(doc),
                        None => {
                            tracing::info!("All publisher handles dropped, performing final flush");
                            self.flush().await;
                            break;
                        }
                    }
                }

                _ = flush_timer.tick() => {
                    self.flush().await;
                }

                result = shutdown.recv(), if shutdown_open => {
                    match result {
                        Ok(()) | Err(RecvError::Lagged(_)) => {
                            tracing::info!("Shutdown signal received, performing final flush");
                            self.flush().await;
                            break;
                        }
                        Err(RecvError::Closed) => {
                            tracing::debug!("Shutdown sender dropped, running until all handles are dropped");
                            shutdown_open = false;
                        }
                    }
                }
            }
        }

        let stats = self.stats_snapshot();
        tracing::info!(
            recorded = stats.recorded,
            written = stats.written,
            rejected = stats.rejected,
            discarded = stats.discarded,
            write_errors = stats.write_errors,
            "Publisher stopped"
        );
    }
}

/// Spawn the publisher as a background task.
pub fn spawn_publisher(
    publisher: BatchPublisher,
    shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(publisher.run(shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use elk_common::{
        BulkResponse, ClusterInfo, ElasticsearchError, IndexDocument, InMemoryDatastore,
        PutMapping, SearchProbe,
    };
    use serde_json::json;
    use tokio::sync::Notify;

    /// Holds every bulk write open until `release` is notified.
    #[derive(Default)]
    struct GatedDatastore {
        inner: InMemoryDatastore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DatastoreClient for GatedDatastore {
        async fn info(&self) -> Result<ClusterInfo, ElasticsearchError> {
            self.inner.info().await
        }

        async fn index_exists(&self, index: &str) -> Result<bool, ElasticsearchError> {
            self.inner.index_exists(index).await
        }

        async fn create_index(&self, index: &str) -> Result<(), ElasticsearchError> {
            self.inner.create_index(index).await
        }

        async fn put_mapping(&self, request: &PutMapping) -> Result<(), ElasticsearchError> {
            self.inner.put_mapping(request).await
        }

        async fn index_document(&self, request: &IndexDocument) -> Result<(), ElasticsearchError> {
            self.inner.index_document(request).await
        }

        async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse, ElasticsearchError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.bulk(request).await
        }

        async fn count_hits(&self, search: &SearchProbe) -> Result<u64, ElasticsearchError> {
            self.inner.count_hits(search).await
        }
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn publisher(
        store: &Arc<InMemoryDatastore>,
        version: DatastoreVersion,
    ) -> (BatchPublisher, PublisherHandle) {
        BatchPublisher::new(
            PublisherConfig::default(),
            Arc::new(Envelope::new("host-a", 99, "tests")),
            version,
            Arc::clone(store) as Arc<dyn DatastoreClient>,
        )
    }

    #[test]
    fn test_bulk_buffer_drain_resets() {
        let mut buffer = BulkBuffer::new();
        buffer.push(MetricDocument::new(
            Arc::new(Envelope::new("h", 1, "a")),
            MetricEvent::new("cpu", Utc::now(), Map::new()),
        ));
        assert_eq!(buffer.len(), 1);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_flush_empty_issues_no_write() {
        let store = Arc::new(InMemoryDatastore::default());
        let (mut publisher, _handle) = publisher(&store, DatastoreVersion::new(6));

        assert_eq!(publisher.flush().await, FlushOutcome::Empty);
        assert!(store.bulks().is_empty());
        assert_eq!(publisher.stats_snapshot().flushes, 0);
    }

    #[tokio::test]
    async fn test_flush_writes_in_record_order() {
        let store = Arc::new(InMemoryDatastore::default());
        let (mut publisher, handle) = publisher(&store, DatastoreVersion::new(6));
        let ts = Utc.timestamp_millis_opt(1_600_000_000_000).unwrap();

        handle.record("cpu", ts, fields(json!({ "process": 0.1 })));
        handle.record("gc", ts, fields(json!({ "size": 1024 })));
        handle.record("cpu", ts, fields(json!({ "process": 0.3 })));

        assert_eq!(
            publisher.flush().await,
            FlushOutcome::Written { count: 3, rejected: 0 }
        );
        assert_eq!(publisher.buffered(), 0);

        let bulks = store.bulks();
        assert_eq!(bulks.len(), 1);
        let types: Vec<&str> = bulks[0]
            .operations
            .iter()
            .map(|op| op.source["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["cpu", "gc", "cpu"]);
        assert_eq!(bulks[0].operations[2].source["cpu"]["process"], json!(0.3));
        assert_eq!(bulks[0].operations[0].source["host"], json!("host-a"));
        assert_eq!(bulks[0].operations[0].source["pid"], json!(99));
        assert_eq!(bulks[0].operations[0].source["app"], json!("tests"));

        // Next flush starts from an empty buffer
        assert_eq!(publisher.flush().await, FlushOutcome::Empty);
        assert_eq!(store.bulks().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_shapes_actions_for_version() {
        let store = Arc::new(InMemoryDatastore::new("5.6.0"));
        let (mut publisher, handle) = publisher(&store, DatastoreVersion::new(5));

        handle.record("http", Utc::now(), fields(json!({ "duration": 12 })));
        publisher.flush().await;

        let bulks = store.bulks();
        assert_eq!(
            bulks[0].operations[0].action,
            json!({ "index": { "_index": "appmetrics", "_type": "http" } })
        );
    }

    #[tokio::test]
    async fn test_failed_write_discards_batch() {
        let store = Arc::new(InMemoryDatastore::default());
        store.fail_bulk(true);
        let (mut publisher, handle) = publisher(&store, DatastoreVersion::new(6));

        handle.record("cpu", Utc::now(), Map::new());
        handle.record("cpu", Utc::now(), Map::new());

        assert_eq!(publisher.flush().await, FlushOutcome::Failed { count: 2 });
        assert_eq!(publisher.buffered(), 0);

        let stats = publisher.stats_snapshot();
        assert_eq!(stats.write_errors, 1);
        assert_eq!(stats.discarded, 2);
        assert_eq!(stats.pending(), 0);

        // The failed batch is not resubmitted
        store.fail_bulk(false);
        assert_eq!(publisher.flush().await, FlushOutcome::Empty);
        assert!(store.bulks().is_empty());
    }

    #[tokio::test]
    async fn test_records_after_failure_start_new_batch() {
        let store = Arc::new(InMemoryDatastore::default());
        store.fail_bulk(true);
        let (mut publisher, handle) = publisher(&store, DatastoreVersion::new(6));

        handle.record("cpu", Utc::now(), fields(json!({ "process": 1 })));
        publisher.flush().await;

        store.fail_bulk(false);
        handle.record("cpu", Utc::now(), fields(json!({ "process": 2 })));
        assert_eq!(
            publisher.flush().await,
            FlushOutcome::Written { count: 1, rejected: 0 }
        );
        assert_eq!(store.bulk_sources()[0]["cpu"]["process"], json!(2));
    }

    #[tokio::test]
    async fn test_records_during_write_start_next_batch() {
        let store = Arc::new(GatedDatastore::default());
        let (mut publisher, handle) = BatchPublisher::new(
            PublisherConfig::default(),
            Arc::new(Envelope::new("host-a", 1, "tests")),
            DatastoreVersion::new(6),
            Arc::clone(&store) as Arc<dyn DatastoreClient>,
        );

        handle.record("cpu", Utc::now(), fields(json!({ "process": 1 })));
        handle.record("cpu", Utc::now(), fields(json!({ "process": 2 })));
        let in_flight = tokio::spawn(async move {
            let outcome = publisher.flush().await;
            (publisher, outcome)
        });

        // Bulk request issued, response not yet returned
        store.entered.notified().await;
        handle.record("cpu", Utc::now(), fields(json!({ "process": 3 })));
        store.release.notify_one();

        let (mut publisher, outcome) = in_flight.await.unwrap();
        assert_eq!(outcome, FlushOutcome::Written { count: 2, rejected: 0 });
        let first: Vec<Value> = store.inner.bulks()[0]
            .operations
            .iter()
            .map(|op| op.source["cpu"]["process"].clone())
            .collect();
        assert_eq!(first, vec![json!(1), json!(2)]);

        store.release.notify_one();
        assert_eq!(
            publisher.flush().await,
            FlushOutcome::Written { count: 1, rejected: 0 }
        );
        let bulks = store.inner.bulks();
        assert_eq!(bulks.len(), 2);
        assert_eq!(bulks[1].operations.len(), 1);
        assert_eq!(bulks[1].operations[0].source["cpu"]["process"], json!(3));
    }

    #[tokio::test]
    async fn test_record_after_publisher_dropped() {
        let store = Arc::new(InMemoryDatastore::default());
        let (publisher, handle) = publisher(&store, DatastoreVersion::new(6));
        drop(publisher);

        handle.record("cpu", Utc::now(), Map::new());
        assert_eq!(handle.stats_snapshot().recorded, 0);
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let store = Arc::new(InMemoryDatastore::default());
        let (publisher, handle) = BatchPublisher::new(
            PublisherConfig {
                index: "appmetrics".to_string(),
                flush_interval: Duration::from_secs(3600),
            },
            Arc::new(Envelope::new("host-a", 1, "tests")),
            DatastoreVersion::new(6),
            Arc::clone(&store) as Arc<dyn DatastoreClient>,
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = spawn_publisher(publisher, shutdown_rx);

        handle.record("cpu", Utc::now(), Map::new());
        handle.record("gc", Utc::now(), Map::new());
        tokio::task::yield_now().await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(store.bulk_sources().len(), 2);
        assert_eq!(handle.stats_snapshot().written, 2);
    }

    #[tokio::test]
    async fn test_run_stops_when_handles_dropped() {
        let store = Arc::new(InMemoryDatastore::default());
        let (publisher, handle) = publisher(&store, DatastoreVersion::new(6));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = spawn_publisher(publisher, shutdown_rx);

        handle.record("cpu", Utc::now(), Map::new());
        drop(handle);
        task.await.unwrap();

        assert_eq!(store.bulk_sources().len(), 1);
    }

    #[tokio::test]
    async fn test_run_survives_dropped_shutdown_sender() {
        let store = Arc::new(InMemoryDatastore::default());
        let (publisher, handle) = publisher(&store, DatastoreVersion::new(6));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = spawn_publisher(publisher, shutdown_rx);

        drop(shutdown_tx);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());

        handle.record("cpu", Utc::now(), Map::new());
        assert_eq!(handle.stats_snapshot().recorded, 1);

        drop(handle);
        task.await.unwrap();
        assert_eq!(store.bulk_sources().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_on_interval() {
        let store = Arc::new(InMemoryDatastore::default());
        let (publisher, handle) = publisher(&store, DatastoreVersion::new(6));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = spawn_publisher(publisher, shutdown_rx);

        handle.record("cpu", Utc::now(), Map::new());
        tokio::time::sleep(DEFAULT_FLUSH_INTERVAL + Duration::from_millis(10)).await;
        assert_eq!(store.bulks().len(), 1);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(store.bulks().len(), 1);
    }

    #[test]
    fn test_stats_pending() {
        let snapshot = PublisherStatsSnapshot {
            recorded: 10,
            written: 6,
            rejected: 1,
            discarded: 2,
            ..Default::default()
        };
        assert_eq!(snapshot.pending(), 1);
    }
}
