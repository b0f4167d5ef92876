//! Batch poller: turns a growing collection into a sequence of batches.
//!
//! One poller runs per collection and owns that collection's [`Cursor`].
//! Each cycle walks `Fetching -> Logging -> Advancing -> Emitting ->
//! Sleeping`; a fetched window is written to the durable log before the
//! offset moves and before anything is handed downstream.

use crate::config::{Config, DrainPolicy, SortOrder};
use crate::cursor::{Cursor, CursorStore};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::store::{DocumentStore, FindWindow};
use crate::value::{document_id, Document};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Field whose value is written to the durable log for each document.
const LOG_ID_FIELD: &str = "_id";

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub database: String,
    pub collection: String,
    pub batch_size: usize,
    /// Pause after a non-empty batch.
    pub poll_interval: Duration,
    /// Pause when there is nothing new to fetch.
    pub idle_interval: Duration,
    pub sort_key: String,
    pub sort_order: SortOrder,
    pub drain_policy: DrainPolicy,
    pub channel_capacity: usize,
}

impl PollerConfig {
    pub fn from_config(config: &Config, collection: &str) -> Self {
        Self {
            database: config.source.database.clone(),
            collection: collection.to_string(),
            batch_size: config.batch_size_for(collection),
            poll_interval: config.poll_interval_for(collection),
            idle_interval: config.idle_interval(),
            sort_key: config.source.sort_key.clone(),
            sort_order: config.source.sort_order,
            drain_policy: config.source.drain_policy,
            channel_capacity: config.source.channel_capacity,
        }
    }
}

/// Documents fetched by one poll cycle.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    /// Offset of the first document in the batch.
    pub start: u64,
    pub documents: Vec<Document>,
}

impl FetchedBatch {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Receiving side of a running poller.
pub struct PollerHandle {
    pub collection: String,
    pub batches: mpsc::Receiver<FetchedBatch>,
    pub errors: mpsc::Receiver<SyncError>,
    /// Resolves to the offset the poller stopped at.
    pub join: JoinHandle<u64>,
}

#[derive(Debug)]
enum PollState {
    Fetching,
    Logging(Vec<Document>),
    Advancing(Vec<Document>),
    Emitting(FetchedBatch),
    Sleeping(Duration),
    Failed(SyncError),
    Stopped,
}

pub struct BatchPoller {
    config: PollerConfig,
    store: Arc<dyn DocumentStore>,
    cursors: CursorStore,
}

impl BatchPoller {
    pub fn new(config: PollerConfig, store: Arc<dyn DocumentStore>, cursors: CursorStore) -> Self {
        Self {
            config,
            store,
            cursors,
        }
    }

    /// Start the poller on the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> PollerHandle {
        let (batch_tx, batch_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(1);
        let collection = self.config.collection.clone();
        let span = tracing::info_span!("poller", collection = %collection);
        let join = tokio::spawn(self.run(batch_tx, error_tx, cancel).instrument(span));
        PollerHandle {
            collection,
            batches: batch_rx,
            errors: error_rx,
            join,
        }
    }

    /// Run until cancelled, drained under [`DrainPolicy::Stop`], or failed.
    ///
    /// Both channels close when this returns.
    pub async fn run(
        self,
        batches: mpsc::Sender<FetchedBatch>,
        errors: mpsc::Sender<SyncError>,
        cancel: CancellationToken,
    ) -> u64 {
        let collection = self.config.collection.clone();
        let mut cursor = match self.cursors.open(&collection).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::error!(collection = %collection, error = %e, "failed to load cursor");
                let _ = errors.send(e).await;
                return 0;
            }
        };
        metrics::set_cursor_offset(&collection, cursor.offset());
        tracing::info!(collection = %collection, offset = cursor.offset(), "poller started");

        let mut state = PollState::Fetching;
        loop {
            state = match state {
                PollState::Fetching => {
                    if cancel.is_cancelled() {
                        PollState::Stopped
                    } else {
                        self.fetch(&cursor).await
                    }
                }
                PollState::Logging(docs) => {
                    let ids: Vec<String> = docs.iter().map(log_id).collect();
                    match cursor.record(&ids).await {
                        Ok(()) => PollState::Advancing(docs),
                        Err(e) => PollState::Failed(e),
                    }
                }
                PollState::Advancing(docs) => {
                    let start = cursor.offset();
                    cursor.advance(docs.len() as u64);
                    metrics::set_cursor_offset(&collection, cursor.offset());
                    PollState::Emitting(FetchedBatch {
                        start,
                        documents: docs,
                    })
                }
                PollState::Emitting(batch) => {
                    tracing::debug!(
                        collection = %collection,
                        start = batch.start,
                        docs = batch.len(),
                        "emitting batch"
                    );
                    // Blocks while downstream is busy.
                    if batches.send(batch).await.is_err() {
                        tracing::debug!(collection = %collection, "batch receiver dropped");
                        PollState::Stopped
                    } else {
                        PollState::Sleeping(self.config.poll_interval)
                    }
                }
                PollState::Sleeping(pause) => {
                    tokio::select! {
                        _ = cancel.cancelled() => PollState::Stopped,
                        _ = tokio::time::sleep(pause) => PollState::Fetching,
                    }
                }
                PollState::Failed(e) => {
                    tracing::error!(collection = %collection, error = %e, "poller halted");
                    let _ = errors.send(e).await;
                    PollState::Stopped
                }
                PollState::Stopped => break,
            };
        }

        tracing::info!(collection = %collection, offset = cursor.offset(), "poller stopped");
        cursor.offset()
    }

    /// Decide the next state from the collection's count and window.
    async fn fetch(&self, cursor: &Cursor) -> PollState {
        match self.fetch_window(cursor).await {
            Ok(Some(docs)) if !docs.is_empty() => {
                metrics::record_fetched(&self.config.collection, docs.len());
                PollState::Logging(docs)
            }
            // Count said there was more but the window came back empty.
            Ok(Some(_)) => PollState::Sleeping(self.config.idle_interval),
            Ok(None) => match self.config.drain_policy {
                DrainPolicy::Stop => {
                    tracing::info!(
                        collection = %self.config.collection,
                        offset = cursor.offset(),
                        "collection drained, stopping"
                    );
                    PollState::Stopped
                }
                DrainPolicy::KeepPolling => PollState::Sleeping(self.config.idle_interval),
            },
            Err(e) => PollState::Failed(e),
        }
    }

    /// `None` when the collection holds no documents past the offset.
    async fn fetch_window(&self, cursor: &Cursor) -> Result<Option<Vec<Document>>> {
        let cfg = &self.config;
        let total = self.store.count_documents(&cfg.database, &cfg.collection).await?;
        if total <= cursor.offset() {
            tracing::trace!(collection = %cfg.collection, total, "nothing new");
            return Ok(None);
        }

        let window = FindWindow {
            skip: cursor.offset(),
            limit: cfg.batch_size,
            sort_key: cfg.sort_key.clone(),
            order: cfg.sort_order,
        };
        let docs = self.store.find(&cfg.database, &cfg.collection, &window).await?;
        tracing::debug!(
            collection = %cfg.collection,
            total,
            skip = window.skip,
            fetched = docs.len(),
            "fetched window"
        );
        Ok(Some(docs))
    }
}

fn log_id(doc: &Document) -> String {
    document_id(doc.get(LOG_ID_FIELD).unwrap_or(&Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn docs(range: std::ops::Range<u32>) -> Vec<Document> {
        range
            .map(|i| {
                json!({"_id": format!("u{}", i), "created_at": i})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    fn poller_config(order: SortOrder, drain: DrainPolicy) -> PollerConfig {
        PollerConfig {
            database: "test".to_string(),
            collection: "users".to_string(),
            batch_size: 100,
            poll_interval: Duration::ZERO,
            idle_interval: Duration::from_millis(10),
            sort_key: "created_at".to_string(),
            sort_order: order,
            drain_policy: drain,
            channel_capacity: 4,
        }
    }

    fn created_at(batch: &FetchedBatch) -> Vec<u64> {
        batch
            .documents
            .iter()
            .map(|d| d["created_at"].as_u64().unwrap())
            .collect()
    }

    async fn collect(handle: &mut PollerHandle) -> Vec<FetchedBatch> {
        let mut out = Vec::new();
        while let Some(batch) = handle.batches.recv().await {
            out.push(batch);
        }
        out
    }

    #[tokio::test]
    async fn test_drains_in_sort_order() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("test", "users", docs(0..250));
        let cursors = CursorStore::new(temp.path());

        let mut handle = BatchPoller::new(
            poller_config(SortOrder::Descending, DrainPolicy::Stop),
            store,
            cursors.clone(),
        )
        .spawn(CancellationToken::new());

        let batches = collect(&mut handle).await;
        assert_eq!(handle.join.await.unwrap(), 250);

        let sizes: Vec<usize> = batches.iter().map(FetchedBatch::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        let starts: Vec<u64> = batches.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0, 100, 200]);

        let seen: Vec<u64> = batches.iter().flat_map(created_at).collect();
        let expected: Vec<u64> = (0..250).rev().collect();
        assert_eq!(seen, expected);

        assert_eq!(cursors.load("users").await.unwrap(), 250);
        let log = std::fs::read_to_string(cursors.log_path("users")).unwrap();
        assert_eq!(log.lines().next(), Some("u249"));
        assert!(handle.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_resumes_from_durable_log() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("test", "users", docs(0..250));
        let cursors = CursorStore::new(temp.path());

        // A previous run fetched the first 120.
        let ids: Vec<String> = (0..120).map(|i| format!("old-{}", i)).collect();
        cursors.open("users").await.unwrap().record(&ids).await.unwrap();

        let mut handle = BatchPoller::new(
            poller_config(SortOrder::Ascending, DrainPolicy::Stop),
            store,
            cursors.clone(),
        )
        .spawn(CancellationToken::new());

        let batches = collect(&mut handle).await;
        assert_eq!(handle.join.await.unwrap(), 250);
        assert_eq!(batches[0].start, 120);
        assert_eq!(created_at(&batches[0])[0], 120);

        let fetched: usize = batches.iter().map(FetchedBatch::len).sum();
        assert_eq!(fetched, 130);
        assert_eq!(cursors.load("users").await.unwrap(), 250);
    }

    #[tokio::test]
    async fn test_cancel_before_first_fetch() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("test", "users", docs(0..10));
        let cursors = CursorStore::new(temp.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut handle = BatchPoller::new(
            poller_config(SortOrder::Ascending, DrainPolicy::KeepPolling),
            store,
            cursors.clone(),
        )
        .spawn(cancel);

        assert!(handle.batches.recv().await.is_none());
        assert_eq!(handle.join.await.unwrap(), 0);
        assert!(!cursors.log_path("users").exists());
    }

    #[tokio::test]
    async fn test_keep_polling_picks_up_growth() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("test", "users", docs(0..5));
        let dyn_store: Arc<dyn DocumentStore> = store.clone();

        let cancel = CancellationToken::new();
        let mut handle = BatchPoller::new(
            poller_config(SortOrder::Ascending, DrainPolicy::KeepPolling),
            dyn_store,
            CursorStore::new(temp.path()),
        )
        .spawn(cancel.clone());

        let first = handle.batches.recv().await.unwrap();
        assert_eq!(first.len(), 5);

        store.insert("test", "users", docs(5..8));
        let second = handle.batches.recv().await.unwrap();
        assert_eq!(second.start, 5);
        assert_eq!(created_at(&second), vec![5, 6, 7]);

        cancel.cancel();
        assert!(handle.batches.recv().await.is_none());
        assert_eq!(handle.join.await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_store_failure_halts_collection() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("test", "users", docs(0..5));
        store.set_unavailable("users", true);

        let mut handle = BatchPoller::new(
            poller_config(SortOrder::Ascending, DrainPolicy::KeepPolling),
            store,
            CursorStore::new(temp.path()),
        )
        .spawn(CancellationToken::new());

        let err = handle.errors.recv().await.unwrap();
        assert!(matches!(err, SyncError::Store { .. }));
        assert!(handle.batches.recv().await.is_none());
        assert_eq!(handle.join.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_id_still_counts_in_log() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "test",
            "users",
            vec![json!({"created_at": 1}).as_object().cloned().unwrap()],
        );
        let cursors = CursorStore::new(temp.path());

        let mut handle = BatchPoller::new(
            poller_config(SortOrder::Ascending, DrainPolicy::Stop),
            store,
            cursors.clone(),
        )
        .spawn(CancellationToken::new());

        assert_eq!(collect(&mut handle).await.len(), 1);
        assert_eq!(handle.join.await.unwrap(), 1);
        assert_eq!(cursors.load("users").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_string_id_resumes_at_same_offset() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let docs: Vec<Document> = ["", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, id)| json!({"_id": id, "created_at": i}).as_object().cloned().unwrap())
            .collect();
        store.insert("test", "users", docs);
        let dyn_store: Arc<dyn DocumentStore> = store.clone();
        let cursors = CursorStore::new(temp.path());

        let mut handle = BatchPoller::new(
            poller_config(SortOrder::Ascending, DrainPolicy::Stop),
            dyn_store.clone(),
            cursors.clone(),
        )
        .spawn(CancellationToken::new());
        collect(&mut handle).await;
        let stopped_at = handle.join.await.unwrap();
        assert_eq!(stopped_at, 3);

        // Restart: nothing may be fetched twice.
        assert_eq!(cursors.load("users").await.unwrap(), stopped_at);
        let mut handle = BatchPoller::new(
            poller_config(SortOrder::Ascending, DrainPolicy::Stop),
            dyn_store,
            cursors,
        )
        .spawn(CancellationToken::new());
        assert!(collect(&mut handle).await.is_empty());
        assert_eq!(handle.join.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_log_append_failure_halts_without_emitting() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("test", "users", docs(0..5));
        // Loading an absent log yields offset 0, but appending into a
        // missing directory fails.
        let cursors = CursorStore::new(temp.path().join("missing"));

        let mut handle = BatchPoller::new(
            poller_config(SortOrder::Ascending, DrainPolicy::KeepPolling),
            store,
            cursors.clone(),
        )
        .spawn(CancellationToken::new());

        assert!(handle.batches.recv().await.is_none());
        let err = handle.errors.recv().await.unwrap();
        assert!(matches!(err, SyncError::Durability { .. }));
        assert_eq!(handle.join.await.unwrap(), 0);
        assert!(!cursors.log_path("users").exists());
    }
}
