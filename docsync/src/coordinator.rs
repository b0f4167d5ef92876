//! Coordinator: discovers collections and runs one pipeline per collection.
//!
//! Each pipeline owns a [`BatchPoller`] and maps and submits its batches in
//! fetch order. Pipelines report back over a single fan-in channel; the
//! coordinator folds those events into a [`SyncReport`] and applies the
//! configured [`ErrorPolicy`].

use crate::bulk::{BulkSubmitter, IndexNaming};
use crate::config::{Config, ErrorPolicy};
use crate::cursor::CursorStore;
use crate::error::{ErrorScope, Result, SyncError};
use crate::index::IndexClient;
use crate::mapper::FieldMapper;
use crate::metrics;
use crate::poller::{BatchPoller, FetchedBatch, PollerConfig};
use crate::store::DocumentStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CollectionStatus {
    #[default]
    Running,
    /// Worker stopped cleanly (cancelled or drained).
    Stopped,
    /// Worker halted on an error.
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct CollectionReport {
    pub fetched: usize,
    pub indexed: usize,
    /// Documents the index refused or that were in a batch whose request failed.
    pub failed: usize,
    /// Documents dropped by mapping (missing unique field).
    pub rejected: usize,
    pub batches: usize,
    pub offset: u64,
    pub errors: Vec<String>,
    pub status: CollectionStatus,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub collections: BTreeMap<String, CollectionReport>,
}

impl SyncReport {
    pub fn collection(&self, name: &str) -> Option<&CollectionReport> {
        self.collections.get(name)
    }

    pub fn total_indexed(&self) -> usize {
        self.collections.values().map(|c| c.indexed).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.collections.values().map(|c| c.failed + c.rejected).sum()
    }

    pub fn failed_collections(&self) -> Vec<&str> {
        self.collections
            .iter()
            .filter(|(_, c)| matches!(c.status, CollectionStatus::Failed(_)))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Debug)]
enum PipelineEvent {
    Batch {
        collection: String,
        fetched: usize,
        indexed: usize,
        failed: usize,
        rejected: usize,
    },
    Error {
        collection: String,
        error: SyncError,
        halted: bool,
    },
    Finished {
        collection: String,
        offset: u64,
    },
}

/// Shared, read-only state handed to every pipeline.
struct Pipeline {
    config: Config,
    store: Arc<dyn DocumentStore>,
    mapper: FieldMapper,
    submitter: BulkSubmitter,
    cursors: CursorStore,
}

pub struct Coordinator {
    pipeline: Arc<Pipeline>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn IndexClient>,
        mapper: FieldMapper,
    ) -> Self {
        let cursors = CursorStore::new(config.cursor_dir());
        let submitter = BulkSubmitter::new(index, IndexNaming::new(config.index.rollover));
        Self {
            pipeline: Arc::new(Pipeline {
                config,
                store,
                mapper,
                submitter,
                cursors,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.pipeline.config
    }

    /// Collections in the configured database that pass the allow-list.
    pub async fn discover(&self) -> Result<Vec<String>> {
        let p = &self.pipeline;
        let all = p.store.list_collections(&p.config.source.database).await?;
        let (selected, skipped): (Vec<String>, Vec<String>) =
            all.into_iter().partition(|c| p.config.is_allowed(c));
        if !skipped.is_empty() {
            tracing::debug!(?skipped, "collections not in allow-list");
        }
        tracing::info!(
            database = %p.config.source.database,
            store = p.store.store_name(),
            collections = ?selected,
            "discovered collections"
        );
        Ok(selected)
    }

    /// Run every collection until cancelled, drained or failed.
    ///
    /// Failing to enumerate collections is returned as an error. Under
    /// [`ErrorPolicy::Abort`] the first collection error cancels all workers
    /// and is returned once they have stopped; otherwise it is recorded in the
    /// report.
    pub async fn run(&self, cancel: CancellationToken) -> Result<SyncReport> {
        let collections = self.discover().await?;
        let policy = self.pipeline.config.on_collection_error;
        let workers = cancel.child_token();
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut report = SyncReport::default();
        let mut tasks = Vec::with_capacity(collections.len());
        for collection in collections {
            report
                .collections
                .insert(collection.clone(), CollectionReport::default());
            let pipeline = self.pipeline.clone();
            let events = events_tx.clone();
            let token = workers.clone();
            let name = collection.clone();
            let span = tracing::info_span!("collection", collection = %collection);
            let task = tokio::spawn(
                async move { pipeline.run_collection(name, token, events).await }.instrument(span),
            );
            tasks.push((collection, task));
        }
        drop(events_tx);

        let mut abort_error: Option<SyncError> = None;
        while let Some(event) = events_rx.recv().await {
            match event {
                PipelineEvent::Batch {
                    collection,
                    fetched,
                    indexed,
                    failed,
                    rejected,
                } => {
                    let entry = report.collections.entry(collection).or_default();
                    entry.batches += 1;
                    entry.fetched += fetched;
                    entry.indexed += indexed;
                    entry.failed += failed;
                    entry.rejected += rejected;
                }
                PipelineEvent::Error {
                    collection,
                    error,
                    halted,
                } => {
                    metrics::record_collection_error(&collection, error.kind());
                    tracing::warn!(collection = %collection, error = %error, halted, "collection error");
                    let entry = report.collections.entry(collection).or_default();
                    entry.errors.push(error.to_string());
                    if halted {
                        entry.status = CollectionStatus::Failed(error.to_string());
                    }
                    if policy == ErrorPolicy::Abort && abort_error.is_none() {
                        tracing::error!("aborting all collections after error");
                        workers.cancel();
                        abort_error = Some(error);
                    }
                }
                PipelineEvent::Finished { collection, offset } => {
                    let entry = report.collections.entry(collection).or_default();
                    entry.offset = offset;
                    if entry.status == CollectionStatus::Running {
                        entry.status = CollectionStatus::Stopped;
                    }
                }
            }
        }

        let (names, handles): (Vec<String>, Vec<_>) = tasks.into_iter().unzip();
        for (name, joined) in names.into_iter().zip(futures::future::join_all(handles).await) {
            if let Err(e) = joined {
                tracing::error!(collection = %name, error = %e, "pipeline task failed");
                let lost = SyncError::WorkerLost(name.clone());
                let entry = report.collections.entry(name).or_default();
                entry.status = CollectionStatus::Failed(lost.to_string());
                if policy == ErrorPolicy::Abort && abort_error.is_none() {
                    abort_error = Some(lost);
                }
            }
        }

        if let Some(error) = abort_error {
            return Err(error);
        }
        tracing::info!(
            indexed = report.total_indexed(),
            failed = report.total_failed(),
            "synchronization finished"
        );
        Ok(report)
    }
}

impl Pipeline {
    async fn run_collection(
        self: Arc<Self>,
        collection: String,
        cancel: CancellationToken,
        events: mpsc::Sender<PipelineEvent>,
    ) {
        let poller = BatchPoller::new(
            PollerConfig::from_config(&self.config, &collection),
            self.store.clone(),
            self.cursors.clone(),
        );
        let mut handle = poller.spawn(cancel);
        let prefix = self.config.index_prefix_for(&collection);
        let unique_field = self.config.unique_field_for(&prefix, &collection);
        tracing::debug!(collection = %collection, index = %prefix, unique_field = %unique_field, "pipeline started");

        // Batches keep flowing until the poller stops and closes the channel.
        while let Some(batch) = handle.batches.recv().await {
            self.process_batch(&collection, &prefix, &unique_field, batch, &events)
                .await;
        }

        if let Some(error) = handle.errors.recv().await {
            let halted = error.halts_worker() || error.scope() == ErrorScope::Process;
            let _ = events
                .send(PipelineEvent::Error {
                    collection: collection.clone(),
                    error,
                    halted,
                })
                .await;
        }

        let offset = match handle.join.await {
            Ok(offset) => offset,
            Err(e) => {
                tracing::error!(collection = %collection, error = %e, "poller task failed");
                let _ = events
                    .send(PipelineEvent::Error {
                        collection: collection.clone(),
                        error: SyncError::WorkerLost(collection.clone()),
                        halted: true,
                    })
                    .await;
                0
            }
        };
        let _ = events
            .send(PipelineEvent::Finished { collection, offset })
            .await;
    }

    async fn process_batch(
        &self,
        collection: &str,
        prefix: &str,
        unique_field: &str,
        batch: FetchedBatch,
        events: &mpsc::Sender<PipelineEvent>,
    ) {
        let fetched = batch.len();
        let mapped = self
            .mapper
            .map_batch(collection, prefix, unique_field, batch.documents);
        let rejected = mapped.rejected.len();
        if rejected > 0 {
            metrics::record_failed(collection, "rejected", rejected);
        }

        // Rejections travel with index and transport errors; none halt the worker.
        let mut errors = mapped.rejected;
        let (indexed, failed) = match self.submitter.submit(&mapped.records, prefix).await {
            Ok(outcome) => {
                let indexed = outcome.succeeded();
                let failed = outcome.failures.len();
                if let Err(e) = outcome.into_result() {
                    metrics::record_failed(collection, "index", failed);
                    errors.push(e);
                }
                (indexed, failed)
            }
            Err(e) => {
                metrics::record_failed(collection, "transport", mapped.records.len());
                let failed = mapped.records.len();
                errors.push(e);
                (0, failed)
            }
        };
        metrics::record_indexed(collection, indexed);
        metrics::record_batch(collection, errors.is_empty());

        let _ = events
            .send(PipelineEvent::Batch {
                collection: collection.to_string(),
                fetched,
                indexed,
                failed,
                rejected,
            })
            .await;
        for error in errors {
            let _ = events
                .send(PipelineEvent::Error {
                    collection: collection.to_string(),
                    error,
                    halted: false,
                })
                .await;
        }
    }
}
