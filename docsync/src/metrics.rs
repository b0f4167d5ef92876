//! Synchronization metrics
//!
//! Recorded through the `metrics` facade; the binary decides whether an
//! exporter is installed. Every series is labelled by collection.

use std::time::Duration;

/// Record documents returned by one fetch
pub fn record_fetched(collection: &str, count: usize) {
    metrics::counter!(
        "docsync_documents_fetched_total",
        "collection" => collection.to_string(),
    )
    .increment(count as u64);
}

/// Record documents the index accepted
pub fn record_indexed(collection: &str, count: usize) {
    metrics::counter!(
        "docsync_documents_indexed_total",
        "collection" => collection.to_string(),
    )
    .increment(count as u64);
}

/// Record documents that were fetched but not indexed
pub fn record_failed(collection: &str, reason: &str, count: usize) {
    metrics::counter!(
        "docsync_documents_failed_total",
        "collection" => collection.to_string(),
        "reason" => reason.to_string(),
    )
    .increment(count as u64);
}

/// Record a processed batch
pub fn record_batch(collection: &str, success: bool) {
    let status = if success { "ok" } else { "error" };
    metrics::counter!(
        "docsync_batches_total",
        "collection" => collection.to_string(),
        "status" => status,
    )
    .increment(1);
}

/// Record an error reported against a collection
pub fn record_collection_error(collection: &str, error_type: &str) {
    metrics::counter!(
        "docsync_collection_errors_total",
        "collection" => collection.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Update the cursor offset gauge
pub fn set_cursor_offset(collection: &str, offset: u64) {
    metrics::gauge!(
        "docsync_cursor_offset",
        "collection" => collection.to_string(),
    )
    .set(offset as f64);
}

/// Record the round-trip of one bulk request
pub fn record_bulk_duration(index_prefix: &str, duration: Duration) {
    metrics::histogram!(
        "docsync_bulk_duration_seconds",
        "index" => index_prefix.to_string(),
    )
    .record(duration.as_secs_f64());
}
