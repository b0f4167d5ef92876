//! Bulk submission of mapped records.

use crate::config::Rollover;
use crate::error::{Result, SyncError};
use crate::index::{BulkActionMeta, BulkMeta, IndexClient};
use crate::mapper::MappedRecord;
use crate::metrics;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Field the index keeps as document metadata; it may not appear in a body.
const ID_FIELD: &str = "_id";

/// Resolves the concrete index name for a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexNaming {
    pub rollover: Rollover,
}

impl IndexNaming {
    pub fn new(rollover: Rollover) -> Self {
        Self { rollover }
    }

    pub fn resolve(&self, prefix: &str) -> String {
        self.resolve_on(prefix, Utc::now().date_naive())
    }

    pub fn resolve_on(&self, prefix: &str, date: NaiveDate) -> String {
        match self.rollover {
            Rollover::Daily => format!("{}-{}", prefix, date.format("%Y-%m-%d")),
            Rollover::None => prefix.to_string(),
        }
    }
}

/// A document the index refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub id: String,
    pub status: u16,
    pub error_type: String,
    pub reason: String,
}

/// What happened to one bulk request.
#[derive(Debug, Clone, Default)]
pub struct BulkOutcome {
    pub index: String,
    pub submitted: usize,
    pub failures: Vec<ItemFailure>,
}

impl BulkOutcome {
    pub fn succeeded(&self) -> usize {
        self.submitted - self.failures.len().min(self.submitted)
    }

    pub fn is_partial_failure(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Turn per-item failures into an error naming the first one.
    pub fn into_result(self) -> Result<BulkOutcome> {
        match self.failures.first() {
            None => Ok(self),
            Some(first) => Err(SyncError::PartialBulk {
                index: self.index.clone(),
                failed: self.failures.len(),
                first_id: first.id.clone(),
                reason: format!("{}: {}", first.error_type, first.reason),
            }),
        }
    }
}

/// Packages records into one `_bulk` request per batch.
pub struct BulkSubmitter {
    client: Arc<dyn IndexClient>,
    naming: IndexNaming,
}

impl BulkSubmitter {
    pub fn new(client: Arc<dyn IndexClient>, naming: IndexNaming) -> Self {
        Self { client, naming }
    }

    pub fn naming(&self) -> IndexNaming {
        self.naming
    }

    /// Submit a batch to the index resolved from `target` (an index prefix).
    ///
    /// `Err` means the request failed as a whole. Documents the index refused
    /// while accepting others are listed in the outcome's `failures`.
    pub async fn submit(&self, records: &[MappedRecord], target: &str) -> Result<BulkOutcome> {
        let index = self.naming.resolve(target);
        if records.is_empty() {
            return Ok(BulkOutcome {
                index,
                ..BulkOutcome::default()
            });
        }

        let body = build_body(records, &index)?;
        let start = Instant::now();
        let response = self.client.bulk_write(body).await;
        metrics::record_bulk_duration(target, start.elapsed());
        let response = response?;

        let mut outcome = BulkOutcome {
            index: index.clone(),
            submitted: records.len(),
            failures: Vec::new(),
        };

        // `errors` is only a hint; inspect every item regardless.
        for item in response.items.iter().filter_map(|i| i.result()) {
            if let Some(err) = &item.error {
                outcome.failures.push(ItemFailure {
                    id: item.id.clone(),
                    status: item.status,
                    error_type: err.error_type.clone(),
                    reason: err.reason.clone(),
                });
            }
        }
        if response.errors && outcome.failures.is_empty() {
            outcome.failures.push(ItemFailure {
                id: String::new(),
                status: 0,
                error_type: "unknown".to_string(),
                reason: "index reported errors without item detail".to_string(),
            });
        }

        if outcome.is_partial_failure() {
            tracing::warn!(
                index = %index,
                failed = outcome.failures.len(),
                submitted = outcome.submitted,
                "bulk request partially failed"
            );
        } else {
            tracing::debug!(index = %index, docs = records.len(), took_ms = response.took, "bulk indexed");
        }
        Ok(outcome)
    }
}

/// Build the NDJSON body: an action line then a source line per record.
pub fn build_body(records: &[MappedRecord], index: &str) -> Result<String> {
    let mut body = String::new();
    for record in records {
        let meta = BulkActionMeta {
            index: Some(BulkMeta {
                index: Some(index.to_string()),
                id: Some(record.id.clone()),
            }),
            create: None,
            delete: None,
        };
        body.push_str(&serde_json::to_string(&meta)?);
        body.push('\n');

        let mut source = record.fields.clone();
        source.remove(ID_FIELD);
        body.push_str(&serde_json::to_string(&Value::Object(source))?);
        body.push('\n');
    }
    Ok(body)
}
