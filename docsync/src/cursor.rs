//! Per-collection cursors backed by append-only durable logs.
//!
//! Each collection has one `<collection>_processed.log` file holding the
//! identifier of every fetched document, one per line, in fetch order. The
//! number of lines is the collection's offset after a restart.
//!
//! A [`Cursor`] is owned by exactly one poller: it carries the in-memory
//! offset and the open append handle, so no state is shared across workers.

use crate::error::{Result, SyncError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const LOG_SUFFIX: &str = "_processed.log";

/// Locates and opens durable logs under one directory.
#[derive(Debug, Clone)]
pub struct CursorStore {
    dir: PathBuf,
}

impl CursorStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}{}", collection, LOG_SUFFIX))
    }

    /// Rebuild a collection's offset from its durable log; 0 when absent.
    pub async fn load(&self, collection: &str) -> Result<u64> {
        let path = self.log_path(collection);
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SyncError::durability(collection, e)),
        };

        let mut lines = BufReader::new(file).lines();
        let mut count = 0u64;
        // Every line is one fetched document, blank or not.
        while lines
            .next_line()
            .await
            .map_err(|e| SyncError::durability(collection, e))?
            .is_some()
        {
            count += 1;
        }
        Ok(count)
    }

    /// Offsets of every collection that has a log in the directory.
    pub async fn load_all(&self) -> Result<HashMap<String, u64>> {
        let mut offsets = HashMap::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(offsets),
            Err(e) => return Err(SyncError::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(collection) = name.to_str().and_then(|n| n.strip_suffix(LOG_SUFFIX)) else {
                continue;
            };
            let offset = self.load(collection).await?;
            offsets.insert(collection.to_string(), offset);
        }
        Ok(offsets)
    }

    /// Open the cursor for a collection, seeded from its log.
    pub async fn open(&self, collection: &str) -> Result<Cursor> {
        let offset = self.load(collection).await?;
        tracing::debug!(collection, offset, "cursor loaded");
        Ok(Cursor {
            collection: collection.to_string(),
            path: self.log_path(collection),
            offset,
            log: None,
        })
    }
}

/// The offset and log handle of a single collection.
#[derive(Debug)]
pub struct Cursor {
    collection: String,
    path: PathBuf,
    offset: u64,
    log: Option<File>,
}

impl Cursor {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Append one line per identifier and sync the log to disk.
    ///
    /// The log file is created on first use and kept open afterwards.
    pub async fn record(&mut self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut buf = String::with_capacity(ids.iter().map(|id| id.len() + 1).sum());
        for id in ids {
            buf.push_str(&log_entry(id));
            buf.push('\n');
        }

        let collection = self.collection.clone();
        let file = match self.log.take() {
            Some(f) => f,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| SyncError::durability(&collection, e))?,
        };
        let file = self.log.insert(file);

        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| SyncError::durability(&collection, e))?;
        file.sync_data()
            .await
            .map_err(|e| SyncError::durability(&collection, e))?;
        Ok(())
    }

    /// Move the offset forward by `n` documents.
    pub fn advance(&mut self, n: u64) {
        self.offset += n;
    }
}

/// One log line per identifier: line breaks would split an entry and an
/// empty id would leave a blank line, so both are rewritten.
fn log_entry(id: &str) -> String {
    if id.is_empty() {
        return "\"\"".to_string();
    }
    id.replace(['\n', '\r'], " ")
}
