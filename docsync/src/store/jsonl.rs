//! Directory-backed document store.
//!
//! Layout: `<root>/<database>/<collection>.jsonl`, one JSON object per line.
//! Producers append lines; the engine picks them up on the next poll.

use super::{apply_window, DocumentStore, FindWindow};
use crate::error::{Result, SyncError};
use crate::value::Document;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

const EXTENSION: &str = "jsonl";

pub struct JsonlStore {
    root: PathBuf,
}

impl JsonlStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn collection_path(&self, database: &str, collection: &str) -> PathBuf {
        self.root
            .join(database)
            .join(format!("{}.{}", collection, EXTENSION))
    }

    async fn read_lines(&self, database: &str, collection: &str) -> Result<Option<String>> {
        let path = self.collection_path(database, collection);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::store(collection, format!("read {}: {}", path.display(), e))),
        }
    }
}

/// The newline-terminated part of the file. A final line without `\n` may
/// still be mid-append and is left for the next poll.
fn complete_lines(content: &str) -> &str {
    match content.rfind('\n') {
        Some(end) => &content[..=end],
        None => "",
    }
}

fn parse_documents(collection: &str, content: &str) -> Result<Vec<Document>> {
    complete_lines(content)
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<Document>(line)
                .map_err(|e| SyncError::store(collection, format!("line {}: {}", n + 1, e)))
        })
        .collect()
}

#[async_trait]
impl DocumentStore for JsonlStore {
    async fn list_collections(&self, database: &str) -> Result<Vec<String>> {
        let dir = self.root.join(database);
        let list_err = |reason: String| SyncError::ListCollections {
            database: database.to_string(),
            reason,
        };

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| list_err(format!("{}: {}", dir.display(), e)))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| list_err(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn count_documents(&self, database: &str, collection: &str) -> Result<u64> {
        Ok(self
            .read_lines(database, collection)
            .await?
            .map(|content| {
                complete_lines(&content)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn find(&self, database: &str, collection: &str, window: &FindWindow) -> Result<Vec<Document>> {
        let Some(content) = self.read_lines(database, collection).await? else {
            return Ok(Vec::new());
        };
        let docs = parse_documents(collection, &content)?;
        Ok(apply_window(docs, window))
    }

    fn store_name(&self) -> &str {
        "jsonl"
    }
}
