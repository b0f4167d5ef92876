//! In-process index that understands the `_bulk` wire format.

use super::{BulkActionMeta, BulkItemError, BulkItemResponse, BulkItemResult, BulkResponse, IndexClient};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

#[derive(Default)]
pub struct MemoryIndex {
    // index -> id -> source
    indices: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    rejected_ids: RwLock<HashSet<String>>,
    unavailable: RwLock<bool>,
    requests: RwLock<usize>,
}

/// One parsed index/create action.
struct IndexAction {
    index: String,
    id: String,
    doc: Value,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every document with this id at item level.
    pub fn reject_id(&self, id: &str) {
        self.rejected_ids.write().insert(id.to_string());
    }

    /// Fail whole requests with a 503.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write() = unavailable;
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.indices.read().get(index).and_then(|docs| docs.get(id)).cloned()
    }

    pub fn ids(&self, index: &str) -> Vec<String> {
        self.indices
            .read()
            .get(index)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, index: &str) -> usize {
        self.indices.read().get(index).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn total_count(&self) -> usize {
        self.indices.read().values().map(BTreeMap::len).sum()
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indices.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn request_count(&self) -> usize {
        *self.requests.read()
    }
}

/// Parse an NDJSON bulk body into index actions.
fn parse_bulk_body(body: &str) -> Result<Vec<IndexAction>> {
    let invalid = |reason: String| SyncError::IndexStatus { status: 400, body: reason };
    let lines: Vec<&str> = body.lines().filter(|l| !l.is_empty()).collect();

    let mut actions = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let meta: BulkActionMeta = serde_json::from_str(lines[i])
            .map_err(|e| invalid(format!("Invalid action: {}", e)))?;

        let Some(target) = meta.index.or(meta.create) else {
            return Err(invalid(format!("Unsupported action on line {}", i + 1)));
        };
        let index = target.index.ok_or_else(|| invalid("Missing _index".to_string()))?;
        let id = target.id.ok_or_else(|| invalid("Missing _id".to_string()))?;

        i += 1;
        let line = lines
            .get(i)
            .ok_or_else(|| invalid("Missing document body".to_string()))?;
        let doc: Value = serde_json::from_str(line).map_err(|e| invalid(format!("Invalid doc: {}", e)))?;

        actions.push(IndexAction { index, id, doc });
        i += 1;
    }
    Ok(actions)
}

#[async_trait]
impl IndexClient for MemoryIndex {
    async fn bulk_write(&self, body: String) -> Result<BulkResponse> {
        let start = Instant::now();
        *self.requests.write() += 1;

        if *self.unavailable.read() {
            return Err(SyncError::IndexStatus {
                status: 503,
                body: "index unavailable".to_string(),
            });
        }

        let actions = parse_bulk_body(&body)?;
        let rejected = self.rejected_ids.read().clone();
        let mut indices = self.indices.write();

        let mut items = Vec::with_capacity(actions.len());
        let mut has_errors = false;
        for action in actions {
            let (status, result, error) = if rejected.contains(&action.id) {
                has_errors = true;
                (
                    400,
                    None,
                    Some(BulkItemError {
                        error_type: "mapper_parsing_exception".to_string(),
                        reason: format!("document [{}] rejected", action.id),
                    }),
                )
            } else if !action.doc.is_object() {
                has_errors = true;
                (
                    400,
                    None,
                    Some(BulkItemError {
                        error_type: "mapper_parsing_exception".to_string(),
                        reason: "Document must be an object".to_string(),
                    }),
                )
            } else {
                let previous = indices
                    .entry(action.index.clone())
                    .or_default()
                    .insert(action.id.clone(), action.doc);
                let result = if previous.is_some() { "updated" } else { "created" };
                (if previous.is_some() { 200 } else { 201 }, Some(result.to_string()), None)
            };

            items.push(BulkItemResponse {
                index: Some(BulkItemResult {
                    index: action.index,
                    id: action.id,
                    status,
                    result,
                    error,
                }),
                create: None,
                delete: None,
            });
        }

        Ok(BulkResponse {
            took: start.elapsed().as_millis() as u64,
            errors: has_errors,
            items,
        })
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(docs: &[(&str, Value)]) -> String {
        docs.iter()
            .map(|(id, doc)| format!("{{\"index\":{{\"_index\":\"users\",\"_id\":\"{}\"}}}}\n{}\n", id, doc))
            .collect()
    }

    #[tokio::test]
    async fn test_bulk_indexes_documents() {
        let index = MemoryIndex::new();
        let resp = index
            .bulk_write(body(&[("1", json!({"name": "Alice"})), ("2", json!({"name": "Bob"}))]))
            .await
            .unwrap();

        assert!(!resp.errors);
        assert_eq!(resp.items.len(), 2);
        assert_eq!(index.count("users"), 2);
        assert_eq!(index.document("users", "1").unwrap(), json!({"name": "Alice"}));

        let resp = index.bulk_write(body(&[("1", json!({"name": "Alicia"}))])).await.unwrap();
        assert_eq!(resp.items[0].result().unwrap().status, 200);
        assert_eq!(index.count("users"), 2);
    }

    #[tokio::test]
    async fn test_rejected_id_fails_only_that_item() {
        let index = MemoryIndex::new();
        index.reject_id("2");
        let resp = index
            .bulk_write(body(&[("1", json!({})), ("2", json!({})), ("3", json!({}))]))
            .await
            .unwrap();

        assert!(resp.errors);
        let failed: Vec<&str> = resp
            .items
            .iter()
            .filter_map(|i| i.result())
            .filter(|r| r.error.is_some())
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(failed, vec!["2"]);
        assert_eq!(index.ids("users"), vec!["1".to_string(), "3".to_string()]);
    }

    #[tokio::test]
    async fn test_unavailable_and_malformed() {
        let index = MemoryIndex::new();
        index.set_unavailable(true);
        assert!(index.bulk_write(body(&[("1", json!({}))])).await.is_err());
        index.set_unavailable(false);

        let err = index
            .bulk_write("{\"index\":{\"_index\":\"users\",\"_id\":\"1\"}}\n".into())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Missing document body"));
        assert_eq!(index.request_count(), 2);
    }
}
