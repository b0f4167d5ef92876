//! Index boundary: a single NDJSON bulk write per batch.

pub mod elasticsearch;
pub mod memory;

pub use elasticsearch::ElasticsearchClient;
pub use memory::MemoryIndex;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Trait for search indexes accepting `_bulk` requests
#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Send one NDJSON bulk body.
    ///
    /// `Err` means the request itself failed and nothing may be assumed
    /// written; per-document failures come back inside the response.
    async fn bulk_write(&self, body: String) -> Result<BulkResponse>;

    /// Human-readable backend name
    fn backend_name(&self) -> &str;
}

/// `_bulk` response body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<BulkItemResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkItemResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<BulkItemResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<BulkItemResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<BulkItemResult>,
}

impl BulkItemResponse {
    /// The result of whichever action this item reports on.
    pub fn result(&self) -> Option<&BulkItemResult> {
        self.index
            .as_ref()
            .or(self.create.as_ref())
            .or(self.delete.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemResult {
    #[serde(rename = "_index", default)]
    pub index: String,
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BulkItemError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub reason: String,
}

/// Action line of a bulk body
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BulkActionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<BulkMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<BulkMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<BulkMeta>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BulkMeta {
    #[serde(rename = "_index")]
    pub index: Option<String>,
    #[serde(rename = "_id")]
    pub id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_partial_failure_response() {
        let body = json!({
            "took": 3,
            "errors": true,
            "items": [
                {"index": {"_index": "users", "_id": "1", "status": 201, "result": "created"}},
                {"index": {"_index": "users", "_id": "2", "status": 400,
                    "error": {"type": "mapper_parsing_exception", "reason": "bad date"}}}
            ]
        });
        let resp: BulkResponse = serde_json::from_value(body).unwrap();
        assert!(resp.errors);
        assert_eq!(resp.items.len(), 2);
        assert!(resp.items[0].result().unwrap().error.is_none());
        let failed = resp.items[1].result().unwrap();
        assert_eq!(failed.id, "2");
        assert_eq!(failed.error.as_ref().unwrap().error_type, "mapper_parsing_exception");
    }

    #[test]
    fn test_action_meta_serializes_index_only() {
        let meta = BulkActionMeta {
            index: Some(BulkMeta {
                index: Some("users".into()),
                id: Some("1".into()),
            }),
            create: None,
            delete: None,
        };
        let line = serde_json::to_string(&meta).unwrap();
        assert_eq!(line, r#"{"index":{"_index":"users","_id":"1"}}"#);
    }
}
