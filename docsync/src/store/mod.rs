//! Source store boundary.
//!
//! The engine only needs three things from a document store: the collection
//! names of a database, a collection's current document count, and a sorted
//! window of documents. Every `find` call is independent; no live cursor is
//! held between polls.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

use crate::config::SortOrder;
use crate::error::Result;
use crate::value::Document;
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;

/// The slice of a collection requested by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindWindow {
    pub skip: u64,
    pub limit: usize,
    pub sort_key: String,
    pub order: SortOrder,
}

/// Trait for source document stores (MongoDB, JSONL directories, etc.)
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Names of the collections in a database
    async fn list_collections(&self, database: &str) -> Result<Vec<String>>;

    /// Current number of documents in a collection
    async fn count_documents(&self, database: &str, collection: &str) -> Result<u64>;

    /// Fetch a sorted window of documents
    async fn find(&self, database: &str, collection: &str, window: &FindWindow) -> Result<Vec<Document>>;

    /// Human-readable store name
    fn store_name(&self) -> &str;
}

/// Sort documents by `window.sort_key` and cut out the requested window.
///
/// Documents without the key sort after those that have it in either
/// direction; ties keep insertion order.
pub(crate) fn apply_window(mut docs: Vec<Document>, window: &FindWindow) -> Vec<Document> {
    docs.sort_by(|a, b| {
        match (a.get(&window.sort_key), b.get(&window.sort_key)) {
            (Some(x), Some(y)) => {
                let ord = compare_values(x, y);
                match window.order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    });

    let skip = usize::try_from(window.skip).unwrap_or(usize::MAX);
    docs.into_iter().skip(skip).take(window.limit).collect()
}

/// Total order over JSON scalars used for sort keys: null < bool < number < string.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
