//! In-process document store.

use super::{apply_window, DocumentStore, FindWindow};
use crate::error::{Result, SyncError};
use crate::value::Document;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

#[derive(Default)]
pub struct MemoryStore {
    // database -> collection -> documents in insertion order
    databases: RwLock<BTreeMap<String, BTreeMap<String, Vec<Document>>>>,
    unavailable: RwLock<HashSet<String>>,
    listing_fails: RwLock<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append documents to a collection, creating it if needed.
    pub fn insert(&self, database: &str, collection: &str, docs: impl IntoIterator<Item = Document>) {
        self.databases
            .write()
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
    }

    /// Make every count/find on a collection fail until restored.
    pub fn set_unavailable(&self, collection: &str, unavailable: bool) {
        let mut set = self.unavailable.write();
        if unavailable {
            set.insert(collection.to_string());
        } else {
            set.remove(collection);
        }
    }

    /// Make `list_collections` fail.
    pub fn set_listing_fails(&self, fails: bool) {
        *self.listing_fails.write() = fails;
    }

    fn check_available(&self, collection: &str) -> Result<()> {
        if self.unavailable.read().contains(collection) {
            return Err(SyncError::store(collection, "collection unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_collections(&self, database: &str) -> Result<Vec<String>> {
        if *self.listing_fails.read() {
            return Err(SyncError::ListCollections {
                database: database.to_string(),
                reason: "store unreachable".to_string(),
            });
        }
        Ok(self
            .databases
            .read()
            .get(database)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn count_documents(&self, database: &str, collection: &str) -> Result<u64> {
        self.check_available(collection)?;
        Ok(self
            .databases
            .read()
            .get(database)
            .and_then(|colls| colls.get(collection))
            .map(|docs| docs.len() as u64)
            .unwrap_or(0))
    }

    async fn find(&self, database: &str, collection: &str, window: &FindWindow) -> Result<Vec<Document>> {
        self.check_available(collection)?;
        let docs = self
            .databases
            .read()
            .get(database)
            .and_then(|colls| colls.get(collection))
            .cloned()
            .unwrap_or_default();
        Ok(apply_window(docs, window))
    }

    fn store_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SortOrder;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_count_find() {
        let store = MemoryStore::new();
        store.insert(
            "db",
            "users",
            (0..3).map(|n| json!({"_id": n, "created_at": n}).as_object().cloned().unwrap()),
        );

        assert_eq!(store.list_collections("db").await.unwrap(), vec!["users".to_string()]);
        assert_eq!(store.count_documents("db", "users").await.unwrap(), 3);
        assert_eq!(store.count_documents("db", "missing").await.unwrap(), 0);

        let window = FindWindow {
            skip: 0,
            limit: 2,
            sort_key: "created_at".into(),
            order: SortOrder::Ascending,
        };
        let docs = store.find("db", "users", &window).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["_id"], json!(0));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.set_unavailable("users", true);
        assert!(store.count_documents("db", "users").await.is_err());
        store.set_unavailable("users", false);
        assert!(store.count_documents("db", "users").await.is_ok());

        store.set_listing_fails(true);
        assert!(matches!(
            store.list_collections("db").await,
            Err(SyncError::ListCollections { .. })
        ));
    }
}
