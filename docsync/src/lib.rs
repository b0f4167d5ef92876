//! docsync: incremental synchronization from a document store into a search index
//!
//! Pipeline per collection:
//! - poller: count, fetch a window, log ids, advance the cursor
//! - mapper: flatten and rename fields
//! - bulk: one `_bulk` request per batch, per-document failures reported

pub mod bulk;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod index;
pub mod mapper;
pub mod metrics;
pub mod poller;
pub mod store;
pub mod value;

pub use bulk::{BulkOutcome, BulkSubmitter, IndexNaming, ItemFailure};
pub use config::Config;
pub use coordinator::{CollectionReport, CollectionStatus, Coordinator, SyncReport};
pub use cursor::{Cursor, CursorStore};
pub use error::{ErrorScope, Result, SyncError};
pub use index::{ElasticsearchClient, IndexClient, MemoryIndex};
pub use mapper::{FieldMap, FieldMapper, MappedBatch, MappedRecord};
pub use poller::{BatchPoller, FetchedBatch, PollerConfig, PollerHandle};
pub use store::{DocumentStore, FindWindow, JsonlStore, MemoryStore};
pub use value::{Document, FlatRecord};
