use thiserror::Error;

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Halts (or is reported against) a single collection; siblings keep running.
    Collection,
    /// Terminates the whole synchronization run.
    Process,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Source store error on '{collection}': {reason}")]
    Store { collection: String, reason: String },

    #[error("Durable log error for '{collection}': {source}")]
    Durability {
        collection: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Mapping failed in '{collection}' for document '{id}': {reason}")]
    Mapping {
        collection: String,
        id: String,
        reason: String,
    },

    #[error("Document in '{collection}' is missing unique field '{field}'")]
    MissingUniqueField { collection: String, field: String },

    #[error("Index transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Index returned status {status}: {body}")]
    IndexStatus { status: u16, body: String },

    #[error("{failed} document(s) rejected by index '{index}', first '{first_id}': {reason}")]
    PartialBulk {
        index: String,
        failed: usize,
        first_id: String,
        reason: String,
    },

    #[error("Failed to list collections in '{database}': {reason}")]
    ListCollections { database: String, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Worker for '{0}' stopped unexpectedly")]
    WorkerLost(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn store(collection: &str, reason: impl ToString) -> Self {
        SyncError::Store {
            collection: collection.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn durability(collection: &str, source: std::io::Error) -> Self {
        SyncError::Durability {
            collection: collection.to_string(),
            source,
        }
    }

    /// Classify the error for the coordinator.
    ///
    /// Only failures that leave no collection to work on are process-wide:
    /// enumerating collections and loading configuration.
    pub fn scope(&self) -> ErrorScope {
        match self {
            SyncError::ListCollections { .. } | SyncError::Config(_) | SyncError::Toml(_) => {
                ErrorScope::Process
            }
            _ => ErrorScope::Collection,
        }
    }

    /// Errors after which the collection's worker must not continue.
    pub fn halts_worker(&self) -> bool {
        matches!(
            self,
            SyncError::Store { .. } | SyncError::Durability { .. } | SyncError::WorkerLost(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Store { .. } => "store",
            SyncError::Durability { .. } => "durability",
            SyncError::Mapping { .. } | SyncError::MissingUniqueField { .. } => "mapping",
            SyncError::Transport(_) | SyncError::IndexStatus { .. } => "transport",
            SyncError::PartialBulk { .. } => "partial_bulk",
            SyncError::ListCollections { .. } => "list_collections",
            SyncError::Config(_) | SyncError::Toml(_) => "config",
            SyncError::Io(_) => "io",
            SyncError::Json(_) => "json",
            SyncError::WorkerLost(_) => "worker_lost",
        }
    }
}
