//! Field mapping and flattening.
//!
//! A raw document goes through three steps on its way to the index:
//!
//! ```text
//! flatten          {"stats": {"country": "USA"}}  ->  {"stats.country": "USA"}
//! map_collection   rename keys found in the collection's field map, keep the rest
//! map_index        keep only keys found in the index's field map, renamed
//! ```
//!
//! Field maps are loaded once at startup from `<dir>/<name>.json` and never
//! change afterwards, so the mapper is shared read-only between workers.

use crate::config::{ArrayPolicy, Config, MappingConfig};
use crate::error::{Result, SyncError};
use crate::value::{coalesce_rows, document_id, extended_scalar, object_rows, Document, FlatRecord};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Source field path to destination field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    entries: BTreeMap<String, String>,
}

impl FieldMap {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Build from a JSON object; nested objects become joined paths.
    pub fn from_value(value: &Value, separator: &str) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| SyncError::Config("field map must be a JSON object".into()))?;
        let mut entries = BTreeMap::new();
        collect_map_entries("", obj, separator, &mut entries)?;
        Ok(Self { entries })
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.entries.get(source).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether some entry addresses a sub-field of `key`.
    fn routes_into(&self, key: &str, separator: &str) -> bool {
        let prefix = format!("{}{}", key, separator);
        self.entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }
}

fn collect_map_entries(
    prefix: &str,
    obj: &serde_json::Map<String, Value>,
    separator: &str,
    out: &mut BTreeMap<String, String>,
) -> Result<()> {
    for (key, value) in obj {
        let path = join(prefix, key, separator);
        match value {
            Value::String(dest) => {
                out.insert(path, dest.clone());
            }
            Value::Object(nested) => collect_map_entries(&path, nested, separator, out)?,
            other => {
                return Err(SyncError::Config(format!(
                    "field map entry '{}' must be a string, got {}",
                    path, other
                )))
            }
        }
    }
    Ok(())
}

fn join(prefix: &str, key: &str, separator: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", prefix, separator, key)
    }
}

/// A flattened, mapped document ready for the index.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub id: String,
    pub fields: FlatRecord,
}

/// Result of mapping one batch.
///
/// Documents without a usable identifier are left out of `records` and
/// reported in `rejected`; the rest of the batch is unaffected.
#[derive(Debug, Default)]
pub struct MappedBatch {
    pub records: Vec<MappedRecord>,
    pub rejected: Vec<SyncError>,
}

pub struct FieldMapper {
    collections: HashMap<String, FieldMap>,
    indices: HashMap<String, FieldMap>,
    separator: String,
    array_policy: ArrayPolicy,
}

impl FieldMapper {
    pub fn new(config: &MappingConfig) -> Self {
        Self {
            collections: HashMap::new(),
            indices: HashMap::new(),
            separator: config.separator.clone(),
            array_policy: config.array_policy,
        }
    }

    /// Load collection and index field maps from the configured directories.
    pub fn load(config: &Config) -> Result<Self> {
        let mut mapper = Self::new(&config.mapping);
        mapper.collections = load_map_dir(&config.paths.collection_maps_dir, &mapper.separator)?;
        mapper.indices = load_map_dir(&config.paths.index_maps_dir, &mapper.separator)?;
        tracing::info!(
            collections = mapper.collections.len(),
            indices = mapper.indices.len(),
            "field maps loaded"
        );
        Ok(mapper)
    }

    pub fn with_collection_map(mut self, collection: &str, map: FieldMap) -> Self {
        self.collections.insert(collection.to_string(), map);
        self
    }

    pub fn with_index_map(mut self, index: &str, map: FieldMap) -> Self {
        self.indices.insert(index.to_string(), map);
        self
    }

    pub fn collection_map(&self, collection: &str) -> Option<&FieldMap> {
        self.collections.get(collection)
    }

    pub fn index_map(&self, index: &str) -> Option<&FieldMap> {
        self.indices.get(index)
    }

    /// Flatten a nested document into joined-path keys.
    ///
    /// Objects without any leaf contribute nothing. Extended-JSON scalars
    /// (`{"$oid": ..}`) count as leaves.
    pub fn flatten(&self, doc: &Document) -> FlatRecord {
        let mut out = FlatRecord::new();
        self.flatten_into("", doc, &mut out);
        out
    }

    fn flatten_into(&self, prefix: &str, obj: &serde_json::Map<String, Value>, out: &mut FlatRecord) {
        for (key, value) in obj {
            let path = join(prefix, key, &self.separator);
            self.flatten_value(path, value, out);
        }
    }

    fn flatten_value(&self, path: String, value: &Value, out: &mut FlatRecord) {
        match value {
            Value::Object(nested) => match extended_scalar(nested) {
                Some(scalar) => {
                    out.insert(path, scalar);
                }
                None => self.flatten_into(&path, nested, out),
            },
            Value::Array(items) if self.array_policy == ArrayPolicy::Index && !items.is_empty() => {
                for (i, item) in items.iter().enumerate() {
                    self.flatten_value(join(&path, &i.to_string(), &self.separator), item, out);
                }
            }
            other => {
                out.insert(path, other.clone());
            }
        }
    }

    /// Rename keys found in the collection's field map; others pass through.
    pub fn map_collection(&self, collection: &str, record: FlatRecord) -> FlatRecord {
        let Some(map) = self.collections.get(collection) else {
            return record;
        };
        let record = self.expand_routed_arrays(map, record);

        let mut out = FlatRecord::new();
        let mut renamed = Vec::new();
        for (key, value) in record {
            match map.get(&key) {
                Some(dest) => renamed.push((dest.to_string(), value)),
                None => {
                    out.insert(key, value);
                }
            }
        }
        // Renamed fields win over same-named pass-through fields.
        out.extend(renamed);
        out
    }

    /// Project a record through the index's field map.
    ///
    /// Only mapped keys survive. Without a map the record passes unchanged.
    pub fn map_index(&self, index: &str, record: FlatRecord) -> FlatRecord {
        let Some(map) = self.indices.get(index) else {
            return record;
        };
        let mut record = self.expand_routed_arrays(map, record);

        let mut out = FlatRecord::new();
        for (source, dest) in map.iter() {
            if let Some(value) = record.remove(source) {
                out.insert(dest.to_string(), value);
            }
        }
        out
    }

    /// Replace arrays of objects that the map addresses by sub-field with
    /// one array per sub-field (`series` -> `series.date`, `series.value`).
    fn expand_routed_arrays(&self, map: &FieldMap, mut record: FlatRecord) -> FlatRecord {
        let routed: Vec<String> = record
            .iter()
            .filter(|(key, value)| {
                value.is_array() && map.get(key).is_none() && map.routes_into(key, &self.separator)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in routed {
            let Some(rows) = record.get(&key).and_then(object_rows) else {
                continue;
            };
            record.remove(&key);
            for (sub, values) in coalesce_rows(&rows) {
                record.insert(join(&key, &sub, &self.separator), Value::Array(values));
            }
        }
        record
    }

    /// Flatten and map a batch, extracting each document's identifier.
    ///
    /// The identifier is read from `unique_field` after collection mapping,
    /// falling back to the flattened source document when the field was renamed.
    pub fn map_batch(
        &self,
        collection: &str,
        index: &str,
        unique_field: &str,
        docs: Vec<Document>,
    ) -> MappedBatch {
        let mut batch = MappedBatch::default();
        for doc in docs {
            let flat = self.flatten(&doc);
            let source_id = flat.get(unique_field).cloned();
            let mapped = self.map_collection(collection, flat);

            let id = match mapped.get(unique_field).cloned().or(source_id) {
                Some(Value::Null) | None => {
                    tracing::warn!(collection, unique_field, "document missing unique field");
                    batch.rejected.push(SyncError::MissingUniqueField {
                        collection: collection.to_string(),
                        field: unique_field.to_string(),
                    });
                    continue;
                }
                Some(value @ (Value::Array(_) | Value::Object(_))) => {
                    tracing::warn!(collection, unique_field, "unique field is not a scalar");
                    batch.rejected.push(SyncError::Mapping {
                        collection: collection.to_string(),
                        id: document_id(&value),
                        reason: format!("unique field '{}' is not a scalar", unique_field),
                    });
                    continue;
                }
                Some(value) => document_id(&value),
            };

            batch.records.push(MappedRecord {
                id,
                fields: self.map_index(index, mapped),
            });
        }
        batch
    }
}

/// Load every `*.json` file in `dir` keyed by file stem. Missing dir means no maps.
fn load_map_dir(dir: &Path, separator: &str) -> Result<HashMap<String, FieldMap>> {
    let mut maps = HashMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(maps),
        Err(e) => return Err(SyncError::Io(e)),
    };

    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let content = fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&content)?;
        let map = FieldMap::from_value(&value, separator).map_err(|e| {
            SyncError::Config(format!("{}: {}", path.display(), e))
        })?;
        tracing::debug!(name, entries = map.len(), "loaded field map {}", path.display());
        maps.insert(name.to_string(), map);
    }
    Ok(maps)
}
