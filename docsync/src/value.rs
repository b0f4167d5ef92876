//! Schema-less document values.
//!
//! Documents are plain `serde_json` objects. The helpers here normalise the
//! handful of shapes source stores hand out (object arrays, ordered pair
//! lists, extended-JSON identifiers) without any reflection.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A raw nested document as produced by a source store.
pub type Document = Map<String, Value>;

/// A single-level document keyed by dotted paths.
pub type FlatRecord = Map<String, Value>;

/// Render an identifier value as the string used in logs and index headers.
///
/// Extended-JSON object ids (`{"$oid": "..."}`) render as their hex string.
pub fn document_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(obj) => match obj.get("$oid").and_then(Value::as_str) {
            Some(oid) if obj.len() == 1 => oid.to_string(),
            _ => value.to_string(),
        },
        _ => value.to_string(),
    }
}

/// Unwrap a single-key extended-JSON scalar such as `{"$oid": ".."}` or
/// `{"$date": {"$numberLong": ".."}}`.
///
/// Returns `None` for ordinary objects.
pub fn extended_scalar(obj: &Map<String, Value>) -> Option<Value> {
    if obj.len() != 1 {
        return None;
    }
    let (key, inner) = obj.iter().next()?;
    if !key.starts_with('$') {
        return None;
    }
    match inner {
        Value::Object(nested) => extended_scalar(nested),
        Value::Array(_) => None,
        scalar => Some(scalar.clone()),
    }
}

/// Convert an array-like value into rows of objects.
///
/// Accepted element shapes:
/// - an object
/// - an ordered pair list (`[["a", 1], ["b", 2]]`); non-string keys are
///   stringified
///
/// Returns `None` for anything that is not an array, or for an array with an
/// element of any other shape.
pub fn object_rows(value: &Value) -> Option<Vec<Map<String, Value>>> {
    let items = value.as_array()?;
    items.iter().map(row_from_element).collect()
}

fn row_from_element(element: &Value) -> Option<Map<String, Value>> {
    match element {
        Value::Object(obj) => Some(obj.clone()),
        Value::Array(pairs) => pairs_to_object(pairs),
        _ => None,
    }
}

/// Generic fallback for key/value containers: a list of `[key, value]` pairs.
fn pairs_to_object(pairs: &[Value]) -> Option<Map<String, Value>> {
    let mut out = Map::new();
    for pair in pairs {
        match pair.as_array().map(Vec::as_slice) {
            Some([key, value]) => {
                out.insert(key_string(key), value.clone());
            }
            _ => return None,
        }
    }
    Some(out)
}

fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Collect each key's values across rows, in row order.
///
/// A key missing from a row contributes nothing for that row, so the
/// resulting sequences may differ in length.
pub fn coalesce_rows(rows: &[Map<String, Value>]) -> BTreeMap<String, Vec<Value>> {
    let mut out: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for row in rows {
        for (key, value) in row {
            out.entry(key.clone()).or_default().push(value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_document_id_variants() {
        assert_eq!(document_id(&json!("abc")), "abc");
        assert_eq!(document_id(&json!(42)), "42");
        assert_eq!(document_id(&json!(true)), "true");
        assert_eq!(
            document_id(&json!({"$oid": "64e3b1f0c2a4b5d6e7f80912"})),
            "64e3b1f0c2a4b5d6e7f80912"
        );
        assert_eq!(document_id(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_extended_scalar() {
        assert_eq!(extended_scalar(&obj(json!({"$oid": "abc"}))), Some(json!("abc")));
        assert_eq!(
            extended_scalar(&obj(json!({"$date": {"$numberLong": "1700000000000"}}))),
            Some(json!("1700000000000"))
        );
        assert_eq!(extended_scalar(&obj(json!({"country": "USA"}))), None);
        assert_eq!(extended_scalar(&obj(json!({"$in": [1, 2]}))), None);
        assert_eq!(extended_scalar(&obj(json!({"$oid": "a", "x": 1}))), None);
    }

    #[test]
    fn test_object_rows_from_objects() {
        let rows = object_rows(&json!([{"a": 1}, {"b": 2}])).unwrap();
        assert_eq!(rows, vec![obj(json!({"a": 1})), obj(json!({"b": 2}))]);
    }

    #[test]
    fn test_object_rows_from_pair_lists() {
        let rows = object_rows(&json!([[["a", 1]], [["b", 2]]])).unwrap();
        assert_eq!(rows, vec![obj(json!({"a": 1})), obj(json!({"b": 2}))]);
    }

    #[test]
    fn test_object_rows_stringifies_keys() {
        let rows = object_rows(&json!([[["a", 1], [2, "numKey"]]])).unwrap();
        assert_eq!(rows, vec![obj(json!({"a": 1, "2": "numKey"}))]);
    }

    #[test]
    fn test_object_rows_rejects() {
        assert!(object_rows(&Value::Null).is_none());
        assert!(object_rows(&json!({"a": 1})).is_none());
        assert!(object_rows(&json!([123])).is_none());
        assert!(object_rows(&json!([[["a", 1, 2]]])).is_none());
    }

    #[test]
    fn test_coalesce_rows() {
        let rows = vec![
            obj(json!({"a": 1, "c": 2})),
            obj(json!({"a": 3})),
            obj(json!({"b": "x"})),
        ];
        let got = coalesce_rows(&rows);
        assert_eq!(got["a"], vec![json!(1), json!(3)]);
        assert_eq!(got["c"], vec![json!(2)]);
        assert_eq!(got["b"], vec![json!("x")]);
        assert_eq!(got.len(), 3);
    }
}
