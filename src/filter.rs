//! Filter-spec matching shared by partition, process-group, and service
//! queries.
//!
//! A filter is a list of field → value maps. A record matches a spec when
//! every field named in the spec equals the record's field, with the string
//! `"*"` matching any value. A record matches the filter when it matches at
//! least one spec; an empty filter matches nothing.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// One field → value map from a query request.
pub type FilterSpec = Map<String, Value>;

/// Serialize a record type into the flat JSON object form filters run over.
pub fn record_of<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Ok(Map::from_iter([("value".to_string(), other)])),
    }
}

/// Does `record` satisfy every field constraint in `spec`?
///
/// A field named in the spec but absent from the record is a mismatch.
pub fn matches(spec: &FilterSpec, record: &Map<String, Value>) -> bool {
    spec.iter().all(|(field, want)| {
        if want.as_str() == Some("*") {
            return record.contains_key(field);
        }
        record.get(field) == Some(want)
    })
}

/// Does `record` satisfy at least one spec in the filter?
pub fn matches_any(specs: &[FilterSpec], record: &Map<String, Value>) -> bool {
    specs.iter().any(|spec| matches(spec, record))
}
