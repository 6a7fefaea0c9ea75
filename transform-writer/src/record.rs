//! Records and the caller supplied functions applied to them before they leave the process.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

/// One item to persist, field name to JSON value. Keys are kept sorted, so the serialized form of
/// a record is canonical.
pub type Record = Map<String, Value>;

pub const APP_CODE_FIELD: &str = "appCode";
pub const ID_FIELD: &str = "id";
pub const CREATE_DATE_FIELD: &str = "createDate";

/// Computes the document identifier of a record. It may add the creation timestamp to the record
/// and must have no other side effect.
pub type IdFn = Arc<dyn Fn(&mut Record) -> String + Send + Sync>;

/// Narrows a record. Returning `None` drops the record from the batch.
pub type FilterFn = Arc<dyn Fn(Record) -> Option<Record> + Send + Sync>;

/// Augments a record.
pub type ExpandFn = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// The per-sink `expand` and `filter` hooks, run in that order on every record of a batch.
#[derive(Clone, Default)]
pub struct Transforms {
    expand: Option<ExpandFn>,
    filter: Option<FilterFn>,
}

impl Transforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expand(mut self, expand: ExpandFn) -> Self {
        self.expand = Some(expand);
        self
    }

    pub fn filter(mut self, filter: FilterFn) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn apply(&self, record: Record) -> Option<Record> {
        let record = match &self.expand {
            Some(expand) => expand(record),
            None => record,
        };
        match &self.filter {
            Some(filter) => filter(record),
            None => Some(record),
        }
    }

    /// Applies the hooks to a batch, keeping the submission order of the surviving records.
    pub fn apply_all(&self, records: Vec<Record>) -> Vec<Record> {
        if self.expand.is_none() && self.filter.is_none() {
            return records;
        }
        records.into_iter().filter_map(|r| self.apply(r)).collect()
    }
}

impl fmt::Debug for Transforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transforms")
            .field("expand", &self.expand.is_some())
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Returns the field as text when it is a non-empty string or a number.
pub(crate) fn non_empty_text(record: &Record, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_no_transforms_passes_through() {
        let records = vec![record(json!({"a": 1})), record(json!({"b": 2}))];
        assert_eq!(Transforms::new().apply_all(records.clone()), records);
    }

    #[test]
    fn test_expand_runs_before_filter() {
        let transforms = Transforms::new()
            .expand(Arc::new(|mut r: Record| {
                r.insert("expanded".into(), Value::Bool(true));
                r
            }))
            .filter(Arc::new(|r: Record| {
                r.get("expanded").and_then(Value::as_bool).map(|_| r)
            }));

        let out = transforms.apply_all(vec![record(json!({"a": 1}))]);
        assert_eq!(out, vec![record(json!({"a": 1, "expanded": true}))]);
    }

    #[test]
    fn test_filter_drops_and_keeps_order() {
        let transforms = Transforms::new().filter(Arc::new(|r: Record| {
            if r.get("keep") == Some(&Value::Bool(true)) {
                Some(r)
            } else {
                None
            }
        }));
        let out = transforms.apply_all(vec![
            record(json!({"n": 1, "keep": true})),
            record(json!({"n": 2, "keep": false})),
            record(json!({"n": 3, "keep": true})),
        ]);
        let order: Vec<_> = out.iter().map(|r| r["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn test_non_empty_text() {
        let r = record(json!({"s": "x", "empty": "", "n": 7, "b": true}));
        assert_eq!(non_empty_text(&r, "s").as_deref(), Some("x"));
        assert_eq!(non_empty_text(&r, "n").as_deref(), Some("7"));
        assert_eq!(non_empty_text(&r, "empty"), None);
        assert_eq!(non_empty_text(&r, "b"), None);
        assert_eq!(non_empty_text(&r, "missing"), None);
    }
}
