//! Newline-delimited bulk payloads and the parsing of their per-item results.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::error;

use crate::Result;
use crate::error::Error;
use crate::record::{APP_CODE_FIELD, CREATE_DATE_FIELD, ID_FIELD, IdFn, Record, non_empty_text};

/// The bulk operation applied to every document of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    /// Creates or replaces the document.
    #[default]
    Index,
    /// Fails the item if a document with the same id exists.
    Create,
}

impl BulkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Create => "create",
        }
    }
}

impl fmt::Display for BulkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "index" => Ok(BulkAction::Index),
            "create" => Ok(BulkAction::Create),
            other => Err(Error::Config(format!(
                "unsupported bulk action {other:?}, expected index or create"
            ))),
        }
    }
}

/// Per-call parameters of a bulk write.
#[derive(Clone)]
pub struct BulkOptions {
    pub index: String,
    pub doc_type: String,
    pub action: BulkAction,
    /// Stamped on every record as `appCode` when set.
    pub app_code: Option<String>,
    /// Stamped on every record as `createDate` when set, overriding any existing value.
    pub create_date: Option<Value>,
    /// Replaces [`default_id_hash`].
    pub id_fn: Option<IdFn>,
    /// Log the error of every rejected item.
    pub error_if_fail: bool,
    /// Overrides the transport's timeout for the bulk request.
    pub timeout: Option<Duration>,
}

impl BulkOptions {
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
            action: BulkAction::default(),
            app_code: None,
            create_date: None,
            id_fn: None,
            error_if_fail: true,
            timeout: None,
        }
    }
}

impl fmt::Debug for BulkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkOptions")
            .field("index", &self.index)
            .field("doc_type", &self.doc_type)
            .field("action", &self.action)
            .field("app_code", &self.app_code)
            .field("create_date", &self.create_date)
            .field("id_fn", &self.id_fn.is_some())
            .field("error_if_fail", &self.error_if_fail)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Document id of a record: the md5 hex digest of `"{appCode}_{id}"` when both fields are
/// present and non-empty, otherwise of the record's canonical JSON text.
///
/// Records without a `createDate` get the current unix time in seconds.
pub fn default_id_hash(record: &mut Record) -> String {
    let digest = match (
        non_empty_text(record, APP_CODE_FIELD),
        non_empty_text(record, ID_FIELD),
    ) {
        (Some(app_code), Some(id)) => md5::compute(format!("{app_code}_{id}")),
        _ => md5::compute(Value::Object(record.clone()).to_string()),
    };
    if !record.contains_key(CREATE_DATE_FIELD) {
        record.insert(
            CREATE_DATE_FIELD.to_string(),
            Value::from(chrono::Utc::now().timestamp()),
        );
    }
    format!("{digest:x}")
}

/// Action descriptor and document pairs, in submission order.
#[derive(Debug, Clone, Default)]
pub struct BulkEnvelope {
    entries: Vec<(Value, Record)>,
}

impl BulkEnvelope {
    /// Annotates each record and pairs it with its action line.
    pub fn build(options: &BulkOptions, records: Vec<Record>) -> Self {
        let entries = records
            .into_iter()
            .map(|mut record| {
                if let Some(app_code) = &options.app_code {
                    record.insert(APP_CODE_FIELD.to_string(), Value::from(app_code.as_str()));
                }
                if let Some(create_date) = &options.create_date {
                    record.insert(CREATE_DATE_FIELD.to_string(), create_date.clone());
                }
                let id = match &options.id_fn {
                    Some(id_fn) => id_fn(&mut record),
                    None => default_id_hash(&mut record),
                };
                let action = json!({
                    (options.action.as_str()): {
                        "_index": options.index,
                        "_type": options.doc_type,
                        "_id": id,
                    }
                });
                (action, record)
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_ndjson(&self) -> Result<String> {
        let mut body = String::new();
        for (action, record) in &self.entries {
            body.push_str(&serde_json::to_string(action)?);
            body.push('\n');
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }
        Ok(body)
    }
}

/// Splits a bulk response into `(success, fail)` counts. Without `errors` every submitted item
/// succeeded; otherwise each item carrying an `error` is a failure.
pub fn count_results(
    response: &Value,
    submitted: usize,
    error_if_fail: bool,
) -> Result<(usize, usize)> {
    let errors = response
        .get("errors")
        .and_then(Value::as_bool)
        .ok_or_else(|| Error::Serialization("bulk response has no errors flag".to_string()))?;
    if !errors {
        return Ok((submitted, 0));
    }

    let items = response
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Serialization("bulk response has no items".to_string()))?;

    let (mut success, mut fail) = (0, 0);
    for result in items.iter().filter_map(Value::as_object).flat_map(|i| i.values()) {
        match result.get("error") {
            Some(e) => {
                if error_if_fail {
                    error!(error = %e, "bulk item rejected");
                }
                fail += 1;
            }
            None => success += 1,
        }
    }
    Ok((success, fail))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::es::test_utils::records;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_id_from_app_code_and_id() {
        let mut r = record(json!({"appCode": "weibo", "id": "42", "title": "t"}));
        let id = default_id_hash(&mut r);
        assert_eq!(id, format!("{:x}", md5::compute("weibo_42")));
        assert_eq!(id.len(), 32);

        // other fields do not matter
        let mut other = record(json!({"appCode": "weibo", "id": "42", "title": "other"}));
        assert_eq!(default_id_hash(&mut other), id);
    }

    #[test]
    fn test_id_falls_back_to_content_hash() {
        let mut a = record(json!({"appCode": "", "id": "42", "createDate": 1}));
        let mut b = record(json!({"createDate": 1, "id": "42", "appCode": ""}));
        let expected = format!("{:x}", md5::compute(Value::Object(a.clone()).to_string()));
        assert_eq!(default_id_hash(&mut a), expected);
        // key order does not change the canonical text
        assert_eq!(default_id_hash(&mut b), expected);

        let mut c = record(json!({"appCode": "", "id": "43", "createDate": 1}));
        assert_ne!(default_id_hash(&mut c), expected);
    }

    #[test]
    fn test_id_hash_injects_create_date() {
        let before = chrono::Utc::now().timestamp();
        let mut r = record(json!({"appCode": "weibo", "id": "1"}));
        default_id_hash(&mut r);
        let after = chrono::Utc::now().timestamp();
        let stamped = r[CREATE_DATE_FIELD].as_i64().unwrap();
        assert!(before <= stamped && stamped <= after);

        let mut existing = record(json!({"createDate": 7}));
        default_id_hash(&mut existing);
        assert_eq!(existing[CREATE_DATE_FIELD], json!(7));
    }

    #[test]
    fn test_envelope_preserves_order_and_annotates() {
        let mut options = BulkOptions::new("idx", "doc");
        options.action = BulkAction::Create;
        options.create_date = Some(json!(1498800000));
        options.id_fn = Some(Arc::new(|r: &mut Record| {
            r.get(ID_FIELD).and_then(Value::as_str).unwrap_or_default().to_string()
        }));

        let envelope = BulkEnvelope::build(&options, records(3));
        assert_eq!(envelope.len(), 3);
        let body = envelope.to_ndjson().unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 6);
        for (i, pair) in lines.chunks(2).enumerate() {
            assert_eq!(pair[0]["create"]["_id"], i.to_string());
            assert_eq!(pair[0]["create"]["_index"], "idx");
            assert_eq!(pair[1][CREATE_DATE_FIELD], json!(1498800000));
            assert!(pair[1].get(APP_CODE_FIELD).is_none());
        }
    }

    #[test]
    fn test_count_results() {
        let ok = json!({"errors": false, "items": [{"index": {}}]});
        assert_eq!(count_results(&ok, 3, true).unwrap(), (3, 0));

        let partial = json!({
            "errors": true,
            "items": [
                {"index": {"status": 201}},
                {"index": {"status": 409, "error": {"type": "version_conflict_engine_exception"}}},
                {"create": {"status": 201}},
            ]
        });
        assert_eq!(count_results(&partial, 3, true).unwrap(), (2, 1));
        assert_eq!(count_results(&partial, 3, false).unwrap(), (2, 1));

        assert!(matches!(
            count_results(&json!({"took": 1}), 1, true),
            Err(Error::Serialization(_))
        ));
        assert!(matches!(
            count_results(&json!({"errors": true}), 1, true),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_bulk_action_parse() {
        assert_eq!("index".parse::<BulkAction>().unwrap(), BulkAction::Index);
        assert_eq!("".parse::<BulkAction>().unwrap(), BulkAction::Index);
        assert_eq!("create".parse::<BulkAction>().unwrap(), BulkAction::Create);
        assert!("delete".parse::<BulkAction>().is_err());
    }
}
