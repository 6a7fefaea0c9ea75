//! Sinks a batch of [`Record`]s is written to.
//!
//! Every sink is described by an immutable [`SinkConfig`], validated when it is built, and turned
//! into a [`SinkWriter`] that owns the sink's lazily established connection. Network sinks retry
//! transient failures; rejected items only show up in the returned counts.

use serde_json::Value;

use crate::Result;
use crate::record::Record;

/// Writes json-lines or plain text files.
pub mod file;

/// Bulk indexes into Elasticsearch through the shared [`crate::es::transport::Transport`].
pub mod elasticsearch;

/// Pushes to a Redis list or sets hash fields.
pub mod redis;

/// Multi-row inserts into a MySQL table.
pub mod mysql;

use self::elasticsearch::{EsSink, EsSinkConfig};
use self::file::{FileSink, FileSinkConfig};
use self::mysql::{MySqlSink, MySqlSinkConfig};
use self::redis::{RedisSink, RedisSinkConfig};

/// Outcome of one write call.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResult {
    /// The request completed. `fail` counts the items the sink rejected.
    Written {
        success: usize,
        fail: usize,
        response: Option<Value>,
    },
    /// The request failed in a way that leaves the outcome unknown; assume nothing was
    /// persisted.
    Unknown,
}

impl WriteResult {
    pub fn written(success: usize, fail: usize, response: Option<Value>) -> Self {
        WriteResult::Written {
            success,
            fail,
            response,
        }
    }

    pub fn success_count(&self) -> Option<usize> {
        match self {
            WriteResult::Written { success, .. } => Some(*success),
            WriteResult::Unknown => None,
        }
    }

    pub fn fail_count(&self) -> Option<usize> {
        match self {
            WriteResult::Written { fail, .. } => Some(*fail),
            WriteResult::Unknown => None,
        }
    }

    pub fn response(&self) -> Option<&Value> {
        match self {
            WriteResult::Written { response, .. } => response.as_ref(),
            WriteResult::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, WriteResult::Unknown)
    }
}

/// Set of operations every sink implements.
#[trait_variant::make(Writer: Send)]
pub trait LocalWriter {
    /// Identifies the target in logs.
    fn name(&self) -> String;

    /// Writes one batch, in order. Errors are configuration errors and exhausted retries; items
    /// rejected by the sink are counted in the result instead.
    async fn write(&mut self, records: Vec<Record>) -> Result<WriteResult>;

    /// Closes the sink's connection. The next write connects again.
    async fn release(&mut self);
}

/// Validated description of a sink.
#[derive(Debug, Clone)]
pub enum SinkConfig {
    File(FileSinkConfig),
    DocumentIndex(EsSinkConfig),
    KeyValue(RedisSinkConfig),
    Relational(MySqlSinkConfig),
}

impl SinkConfig {
    pub fn into_writer(self) -> SinkWriter {
        match self {
            SinkConfig::File(config) => SinkWriter::File(FileSink::new(config)),
            SinkConfig::DocumentIndex(config) => SinkWriter::DocumentIndex(EsSink::new(config)),
            SinkConfig::KeyValue(config) => SinkWriter::KeyValue(RedisSink::new(config)),
            SinkConfig::Relational(config) => SinkWriter::Relational(MySqlSink::new(config)),
        }
    }
}

pub enum SinkWriter {
    File(FileSink),
    DocumentIndex(EsSink),
    KeyValue(RedisSink),
    Relational(MySqlSink),
}

impl Writer for SinkWriter {
    fn name(&self) -> String {
        match self {
            SinkWriter::File(sink) => Writer::name(sink),
            SinkWriter::DocumentIndex(sink) => Writer::name(sink),
            SinkWriter::KeyValue(sink) => Writer::name(sink),
            SinkWriter::Relational(sink) => Writer::name(sink),
        }
    }

    async fn write(&mut self, records: Vec<Record>) -> Result<WriteResult> {
        match self {
            SinkWriter::File(sink) => Writer::write(sink, records).await,
            SinkWriter::DocumentIndex(sink) => Writer::write(sink, records).await,
            SinkWriter::KeyValue(sink) => Writer::write(sink, records).await,
            SinkWriter::Relational(sink) => Writer::write(sink, records).await,
        }
    }

    async fn release(&mut self) {
        match self {
            SinkWriter::File(sink) => Writer::release(sink).await,
            SinkWriter::DocumentIndex(sink) => Writer::release(sink).await,
            SinkWriter::KeyValue(sink) => Writer::release(sink).await,
            SinkWriter::Relational(sink) => Writer::release(sink).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FileSinkConfig, SinkConfig, Value, WriteResult, Writer};

    #[test]
    fn test_write_result_accessors() {
        let written = WriteResult::written(2, 1, Some(json!({"errors": true})));
        assert_eq!(written.success_count(), Some(2));
        assert_eq!(written.fail_count(), Some(1));
        assert_eq!(written.response(), Some(&json!({"errors": true})));
        assert!(!written.is_unknown());

        // zero counts are not the unknown outcome
        let empty = WriteResult::written(0, 0, None);
        assert_eq!(empty.success_count(), Some(0));
        assert!(!empty.is_unknown());

        let unknown = WriteResult::Unknown;
        assert!(unknown.is_unknown());
        assert_eq!(unknown.success_count(), None);
        assert_eq!(unknown.fail_count(), None);
        assert_eq!(unknown.response(), None);
    }

    #[tokio::test]
    async fn test_sink_writer_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let mut writer = SinkConfig::File(FileSinkConfig::json(&path)).into_writer();
        assert_eq!(writer.name(), path.display().to_string());

        let record = match json!({"id": "1"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let result = writer.write(vec![record]).await.unwrap();
        assert_eq!(result.success_count(), Some(1));
        writer.release().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{\"id\":\"1\"}\n");
    }
}
