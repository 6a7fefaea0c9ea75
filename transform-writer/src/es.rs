//! Elasticsearch client: an HTTP [transport] that spreads requests over the configured nodes and
//! retries transient failures, and the [bulk] indexing protocol built on top of it.

use tracing::error;

use crate::Result;
use crate::record::Record;
use crate::sink::WriteResult;

pub mod bulk;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

use bulk::{BulkEnvelope, BulkOptions};
use transport::{Request, Transport};

pub const BULK_PATH: &str = "/_bulk?pretty";

/// Document-index client. Cheap to clone, clones share the transport and its node state.
#[derive(Clone, Debug)]
pub struct EsClient {
    transport: Transport,
}

impl EsClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Indexes `records` with a single bulk request.
    ///
    /// Items rejected by Elasticsearch are counted as failures and never raise. Any other failure
    /// (the node is unreachable after the transport's retries, the response cannot be parsed) is
    /// logged and reported as [`WriteResult::Unknown`].
    pub async fn bulk_write(&self, options: &BulkOptions, records: Vec<Record>) -> WriteResult {
        let envelope = BulkEnvelope::build(options, records);
        if envelope.is_empty() {
            return WriteResult::written(0, 0, None);
        }
        match self.try_bulk_write(options, &envelope).await {
            Ok(result) => result,
            Err(e) => {
                error!(?e, index = %options.index, "elasticsearch exception, give up");
                WriteResult::Unknown
            }
        }
    }

    async fn try_bulk_write(
        &self,
        options: &BulkOptions,
        envelope: &BulkEnvelope,
    ) -> Result<WriteResult> {
        let mut request = Request::post(BULK_PATH).body(envelope.to_ndjson()?);
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }
        let response = self.transport.perform_request(request).await?.into_body()?;
        let (success, fail) =
            bulk::count_results(&response, envelope.len(), options.error_if_fail)?;
        Ok(WriteResult::written(success, fail, Some(response)))
    }

    /// Whether `index` exists.
    pub async fn index_exists(&self, index: &str) -> Result<bool> {
        self.transport.exists(&format!("/{index}")).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::routing::post;
    use serde_json::{Value, json};

    use super::test_utils::{records, start_server};
    use crate::test_utils::LogBuffer;
    use super::transport::TransportConfig;
    use super::*;

    fn client(hosts: Vec<String>) -> EsClient {
        let config = TransportConfig::new(hosts).unwrap().max_retries(0);
        EsClient::new(Transport::new(config).unwrap())
    }

    fn options() -> BulkOptions {
        BulkOptions::new("post20170630", "news")
    }

    #[tokio::test]
    async fn test_bulk_write_without_errors_counts_every_item() {
        let app = Router::new().route(
            "/_bulk",
            post(|body: String| async move {
                let items: Vec<Value> = body
                    .lines()
                    .step_by(2)
                    .map(|_| json!({"index": {"status": 201}}))
                    .collect();
                axum::Json(json!({"took": 3, "errors": false, "items": items}))
            }),
        );
        let host = start_server(app).await;

        let result = client(vec![host])
            .bulk_write(&options(), records(3))
            .await;
        assert_eq!(result.success_count(), Some(3));
        assert_eq!(result.fail_count(), Some(0));
        assert!(result.response().is_some());
    }

    #[tokio::test]
    async fn test_bulk_write_partial_failure() {
        let app = Router::new().route(
            "/_bulk",
            post(|| async {
                axum::Json(json!({
                    "took": 3,
                    "errors": true,
                    "items": [
                        {"index": {"_id": "a", "status": 201}},
                        {"index": {"_id": "b", "status": 400, "error": {"type": "mapper_parsing_exception"}}},
                        {"index": {"_id": "c", "status": 200}},
                    ]
                }))
            }),
        );
        let host = start_server(app).await;

        for error_if_fail in [true, false] {
            let mut options = options();
            options.error_if_fail = error_if_fail;
            let result = client(vec![host.clone()])
                .bulk_write(&options, records(3))
                .await;
            assert_eq!(result.success_count(), Some(2));
            assert_eq!(result.fail_count(), Some(1));
        }
    }

    #[tokio::test]
    async fn test_rejected_items_are_logged_only_with_error_if_fail() {
        let app = Router::new().route(
            "/_bulk",
            post(|| async {
                axum::Json(json!({
                    "errors": true,
                    "items": [
                        {"index": {"_id": "a", "status": 201}},
                        {"index": {"_id": "b", "status": 400, "error": {"type": "mapper_parsing_exception"}}},
                        {"index": {"_id": "c", "status": 201}},
                    ]
                }))
            }),
        );
        let host = start_server(app).await;

        for error_if_fail in [true, false] {
            let logs = LogBuffer::default();
            let guard = logs.capture();
            let mut options = options();
            options.error_if_fail = error_if_fail;
            let result = client(vec![host.clone()])
                .bulk_write(&options, records(3))
                .await;
            drop(guard);

            assert_eq!(result.success_count(), Some(2));
            assert_eq!(result.fail_count(), Some(1));
            assert_eq!(
                logs.contents().contains("mapper_parsing_exception"),
                error_if_fail,
                "error_if_fail={error_if_fail}, logs: {}",
                logs.contents()
            );
        }
    }

    #[tokio::test]
    async fn test_bulk_write_sends_ndjson_to_bulk_endpoint() {
        let seen = Arc::new(parking_lot::Mutex::new(String::new()));
        let captured = Arc::clone(&seen);
        let app = Router::new().route(
            "/_bulk",
            post(move |body: String| {
                let captured = Arc::clone(&captured);
                async move {
                    *captured.lock() = body;
                    axum::Json(json!({"errors": false, "items": [{"index": {}}]}))
                }
            }),
        );
        let host = start_server(app).await;

        let mut options = options();
        options.app_code = Some("weibo".to_string());
        let result = client(vec![host])
            .bulk_write(&options, records(1))
            .await;
        assert_eq!(result.success_count(), Some(1));

        let body = seen.lock().clone();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["index"]["_index"], "post20170630");
        assert_eq!(lines[0]["index"]["_type"], "news");
        assert_eq!(
            lines[0]["index"]["_id"],
            format!("{:x}", md5::compute("weibo_0"))
        );
        assert_eq!(lines[1]["appCode"], "weibo");
        assert!(lines[1]["createDate"].is_i64());
        assert!(body.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_unreachable_node_yields_unknown() {
        // nothing listens on port 1
        let result = client(vec!["http://127.0.0.1:1".to_string()])
            .bulk_write(&options(), records(2))
            .await;
        assert!(result.is_unknown());
        assert_eq!(result.success_count(), None);
        assert_eq!(result.fail_count(), None);
        assert_eq!(result.response(), None);
    }

    #[tokio::test]
    async fn test_malformed_response_yields_unknown() {
        let app = Router::new().route("/_bulk", post(|| async { "not json at all" }));
        let host = start_server(app).await;
        let result = client(vec![host]).bulk_write(&options(), records(1)).await;
        assert!(result.is_unknown());
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/_bulk",
            post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { axum::Json(json!({"errors": false, "items": []})) }
            }),
        );
        let host = start_server(app).await;
        let result = client(vec![host]).bulk_write(&options(), vec![]).await;
        assert_eq!(result.success_count(), Some(0));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
