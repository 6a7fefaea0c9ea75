use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::Result;
use crate::config::Settings;
use crate::es::EsClient;
use crate::es::bulk::{BulkAction, BulkOptions};
use crate::es::transport::Transport;
use crate::pool::{ConnectionState, Connector, LazyConnection};
use crate::record::{IdFn, Record, Transforms};
use crate::retry::DEFAULT_MAX_RETRY;
use crate::sink::{WriteResult, Writer};

#[derive(Debug, Clone)]
pub struct EsSinkConfig {
    pub transport: Transport,
    pub options: BulkOptions,
    /// Retries of a failed bulk request, done by the transport on the next node.
    pub max_retry: usize,
    pub transforms: Transforms,
}

impl EsSinkConfig {
    pub fn new(transport: Transport, index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            transport,
            options: BulkOptions::new(index, doc_type),
            max_retry: DEFAULT_MAX_RETRY,
            transforms: Transforms::default(),
        }
    }

    /// Fails when no Elasticsearch hosts are configured.
    pub fn from_settings(
        settings: &Settings,
        index: impl Into<String>,
        doc_type: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self::new(settings.es_transport()?, index, doc_type))
    }

    pub fn app_code(mut self, app_code: impl Into<String>) -> Self {
        self.options.app_code = Some(app_code.into());
        self
    }

    pub fn action(mut self, action: BulkAction) -> Self {
        self.options.action = action;
        self
    }

    pub fn create_date(mut self, create_date: Value) -> Self {
        self.options.create_date = Some(create_date);
        self
    }

    pub fn id_fn(mut self, id_fn: IdFn) -> Self {
        self.options.id_fn = Some(id_fn);
        self
    }

    pub fn error_if_fail(mut self, error_if_fail: bool) -> Self {
        self.options.error_if_fail = error_if_fail;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn max_retry(mut self, max_retry: usize) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }
}

pub struct EsConnector {
    transport: Transport,
    max_retry: usize,
}

impl Connector for EsConnector {
    type Handle = EsClient;

    async fn connect(&self) -> Result<EsClient> {
        debug!(max_retries = self.max_retry, "Creating elasticsearch client");
        Ok(EsClient::new(self.transport.with_max_retries(self.max_retry)))
    }

    async fn close(&self, _client: EsClient) {
        info!("Released elasticsearch client");
    }
}

/// Indexes every batch with one bulk request. Failed requests are retried by the transport only,
/// an unreachable cluster yields [`WriteResult::Unknown`].
pub struct EsSink {
    config: EsSinkConfig,
    connection: LazyConnection<EsConnector>,
}

impl EsSink {
    pub fn new(config: EsSinkConfig) -> Self {
        let connector = EsConnector {
            transport: config.transport.clone(),
            max_retry: config.max_retry,
        };
        Self {
            config,
            connection: LazyConnection::new(connector),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connects(&self) -> usize {
        self.connection.connects()
    }
}

impl Writer for EsSink {
    fn name(&self) -> String {
        format!("{}/{}", self.config.options.index, self.config.options.doc_type)
    }

    async fn write(&mut self, records: Vec<Record>) -> Result<WriteResult> {
        let records = self.config.transforms.apply_all(records);
        let client = self.connection.get_handle().await?;
        Ok(client.bulk_write(&self.config.options, records).await)
    }

    async fn release(&mut self) {
        self.connection.release().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use serde_json::json;

    use super::*;
    use crate::config::EsSettings;
    use crate::es::test_utils::{records, start_server};
    use crate::es::transport::TransportConfig;
    use crate::error::Error;

    fn transport(host: String) -> Transport {
        Transport::new(TransportConfig::new(vec![host]).unwrap()).unwrap()
    }

    /// Acknowledges every document it receives and counts the bulk requests.
    async fn accepting_server() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/_bulk",
                post(|State(hits): State<Arc<AtomicUsize>>, body: String| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let items: Vec<Value> = body
                        .lines()
                        .step_by(2)
                        .map(|_| json!({"index": {"status": 201}}))
                        .collect();
                    axum::Json(json!({"errors": false, "items": items}))
                }),
            )
            .with_state(Arc::clone(&hits));
        (start_server(app).await, hits)
    }

    #[test]
    fn test_requires_configured_hosts() {
        let settings = Settings::default();
        assert!(matches!(
            EsSinkConfig::from_settings(&settings, "idx", "doc"),
            Err(Error::Config(_))
        ));

        let settings = Settings {
            es: Some(EsSettings::default()),
            ..Default::default()
        };
        assert!(matches!(
            EsSinkConfig::from_settings(&settings, "idx", "doc"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_write_applies_transforms_and_reuses_client() {
        let (host, hits) = accepting_server().await;
        let transforms = Transforms::new().filter(Arc::new(|r: Record| {
            if r.get("id") == Some(&json!("1")) { None } else { Some(r) }
        }));
        let config = EsSinkConfig::new(transport(host), "post20170630", "news")
            .app_code("weibo")
            .transforms(transforms);
        let mut sink = EsSink::new(config);
        assert_eq!(sink.name(), "post20170630/news");
        assert_eq!(sink.state(), ConnectionState::Uninitialized);

        let result = sink.write(records(3)).await.unwrap();
        assert_eq!(result.success_count(), Some(2));
        assert_eq!(result.fail_count(), Some(0));

        sink.write(records(1)).await.unwrap();
        assert_eq!(sink.connects(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        sink.release().await;
        assert_eq!(sink.state(), ConnectionState::Released);
        sink.write(records(1)).await.unwrap();
        assert_eq!(sink.connects(), 2);
    }

    #[tokio::test]
    async fn test_max_retry_bounds_transport_retries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/_bulk",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
                }),
            )
            .with_state(Arc::clone(&hits));
        let host = start_server(app).await;

        let config = EsSinkConfig::new(transport(host), "idx", "doc").max_retry(2);
        let mut sink = EsSink::new(config);
        let result = sink.write(records(1)).await.unwrap();

        assert!(result.is_unknown());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_filtered_out_batch_sends_nothing() {
        let (host, hits) = accepting_server().await;
        let transforms = Transforms::new().filter(Arc::new(|_: Record| -> Option<Record> { None }));
        let config = EsSinkConfig::new(transport(host), "idx", "doc").transforms(transforms);
        let mut sink = EsSink::new(config);

        let result = sink.write(records(2)).await.unwrap();
        assert_eq!(result, WriteResult::written(0, 0, None));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
