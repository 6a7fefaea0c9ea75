use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::Result;
use crate::error::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_ON_STATUS: [u16; 3] = [502, 503, 504];
pub const DEFAULT_DEAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 3;
/// The dead timeout stops doubling after this many consecutive failures.
const DEAD_TIMEOUT_CUTOFF: u32 = 5;

/// How to send a GET or HEAD request that carries a body, for proxies that drop such bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetBodyStrategy {
    /// Send as is.
    #[default]
    Get,
    /// Switch the method to POST.
    Post,
    /// Move the body into the `source` query parameter.
    Source,
}

impl std::str::FromStr for GetBodyStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(GetBodyStrategy::Get),
            "POST" => Ok(GetBodyStrategy::Post),
            "SOURCE" => Ok(GetBodyStrategy::Source),
            other => Err(Error::Config(format!(
                "send_get_body_as must be one of GET, POST, source; got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub hosts: Vec<String>,
    /// Sent with every request; per-request headers override them.
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_on_timeout: bool,
    pub retry_on_status: Vec<u16>,
    pub send_get_body_as: GetBodyStrategy,
    pub dead_timeout: Duration,
    pub max_connections_per_host: usize,
}

impl TransportConfig {
    pub fn new(hosts: Vec<String>) -> Result<Self> {
        let hosts: Vec<String> = hosts
            .into_iter()
            .map(|h| normalize_host(&h))
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.is_empty() {
            return Err(Error::Config(
                "Elasticsearch hosts must be configured before using the document index sink"
                    .to_string(),
            ));
        }
        Ok(Self {
            hosts,
            headers: HeaderMap::new(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_on_timeout: false,
            retry_on_status: DEFAULT_RETRY_ON_STATUS.to_vec(),
            send_get_body_as: GetBodyStrategy::default(),
            dead_timeout: DEFAULT_DEAD_TIMEOUT,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
        })
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_on_timeout(mut self, retry_on_timeout: bool) -> Self {
        self.retry_on_timeout = retry_on_timeout;
        self
    }

    pub fn retry_on_status(mut self, retry_on_status: Vec<u16>) -> Self {
        self.retry_on_status = retry_on_status;
        self
    }

    pub fn send_get_body_as(mut self, strategy: GetBodyStrategy) -> Self {
        self.send_get_body_as = strategy;
        self
    }

    pub fn dead_timeout(mut self, dead_timeout: Duration) -> Self {
        self.dead_timeout = dead_timeout;
        self
    }
}

/// Accepts `host`, `host:port` and full URLs; the scheme defaults to http.
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.is_empty() || host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

/// Parses the `headers` setting, a JSON object of header names to values.
pub fn parse_headers(raw: &str) -> Result<HeaderMap> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(HeaderMap::new());
    }
    let object: serde_json::Map<String, Value> = serde_json::from_str(raw)
        .map_err(|e| Error::Config(format!("es headers must be a JSON object: {e}")))?;
    let mut headers = HeaderMap::with_capacity(object.len());
    for (name, value) in object {
        let value = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Config(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| Error::Config(format!("invalid value for header {name}: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// A single request to the cluster. The path may carry its own query string.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    params: Vec<(String, String)>,
    body: Option<String>,
    timeout: Option<Duration>,
    headers: Option<HeaderMap>,
    ignore: Vec<u16>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            body: None,
            timeout: None,
            headers: None,
            ignore: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Headers merged over the transport's default headers for this request only.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Non-2xx statuses that should be returned instead of failing the request.
    pub fn ignore(mut self, statuses: &[u16]) -> Self {
        self.ignore.extend_from_slice(statuses);
        self
    }
}

/// Result of [`Transport::perform_request`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// HEAD requests only tell whether the resource exists.
    Exists(bool),
    /// Parsed JSON body, `None` when the body was empty.
    Body(Option<Value>),
}

impl Response {
    pub fn into_body(self) -> Result<Value> {
        match self {
            Response::Body(Some(value)) => Ok(value),
            Response::Body(None) => Err(Error::Serialization("empty response body".to_string())),
            Response::Exists(_) => Err(Error::Serialization(
                "HEAD response carries no body".to_string(),
            )),
        }
    }
}

#[derive(Debug)]
struct Node {
    base_url: String,
    failures: u32,
    dead_until: Option<Instant>,
}

impl Node {
    fn is_live(&self, now: Instant) -> bool {
        self.dead_until.is_none_or(|until| until <= now)
    }
}

/// Round-robin over the live nodes. A node that failed is skipped until its dead timeout, which
/// doubles with every consecutive failure, has passed.
#[derive(Debug)]
struct NodePool {
    nodes: Vec<Node>,
    cursor: usize,
    dead_timeout: Duration,
}

impl NodePool {
    fn new(hosts: &[String], dead_timeout: Duration) -> Self {
        Self {
            nodes: hosts
                .iter()
                .map(|h| Node {
                    base_url: h.clone(),
                    failures: 0,
                    dead_until: None,
                })
                .collect(),
            cursor: 0,
            dead_timeout,
        }
    }

    /// Picks the next live node. When every node is dead, the one closest to its resurrection is
    /// tried anyway.
    fn select(&mut self) -> Option<(usize, String)> {
        let now = Instant::now();
        let count = self.nodes.len();
        for offset in 0..count {
            let idx = (self.cursor + offset) % count;
            if let Some(node) = self.nodes.get(idx)
                && node.is_live(now)
            {
                self.cursor = (idx + 1) % count;
                return Some((idx, node.base_url.clone()));
            }
        }
        self.nodes
            .iter()
            .enumerate()
            .min_by_key(|(_, node)| node.dead_until)
            .map(|(idx, node)| (idx, node.base_url.clone()))
    }

    fn mark_dead(&mut self, idx: usize) {
        let dead_timeout = self.dead_timeout;
        if let Some(node) = self.nodes.get_mut(idx) {
            node.failures += 1;
            let exponent = (node.failures - 1).min(DEAD_TIMEOUT_CUTOFF);
            let timeout = dead_timeout * 2u32.pow(exponent);
            node.dead_until = Some(Instant::now() + timeout);
            warn!(node = %node.base_url, failures = node.failures, ?timeout, "Marking node as dead");
        }
    }

    fn mark_live(&mut self, idx: usize) {
        if let Some(node) = self.nodes.get_mut(idx)
            && node.failures > 0
        {
            debug!(node = %node.base_url, "Node is live again");
            node.failures = 0;
            node.dead_until = None;
        }
    }

    fn live(&self) -> usize {
        let now = Instant::now();
        self.nodes.iter().filter(|n| n.is_live(now)).count()
    }
}

/// HTTP transport to an Elasticsearch cluster. Built once per process configuration and handed
/// to every sink that writes to the cluster; clones share the node state.
#[derive(Clone, Debug)]
pub struct Transport {
    client: reqwest::Client,
    config: Arc<TransportConfig>,
    nodes: Arc<Mutex<NodePool>>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_connections_per_host)
            .build()
            .map_err(|e| Error::Config(format!("building http client: {e}")))?;
        let nodes = NodePool::new(&config.hosts, config.dead_timeout);
        Ok(Self {
            client,
            config: Arc::new(config),
            nodes: Arc::new(Mutex::new(nodes)),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// A transport with a different retry bound that shares this one's client and node state.
    pub fn with_max_retries(&self, max_retries: usize) -> Self {
        let mut config = TransportConfig::clone(&self.config);
        config.max_retries = max_retries;
        Self {
            client: self.client.clone(),
            config: Arc::new(config),
            nodes: Arc::clone(&self.nodes),
        }
    }

    /// Number of nodes currently considered live.
    pub fn live_nodes(&self) -> usize {
        self.nodes.lock().live()
    }

    /// Sends the request, trying up to `max_retries` more times on another node when the failure
    /// is a connection error, a timeout (if `retry_on_timeout`) or one of `retry_on_status`.
    pub async fn perform_request(&self, request: Request) -> Result<Response> {
        let Request {
            mut method,
            path,
            mut params,
            mut body,
            timeout,
            headers,
            ignore,
        } = request;

        if body.is_some() && (method == Method::GET || method == Method::HEAD) {
            match self.config.send_get_body_as {
                GetBodyStrategy::Get => {}
                GetBodyStrategy::Post => method = Method::POST,
                GetBodyStrategy::Source => {
                    if let Some(source) = body.take() {
                        params.push(("source".to_string(), source));
                    }
                }
            }
        }

        let headers = self.merge_headers(headers, body.is_some());
        let timeout = timeout.unwrap_or(self.config.timeout);
        let mut attempt = 0;

        loop {
            let (idx, base_url) = self
                .nodes
                .lock()
                .select()
                .ok_or_else(|| Error::Config("no Elasticsearch node configured".to_string()))?;

            let outcome = self
                .send(
                    &base_url, &method, &path, &params, &body, &headers, timeout, &ignore,
                )
                .await;

            match outcome {
                Ok((status, data)) => {
                    self.nodes.lock().mark_live(idx);
                    if method == Method::HEAD {
                        return Ok(Response::Exists((200..300).contains(&status)));
                    }
                    return Ok(Response::Body(parse_body(&data)?));
                }
                Err(Error::Transport { status: 404, .. }) if method == Method::HEAD => {
                    return Ok(Response::Exists(false));
                }
                Err(e) => {
                    let retry = match &e {
                        Error::Timeout(_) => self.config.retry_on_timeout,
                        Error::Connection(_) => true,
                        Error::Transport { status, .. } => {
                            self.config.retry_on_status.contains(status)
                        }
                        _ => false,
                    };
                    if !retry {
                        return Err(e);
                    }
                    // only mark as dead if we are retrying
                    self.nodes.lock().mark_dead(idx);
                    if attempt >= self.config.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(?e, attempt, %method, %path, "Retrying request on the next node");
                }
            }
        }
    }

    /// HEAD `path`; `true` on 2xx, `false` on 404.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.perform_request(Request::head(path)).await? {
            Response::Exists(exists) => Ok(exists),
            Response::Body(_) => Ok(true),
        }
    }

    /// Defaults, then the JSON content type when there is a body, then the request's own headers.
    fn merge_headers(&self, overrides: Option<HeaderMap>, has_body: bool) -> HeaderMap {
        let mut headers = self.config.headers.clone();
        if has_body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        if let Some(overrides) = overrides {
            for (name, value) in overrides.iter() {
                headers.insert(name.clone(), value.clone());
            }
        }
        headers
    }

    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        base_url: &str,
        method: &Method,
        path: &str,
        params: &[(String, String)],
        body: &Option<String>,
        headers: &HeaderMap,
        timeout: Duration,
        ignore: &[u16],
    ) -> Result<(u16, String)> {
        let url = format!("{base_url}{path}");
        let start = Instant::now();

        let mut builder = self
            .client
            .request(method.clone(), &url)
            .headers(headers.clone())
            .timeout(timeout);
        if !params.is_empty() {
            builder = builder.query(params);
        }
        if let Some(body) = body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            warn!(%method, %url, duration = ?start.elapsed(), ?e, "Request failed");
            Error::from(e)
        })?;
        let status = response.status().as_u16();
        let data = response.text().await.map_err(Error::from)?;

        if !(200..300).contains(&status) && !ignore.contains(&status) {
            warn!(%method, %url, status, duration = ?start.elapsed(), "Request returned an error status");
            return Err(Error::Transport {
                status,
                reason: data,
            });
        }
        debug!(%method, %url, status, duration = ?start.elapsed(), "Request succeeded");
        Ok((status, data))
    }
}

fn parse_body(data: &str) -> Result<Option<Value>> {
    if data.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(data)?))
}
