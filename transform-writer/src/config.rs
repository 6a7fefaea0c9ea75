//! Process wide settings: connection parameters of the Elasticsearch cluster, the Redis server
//! and the MySQL server.
//!
//! Settings are read from an INI file with one section per backend and can be overridden with
//! `TRANSFORM__<SECTION>__<KEY>` environment variables, e.g. `TRANSFORM__REDIS__PORT=6379`.
//! A missing section means the backend is not configured.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::Result;
use crate::error::Error;
use crate::es::transport::{Transport, TransportConfig, parse_headers};

pub const ENV_PREFIX: &str = "TRANSFORM";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Settings {
    pub es: Option<EsSettings>,
    pub redis: Option<RedisSettings>,
    pub mysql: Option<MySqlSettings>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EsSettings {
    /// Comma separated list of node URLs.
    pub hosts: String,
    /// JSON object of headers sent with every request.
    pub headers: String,
    /// Seconds.
    pub http_timeout: f64,
}

impl Default for EsSettings {
    fn default() -> Self {
        Self {
            hosts: String::new(),
            headers: String::new(),
            http_timeout: 10.0,
        }
    }
}

impl EsSettings {
    pub fn hosts(&self) -> Vec<String> {
        self.hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn transport_config(&self) -> Result<TransportConfig> {
        Ok(TransportConfig::new(self.hosts())?
            .headers(parse_headers(&self.headers)?)
            .timeout(seconds(self.http_timeout)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    /// `0` means not configured.
    pub port: u16,
    pub db: i64,
    /// Empty means no authentication.
    pub password: String,
    /// Seconds to wait for a connection.
    pub timeout: f64,
    pub encoding: String,
    /// `L` pushes to the head of lists, `R` to the tail.
    pub direction: String,
    /// zlib compress every payload.
    pub compress: bool,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            db: 0,
            password: String::new(),
            timeout: 3.0,
            encoding: "utf8".to_string(),
            direction: "L".to_string(),
            compress: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MySqlSettings {
    pub host: String,
    /// `0` means not configured.
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub encoding: String,
}

impl Default for MySqlSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            user: "root".to_string(),
            password: String::new(),
            database: String::new(),
            encoding: "utf8".to_string(),
        }
    }
}

impl Settings {
    /// Loads the INI file at `path` (if any) and applies the environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::build(path, None)
    }

    fn build(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Ini));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .source(env),
            )
            .build()
            .map_err(|e| Error::Config(format!("generating runtime configuration: {e}")))?;
        settings
            .try_deserialize::<Self>()
            .map_err(|e| Error::Config(format!("parsing runtime configuration: {e}")))
    }

    /// The transport to the configured cluster, shared by every document index sink.
    pub fn es_transport(&self) -> Result<Transport> {
        let es = self.es.as_ref().ok_or_else(|| {
            Error::Config(
                "Elasticsearch hosts must be configured before using the document index sink"
                    .to_string(),
            )
        })?;
        Transport::new(es.transport_config()?)
    }
}

/// Negative and non-finite values are treated as zero.
pub(crate) fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
