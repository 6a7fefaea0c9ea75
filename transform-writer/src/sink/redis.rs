use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use redis::IntoConnectionInfo;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tracing::{debug, info};

use crate::Result;
use crate::config::{RedisSettings, seconds};
use crate::error::Error;
use crate::pool::{
    ConnectionFactory, ConnectionState, Connector, LazyConnection, Pool, PoolBounds,
};
use crate::record::{ID_FIELD, Record, Transforms, non_empty_text};
use crate::retry::RetryPolicy;
use crate::sink::{WriteResult, Writer};

/// Which end of the list new items are pushed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    List(Direction),
    /// One hash field per record, named after the record's id.
    Hash,
}

#[derive(Debug, Clone)]
pub struct RedisSinkConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    /// Connect timeout.
    pub timeout: Duration,
    pub encoding: String,
    pub key: String,
    pub key_type: KeyType,
    /// zlib compress every payload.
    pub compress: bool,
    pub retry: RetryPolicy,
    pub pool_bounds: PoolBounds,
    pub transforms: Transforms,
}

impl RedisSinkConfig {
    /// Validates the `[redis]` settings for writing to `key`. `key_type` is `LIST` or `HASH`.
    pub fn new(
        settings: Option<&RedisSettings>,
        key: impl Into<String>,
        key_type: &str,
    ) -> Result<Self> {
        let settings = settings.cloned().unwrap_or_default();
        if settings.port == 0 {
            return Err(Error::Config(
                "redis port must be configured before using the key-value sink \
                 (port 0 is rejected, unix sockets are not supported)"
                    .to_string(),
            ));
        }

        let direction = match settings.direction.as_str() {
            "L" => Direction::Left,
            "R" => Direction::Right,
            other => {
                return Err(Error::Config(format!(
                    "redis direction must be L or R, got {other:?}"
                )));
            }
        };
        let key_type = match key_type {
            "LIST" => KeyType::List(direction),
            "HASH" => KeyType::Hash,
            other => {
                return Err(Error::Config(format!(
                    "key_type must be one of LIST, HASH, got {other:?}"
                )));
            }
        };

        let encoding = settings.encoding.trim().to_string();
        if encoding.is_empty() {
            return Err(Error::Config(
                "redis encoding must be set, every record is stored as JSON text".to_string(),
            ));
        }
        if !is_utf8(&encoding) && !settings.compress {
            return Err(Error::Config(format!(
                "unsupported redis encoding {encoding:?}, JSON text is always utf8"
            )));
        }

        Ok(Self {
            host: settings.host,
            port: settings.port,
            db: settings.db,
            password: Some(settings.password).filter(|p| !p.is_empty()),
            timeout: seconds(settings.timeout),
            encoding,
            key: key.into(),
            key_type,
            compress: settings.compress,
            retry: RetryPolicy::default(),
            pool_bounds: PoolBounds::default(),
            transforms: Transforms::default(),
        })
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool_bounds(mut self, pool_bounds: PoolBounds) -> Self {
        self.pool_bounds = pool_bounds;
        self
    }

    pub fn transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn name(&self) -> String {
        format!("{}_{}->{}", self.host, self.port, self.key)
    }

    /// The hash field and the stored bytes of a record.
    fn entry(&self, record: &Record) -> Result<(String, Vec<u8>)> {
        let json = serde_json::to_vec(record)?;
        let field = non_empty_text(record, ID_FIELD)
            .unwrap_or_else(|| format!("{:x}", md5::compute(&json)));
        if !self.compress {
            return Ok((field, json));
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| Error::Serialization(format!("compressing record: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| Error::Serialization(format!("compressing record: {e}")))?;
        Ok((field, compressed))
    }

    fn command(&self, entries: &[(String, Vec<u8>)]) -> redis::Cmd {
        let mut cmd = match self.key_type {
            KeyType::List(Direction::Left) => redis::cmd("LPUSH"),
            KeyType::List(Direction::Right) => redis::cmd("RPUSH"),
            KeyType::Hash => redis::cmd("HSET"),
        };
        cmd.arg(&self.key);
        for (field, payload) in entries {
            if self.key_type == KeyType::Hash {
                cmd.arg(field);
            }
            cmd.arg(payload.as_slice());
        }
        cmd
    }
}

fn is_utf8(encoding: &str) -> bool {
    matches!(
        encoding.to_ascii_lowercase().replace(['-', '_'], "").as_str(),
        "utf8"
    )
}

/// Opens single multiplexed connections.
pub struct RedisFactory {
    client: redis::Client,
    timeout: Duration,
}

impl ConnectionFactory for RedisFactory {
    type Connection = MultiplexedConnection;

    async fn open(&self) -> Result<MultiplexedConnection> {
        let connect = self.client.get_multiplexed_async_connection();
        if self.timeout.is_zero() {
            return Ok(connect.await?);
        }
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(Error::Timeout(format!(
                "connecting to redis took more than {:?}",
                self.timeout
            ))),
        }
    }
}

pub struct RedisConnector {
    config: RedisSinkConfig,
}

impl Connector for RedisConnector {
    type Handle = Arc<Pool<RedisFactory>>;

    async fn connect(&self) -> Result<Self::Handle> {
        let mut info = (self.config.host.as_str(), self.config.port).into_connection_info()?;
        info.redis.db = self.config.db;
        info.redis.password = self.config.password.clone();
        let factory = RedisFactory {
            client: redis::Client::open(info)?,
            timeout: self.config.timeout,
        };
        let pool = Pool::connect(factory, self.config.pool_bounds).await?;
        info!(name = %self.config.name(), "Connected to redis");
        Ok(pool)
    }

    async fn close(&self, pool: Self::Handle) {
        pool.close();
        pool.wait_closed().await;
        info!(name = %self.config.name(), "Released redis pool");
    }
}

pub struct RedisSink {
    config: RedisSinkConfig,
    connection: LazyConnection<RedisConnector>,
}

impl RedisSink {
    pub fn new(config: RedisSinkConfig) -> Self {
        Self {
            connection: LazyConnection::new(RedisConnector {
                config: config.clone(),
            }),
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }
}

impl Writer for RedisSink {
    fn name(&self) -> String {
        self.config.name()
    }

    async fn write(&mut self, records: Vec<Record>) -> Result<WriteResult> {
        let records = self.config.transforms.apply_all(records);
        if records.is_empty() {
            return Ok(WriteResult::written(0, 0, None));
        }
        let entries = records
            .iter()
            .map(|r| self.config.entry(r))
            .collect::<Result<Vec<_>>>()?;
        let cmd = self.config.command(&entries);

        let pool = Arc::clone(
            self.connection
                .get_handle_with_retry(&self.config.retry)
                .await?,
        );
        let reply: i64 = self
            .config
            .retry
            .attempt(|| {
                let pool = Arc::clone(&pool);
                let cmd = cmd.clone();
                async move {
                    let mut conn = pool.get().await?;
                    match cmd.query_async::<i64>(&mut *conn).await {
                        Ok(reply) => Ok(reply),
                        Err(e) => {
                            let e = Error::from(e);
                            if e.is_transient() {
                                conn.discard();
                            }
                            Err(e)
                        }
                    }
                }
            })
            .await?;

        debug!(name = %self.config.name(), count = entries.len(), reply, "Wrote to redis");
        Ok(WriteResult::written(
            entries.len(),
            0,
            Some(Value::from(reply)),
        ))
    }

    async fn release(&mut self) {
        self.connection.release().await;
    }
}
