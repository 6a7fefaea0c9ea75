use std::sync::Arc;

use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, PoolConstraints, PoolOpts};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::MySqlSettings;
use crate::error::Error;
use crate::pool::{ConnectionState, Connector, LazyConnection, PoolBounds};
use crate::record::{Record, Transforms};
use crate::retry::RetryPolicy;
use crate::sink::{WriteResult, Writer};

#[derive(Debug, Clone)]
pub struct MySqlSinkConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub encoding: String,
    pub table: String,
    pub retry: RetryPolicy,
    pub pool_bounds: PoolBounds,
    pub transforms: Transforms,
}

impl MySqlSinkConfig {
    /// Validates the `[mysql]` settings for inserting into `table`.
    pub fn new(settings: Option<&MySqlSettings>, table: impl Into<String>) -> Result<Self> {
        let settings = settings.cloned().unwrap_or_default();
        if settings.port == 0 {
            return Err(Error::Config(
                "mysql port must be configured before using the relational sink \
                 (port 0 is rejected, unix sockets are not supported)"
                    .to_string(),
            ));
        }
        let table = table.into();
        if table.trim().is_empty() {
            return Err(Error::Config("mysql table must not be empty".to_string()));
        }
        Ok(Self {
            host: settings.host,
            port: settings.port,
            user: settings.user,
            password: settings.password,
            database: settings.database,
            encoding: settings.encoding,
            table,
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
        format!("{}->{}", self.table, self.database)
    }

    fn opts(&self) -> Result<OptsBuilder> {
        let constraints = PoolConstraints::new(self.pool_bounds.min, self.pool_bounds.max)
            .ok_or_else(|| {
                Error::Config(format!(
                    "invalid mysql pool bounds min={} max={}",
                    self.pool_bounds.min, self.pool_bounds.max
                ))
            })?;
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(self.host.as_str())
            .tcp_port(self.port)
            .user(Some(self.user.as_str()))
            .pass(Some(self.password.as_str()))
            .pool_opts(PoolOpts::default().with_constraints(constraints));
        if !self.database.is_empty() {
            opts = opts.db_name(Some(self.database.as_str()));
        }
        if !self.encoding.is_empty() {
            opts = opts.init(vec![format!("SET NAMES {}", self.encoding)]);
        }
        Ok(opts)
    }
}

/// Back-quotes every dot separated part of an identifier.
fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

fn to_sql(value: Option<&Value>) -> mysql_async::Value {
    match value {
        None | Some(Value::Null) => mysql_async::Value::NULL,
        Some(Value::Bool(b)) => mysql_async::Value::from(*b),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                mysql_async::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                mysql_async::Value::from(u)
            } else {
                mysql_async::Value::from(n.as_f64().unwrap_or_default())
            }
        }
        Some(Value::String(s)) => mysql_async::Value::from(s.clone()),
        Some(other) => mysql_async::Value::from(other.to_string()),
    }
}

/// A multi-row INSERT for `records`. Columns are the union of the records' fields in first seen
/// order, a record without a column inserts NULL there.
fn insert_statement(table: &str, records: &[Record]) -> (String, Vec<mysql_async::Value>) {
    let mut columns: Vec<&str> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key.as_str());
            }
        }
    }

    let placeholders = format!("({})", vec!["?"; columns.len()].join(","));
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_identifier(table),
        columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(","),
        vec![placeholders.as_str(); records.len()].join(","),
    );
    let params = records
        .iter()
        .flat_map(|record| columns.iter().map(|c| to_sql(record.get(*c))))
        .collect();
    (sql, params)
}

/// The driver's pool plus the one connection the sink keeps checked out while connected.
pub struct MySqlHandle {
    pool: mysql_async::Pool,
    conn: Arc<Mutex<Conn>>,
}

pub struct MySqlConnector {
    config: MySqlSinkConfig,
}

impl Connector for MySqlConnector {
    type Handle = MySqlHandle;

    async fn connect(&self) -> Result<MySqlHandle> {
        let pool = mysql_async::Pool::new(self.config.opts()?);
        let conn = match pool.get_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                if let Err(e) = pool.disconnect().await {
                    warn!(?e, "Failed to close mysql pool after a failed connect");
                }
                return Err(e.into());
            }
        };
        info!(name = %self.config.name(), "Connected to mysql");
        Ok(MySqlHandle {
            pool,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn close(&self, handle: MySqlHandle) {
        // the connection goes back to the pool before the pool is closed
        drop(handle.conn);
        match handle.pool.disconnect().await {
            Ok(()) => info!(name = %self.config.name(), "Released mysql pool"),
            Err(e) => error!(?e, name = %self.config.name(), "Failed to close mysql pool"),
        }
    }
}

pub struct MySqlSink {
    config: MySqlSinkConfig,
    connection: LazyConnection<MySqlConnector>,
}

impl MySqlSink {
    pub fn new(config: MySqlSinkConfig) -> Self {
        Self {
            connection: LazyConnection::new(MySqlConnector {
                config: config.clone(),
            }),
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }
}

impl Writer for MySqlSink {
    fn name(&self) -> String {
        self.config.name()
    }

    async fn write(&mut self, records: Vec<Record>) -> Result<WriteResult> {
        let records = self.config.transforms.apply_all(records);
        if records.is_empty() {
            return Ok(WriteResult::written(0, 0, None));
        }
        let (sql, params) = insert_statement(&self.config.table, &records);

        let handle = self
            .connection
            .get_handle_with_retry(&self.config.retry)
            .await?;
        let (pool, conn) = (handle.pool.clone(), Arc::clone(&handle.conn));

        let affected = self
            .config
            .retry
            .attempt(|| {
                let (pool, conn) = (pool.clone(), Arc::clone(&conn));
                let (sql, params) = (sql.clone(), params.clone());
                async move {
                    let mut conn = conn.lock().await;
                    match conn.exec_drop(sql.as_str(), params).await {
                        Ok(()) => Ok(conn.affected_rows()),
                        Err(e) => {
                            let e = Error::from(e);
                            if e.is_transient() {
                                // the kept connection is broken, take a fresh one for the retry
                                match pool.get_conn().await {
                                    Ok(fresh) => *conn = fresh,
                                    Err(e) => warn!(?e, "Failed to replace mysql connection"),
                                }
                            }
                            Err(e)
                        }
                    }
                }
            })
            .await?;

        debug!(name = %self.config.name(), count = records.len(), affected, "Inserted into mysql");
        Ok(WriteResult::written(
            records.len(),
            0,
            Some(json!({"affected_rows": affected})),
        ))
    }

    async fn release(&mut self) {
        self.connection.release().await;
    }
}
