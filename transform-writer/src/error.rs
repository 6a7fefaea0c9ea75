use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("Timeout Error - {0}")]
    Timeout(String),

    #[error("Transport Error - status {status}: {reason}")]
    Transport { status: u16, reason: String },

    #[error("Serialization Error - {0}")]
    Serialization(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Retries exhausted after {attempts} attempts - {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Connection failures, timeouts and 5xx responses may succeed on another attempt. Everything
    /// else (bad requests, authentication, malformed payloads) fails the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Timeout(_) => true,
            Error::Transport { status, .. } => *status >= 500,
            Error::Config(_)
            | Error::Serialization(_)
            | Error::Sink(_)
            | Error::RetryExhausted { .. } => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Error::Timeout(value.to_string())
        } else if let Some(status) = value.status() {
            Error::Transport {
                status: status.as_u16(),
                reason: value.to_string(),
            }
        } else if value.is_builder() {
            Error::Config(value.to_string())
        } else {
            Error::Connection(value.to_string())
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(value: redis::RedisError) -> Self {
        if value.is_timeout() {
            Error::Timeout(value.to_string())
        } else if value.is_io_error()
            || value.is_connection_refusal()
            || value.is_connection_dropped()
        {
            Error::Connection(value.to_string())
        } else {
            Error::Sink(value.to_string())
        }
    }
}

impl From<mysql_async::Error> for Error {
    fn from(value: mysql_async::Error) -> Self {
        match value {
            mysql_async::Error::Io(e) => Error::Connection(e.to_string()),
            mysql_async::Error::Url(e) => Error::Config(e.to_string()),
            e => Error::Sink(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Sink(value.to_string())
    }
}
