//! Resilient bulk writers for the transform pipeline.
//!
//! A batch of [`Record`]s handed to a sink's [`Writer::write`] goes through the sink's transforms,
//! is sent over the sink's lazily established connection ([`pool`]) and, for network sinks, is
//! retried with a randomized backoff ([`retry`]) when the failure is transient. Elasticsearch
//! batches are bulk indexed through the [`es`] client and its multi-node transport.

pub use self::error::{Error, Result};
pub use self::record::{Record, Transforms};
pub use self::sink::{SinkConfig, SinkWriter, WriteResult, Writer};

mod error;

pub mod config;
pub mod es;
pub mod pool;
pub mod record;
pub mod retry;
pub mod sink;

#[cfg(test)]
pub(crate) mod test_utils;
