use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{error, info};

use crate::Result;
use crate::pool::{ConnectionState, Connector, LazyConnection};
use crate::record::{Record, Transforms};
use crate::sink::{WriteResult, Writer};

pub const DEFAULT_NEW_LINE: &str = "\n";
pub const DEFAULT_JOIN_VAL: &str = " ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFormat {
    /// One JSON object per line.
    JsonLines,
    /// The record's values joined by `join_val`, one record per line.
    Txt { join_val: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileMode {
    /// Truncate an existing file.
    #[default]
    Write,
    Append,
}

#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    pub path: PathBuf,
    pub format: FileFormat,
    pub mode: FileMode,
    pub new_line: String,
    pub transforms: Transforms,
}

impl FileSinkConfig {
    pub fn json(path: impl AsRef<Path>) -> Self {
        Self::new(path, FileFormat::JsonLines)
    }

    pub fn txt(path: impl AsRef<Path>) -> Self {
        Self::new(
            path,
            FileFormat::Txt {
                join_val: DEFAULT_JOIN_VAL.to_string(),
            },
        )
    }

    fn new(path: impl AsRef<Path>, format: FileFormat) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format,
            mode: FileMode::default(),
            new_line: DEFAULT_NEW_LINE.to_string(),
            transforms: Transforms::default(),
        }
    }

    pub fn mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn new_line(mut self, new_line: impl Into<String>) -> Self {
        self.new_line = new_line.into();
        self
    }

    /// Only used by the txt format.
    pub fn join_val(mut self, join_val: impl Into<String>) -> Self {
        if let FileFormat::Txt { join_val: current } = &mut self.format {
            *current = join_val.into();
        }
        self
    }

    pub fn transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }

    fn render(&self, record: &Record) -> Result<String> {
        let mut line = match &self.format {
            FileFormat::JsonLines => serde_json::to_string(record)?,
            FileFormat::Txt { join_val } => record
                .values()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(join_val),
        };
        line.push_str(&self.new_line);
        Ok(line)
    }
}

/// Opens the file. Only the very first open honours [`FileMode::Write`], reopening after a
/// release appends so the rows written before are kept.
pub struct FileConnector {
    path: PathBuf,
    mode: FileMode,
    opened: AtomicBool,
}

impl Connector for FileConnector {
    type Handle = BufWriter<File>;

    async fn connect(&self) -> Result<Self::Handle> {
        let truncate =
            self.mode == FileMode::Write && !self.opened.swap(true, Ordering::SeqCst);
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(&self.path).await?;
        info!(path = %self.path.display(), truncate, "Opened output file");
        Ok(BufWriter::new(file))
    }

    async fn close(&self, mut handle: Self::Handle) {
        if let Err(e) = handle.shutdown().await {
            error!(?e, path = %self.path.display(), "Failed to flush output file");
        }
    }
}

pub struct FileSink {
    config: FileSinkConfig,
    connection: LazyConnection<FileConnector>,
}

impl FileSink {
    pub fn new(config: FileSinkConfig) -> Self {
        let connector = FileConnector {
            path: config.path.clone(),
            mode: config.mode,
            opened: AtomicBool::new(false),
        };
        Self {
            config,
            connection: LazyConnection::new(connector),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }
}

impl Writer for FileSink {
    fn name(&self) -> String {
        self.config.path.display().to_string()
    }

    async fn write(&mut self, records: Vec<Record>) -> Result<WriteResult> {
        let records = self.config.transforms.apply_all(records);
        let mut buf = String::new();
        for record in &records {
            buf.push_str(&self.config.render(record)?);
        }

        let file = self.connection.get_handle().await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(WriteResult::written(records.len(), 0, None))
    }

    async fn release(&mut self) {
        self.connection.release().await;
    }
}
