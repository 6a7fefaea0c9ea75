use std::env;
use std::error::Error;
use std::path::PathBuf;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use transform_writer::config::Settings;
use transform_writer::sink::elasticsearch::EsSinkConfig;
use transform_writer::sink::file::FileSinkConfig;
use transform_writer::sink::mysql::MySqlSinkConfig;
use transform_writer::sink::redis::RedisSinkConfig;
use transform_writer::{Record, SinkConfig, WriteResult, Writer};

use crate::target::Target;

mod setup_tracing;
mod target;

const ENV_CONFIG: &str = "TRANSFORM_CONFIG";
const ENV_SINK: &str = "TRANSFORM_SINK";
const ENV_BATCH_SIZE: &str = "TRANSFORM_BATCH_SIZE";
const DEFAULT_CONFIG_PATH: &str = "configure.ini";
const DEFAULT_BATCH_SIZE: usize = 100;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = load_settings()?;
    let target: Target = env::var(ENV_SINK)
        .map_err(|_| format!("{ENV_SINK} is not set"))?
        .parse()?;
    let batch_size = match env::var(ENV_BATCH_SIZE) {
        Ok(v) => v
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| format!("{ENV_BATCH_SIZE} must be a positive integer, got {v:?}"))?,
        Err(_) => DEFAULT_BATCH_SIZE,
    };

    let mut writer = sink_config(&settings, target)?.into_writer();
    info!(sink = %writer.name(), batch_size, "Writing records from stdin");

    let result = forward(&mut writer, batch_size).await;
    writer.release().await;
    let totals = result?;
    info!(
        sink = %writer.name(),
        success = totals.success,
        fail = totals.fail,
        unknown = totals.unknown,
        "Done"
    );
    Ok(())
}

/// `TRANSFORM_CONFIG` if set, else `./configure.ini` when present, else environment only.
fn load_settings() -> Result<Settings, Box<dyn Error>> {
    let path = match env::var(ENV_CONFIG) {
        Ok(path) => Some(PathBuf::from(path)),
        Err(_) => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.is_file()),
    };
    Ok(Settings::load(path.as_deref())?)
}

fn sink_config(settings: &Settings, target: Target) -> transform_writer::Result<SinkConfig> {
    Ok(match target {
        Target::Json(path) => SinkConfig::File(FileSinkConfig::json(path)),
        Target::Txt(path) => SinkConfig::File(FileSinkConfig::txt(path)),
        Target::Es { index, doc_type } => {
            SinkConfig::DocumentIndex(EsSinkConfig::from_settings(settings, index, doc_type)?)
        }
        Target::Redis { key, key_type } => SinkConfig::KeyValue(RedisSinkConfig::new(
            settings.redis.as_ref(),
            key,
            &key_type,
        )?),
        Target::MySql { table } => {
            SinkConfig::Relational(MySqlSinkConfig::new(settings.mysql.as_ref(), table)?)
        }
    })
}

#[derive(Debug, Default)]
struct Totals {
    success: usize,
    fail: usize,
    /// Batches whose outcome is unknown.
    unknown: usize,
}

impl Totals {
    fn add(&mut self, result: &WriteResult) {
        match result {
            WriteResult::Written { success, fail, .. } => {
                self.success += success;
                self.fail += fail;
            }
            WriteResult::Unknown => self.unknown += 1,
        }
    }
}

/// Reads newline delimited JSON objects from stdin and writes them in batches.
async fn forward<W: Writer>(writer: &mut W, batch_size: usize) -> Result<Totals, Box<dyn Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut totals = Totals::default();
    let mut batch: Vec<Record> = Vec::with_capacity(batch_size);
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(record)) => batch.push(record),
            Ok(_) => warn!(line_no, "Skipping line, not a JSON object"),
            Err(e) => warn!(line_no, ?e, "Skipping line, not valid JSON"),
        }
        if batch.len() >= batch_size {
            write_batch(writer, std::mem::take(&mut batch), &mut totals).await?;
        }
    }
    if !batch.is_empty() {
        write_batch(writer, batch, &mut totals).await?;
    }
    Ok(totals)
}

async fn write_batch<W: Writer>(
    writer: &mut W,
    batch: Vec<Record>,
    totals: &mut Totals,
) -> transform_writer::Result<()> {
    let count = batch.len();
    let result = writer.write(batch).await?;
    if result.is_unknown() {
        warn!(count, "Outcome of the batch is unknown, assuming nothing was written");
    } else {
        info!(
            count,
            success = result.success_count(),
            fail = result.fail_count(),
            "Batch written"
        );
    }
    totals.add(&result);
    Ok(())
}
