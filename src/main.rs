//! SQL Sink Connector - Main Entry Point
//!
//! Reads newline-delimited JSON rows from stdin and loads them into the
//! configured table. The first row doubles as the schema sample.

use anyhow::{anyhow, Context};
use danube_sink_sql::{FixedSample, InsertHandler, Loader, ProfileRegistry, Row, SqlSinkConfig};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PARTITION: &str = "stdin";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging first
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,danube_sink_sql=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init()
        .ok(); // Ignore error if already initialized

    tracing::info!("Starting SQL Sink Connector");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration (TOML + ENV overrides)
    let config = SqlSinkConfig::load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;

    config.validate()?;

    let options = &config.loader.options;
    tracing::info!("Configuration loaded and validated successfully");
    tracing::info!("Table: {}", config.loader.table);
    tracing::info!("Sink profile: {}", options.sink_profile);
    tracing::info!(
        "Transactions: {} (commit size {})",
        options.transaction,
        options.commit_size
    );
    if let Some(field) = &config.loader.partition_field {
        tracing::info!("Partitioning by field '{}'", field);
    }

    let registry = Arc::new(ProfileRegistry::from_profiles(&config.profiles)?);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let Some(first) = next_row(&mut lines).await? else {
        tracing::info!("No input rows, nothing to load");
        return Ok(());
    };

    let loader = Loader::with_config(config.loader.options.clone(), registry);
    let mut handler = loader.handler(
        Arc::new(FixedSample(first.clone())),
        config.loader.table.clone(),
    )?;

    let partition_field = config.loader.partition_field.as_deref();
    let outcome = match run(&mut handler, first, &mut lines, partition_field).await {
        Ok(()) => handler.finish().await.map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(summary) => {
            tracing::info!(
                "Loaded {} rows into '{}' across {} partitions ({} commits)",
                summary.rows_committed(),
                config.loader.table,
                summary.partitions.len(),
                summary.commits()
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("Load failed: {:#}", e);
            match handler.abort().await {
                Ok(discarded) => tracing::warn!("Rolled back {} uncommitted rows", discarded),
                Err(abort_err) => tracing::error!("Rollback failed: {}", abort_err),
            }
            Err(e)
        }
    }
}

/// Feed every input row to the handler until EOF or Ctrl-C
async fn run<R>(
    handler: &mut InsertHandler,
    first: Row,
    lines: &mut Lines<R>,
    partition_field: Option<&str>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut next = Some(first);

    loop {
        let row = match next.take() {
            Some(row) => row,
            None => tokio::select! {
                read = next_row(lines) => match read? {
                    Some(row) => row,
                    None => return Ok(()),
                },
                _ = tokio::signal::ctrl_c() => return Err(anyhow!("interrupted")),
            },
        };

        let partition = partition_key(&row, partition_field);
        handler.handle(row, &partition).await?;
    }
}

async fn next_row<R>(lines: &mut Lines<R>) -> anyhow::Result<Option<Row>>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: Row = serde_json::from_str(line).context("input line is not a JSON object")?;
        return Ok(Some(row));
    }
    Ok(None)
}

fn partition_key(row: &Row, field: Option<&str>) -> String {
    match field.and_then(|f| row.get(f)) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => DEFAULT_PARTITION.to_string(),
        Some(other) => other.to_string(),
    }
}
