//! SQL Sink Connector implementation
//!
//! `Loader` holds the configuration and the sink manager. `Loader::handler`
//! snapshots both into an `InsertHandler`, the per-row entry point:
//! - First row of a partition: derive columns, open a session, prepare the insert
//! - Every row: transform, execute inside the partition's transaction window
//! - Return the original row to the caller untouched
//!
//! Partitions may interleave freely; each one has its own session, statement
//! and transaction state, created on its first row and dropped when it ends.

use crate::config::LoaderConfig;
use crate::error::{LoaderError, LoaderResult, SinkError};
use crate::record::{bind_values, statement_columns, transform, Row};
use crate::sink::{PreparedInsert, SinkManager};
use crate::statement::InsertStatement;
use crate::transaction::{BatchTransaction, CommitPolicy, PartitionStats};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Provides a representative row when no explicit column spec is configured
pub trait SchemaSampler: Send + Sync {
    fn sample(&self) -> Option<Row>;
}

impl<F> SchemaSampler for F
where
    F: Fn() -> Option<Row> + Send + Sync,
{
    fn sample(&self) -> Option<Row> {
        self()
    }
}

/// A sampler that always returns the same row
#[derive(Debug, Clone)]
pub struct FixedSample(pub Row);

impl SchemaSampler for FixedSample {
    fn sample(&self) -> Option<Row> {
        Some(self.0.clone())
    }
}

/// Builds insert handlers against a sink manager
pub struct Loader {
    config: LoaderConfig,
    manager: Arc<dyn SinkManager>,
}

impl Loader {
    /// A loader with default options
    pub fn new(manager: Arc<dyn SinkManager>) -> Self {
        Self::with_config(LoaderConfig::default(), manager)
    }

    pub fn with_config(config: LoaderConfig, manager: Arc<dyn SinkManager>) -> Self {
        Self { config, manager }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Options apply to handlers created afterwards only
    pub fn config_mut(&mut self) -> &mut LoaderConfig {
        &mut self.config
    }

    /// Create a handler inserting into `table`
    ///
    /// Configuration is validated and copied here; later changes to the
    /// loader do not affect the handler.
    pub fn handler(
        &self,
        sampler: Arc<dyn SchemaSampler>,
        table: impl Into<String>,
    ) -> LoaderResult<InsertHandler> {
        let table = table.into();
        if table.trim().is_empty() {
            return Err(LoaderError::config("Table name cannot be empty"));
        }
        self.config.validate()?;

        Ok(InsertHandler {
            table,
            config: self.config.clone(),
            manager: Arc::clone(&self.manager),
            sampler,
            partitions: HashMap::new(),
            completed: BTreeMap::new(),
            aborted: false,
        })
    }
}

/// Per-partition state, alive between a partition's first row and its end
struct PartitionContext {
    columns: Vec<String>,
    insert: Box<dyn PreparedInsert>,
    transaction: BatchTransaction,
}

/// Totals for a finished load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub partitions: BTreeMap<String, PartitionStats>,
}

impl LoadSummary {
    pub fn rows_written(&self) -> u64 {
        self.partitions.values().map(|s| s.rows_written).sum()
    }

    pub fn rows_committed(&self) -> u64 {
        self.partitions.values().map(|s| s.rows_committed).sum()
    }

    pub fn commits(&self) -> u64 {
        self.partitions.values().map(|s| s.commits).sum()
    }
}

/// Per-row insert entry point
///
/// Owned by one worker; move it to another task to process partitions elsewhere.
pub struct InsertHandler {
    table: String,
    config: LoaderConfig,
    manager: Arc<dyn SinkManager>,
    sampler: Arc<dyn SchemaSampler>,
    partitions: HashMap<String, PartitionContext>,
    completed: BTreeMap<String, PartitionStats>,
    aborted: bool,
}

impl InsertHandler {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Columns fixed for a partition, if it is open
    pub fn columns(&self, partition: &str) -> Option<&[String]> {
        self.partitions.get(partition).map(|p| p.columns.as_slice())
    }

    pub fn open_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Insert one row into `partition` and hand it back unchanged
    pub async fn handle(&mut self, row: Row, partition: &str) -> LoaderResult<Row> {
        if self.aborted {
            return Err(LoaderError::Aborted);
        }

        if !self.partitions.contains_key(partition) {
            let context = self.open_partition(partition).await?;
            self.partitions.insert(partition.to_string(), context);
        }

        let timestamps = self.config.timestamps;
        let spec = &self.config.columns;
        let Some(context) = self.partitions.get_mut(partition) else {
            return Err(LoaderError::config(format!(
                "partition '{}' is not open",
                partition
            )));
        };

        let (output, _) = transform(&row, spec, timestamps);
        let params = bind_values(&output, &context.columns).map_err(|source| {
            LoaderError::Write {
                partition: partition.to_string(),
                row: Box::new(row.clone()),
                source,
            }
        })?;

        context
            .transaction
            .execute(context.insert.as_ref(), &params, &row)
            .await?;

        Ok(row)
    }

    /// End of partition: commit its last window and release its session
    pub async fn end_partition(&mut self, partition: &str) -> LoaderResult<PartitionStats> {
        let Some(context) = self.partitions.get_mut(partition) else {
            return Ok(self.completed.get(partition).copied().unwrap_or_default());
        };

        // On failure the partition stays open so it can still be aborted
        let stats = context.transaction.finish().await?;
        self.partitions.remove(partition);

        info!(
            "Partition '{}' → table '{}': {} rows ({} commits)",
            partition, self.table, stats.rows_written, stats.commits
        );
        self.record_completed(partition, stats);
        Ok(stats)
    }

    /// Abandon a partition: roll back its open window; returns discarded rows
    pub async fn abort_partition(&mut self, partition: &str) -> LoaderResult<usize> {
        let Some(mut context) = self.partitions.remove(partition) else {
            return Ok(0);
        };

        let discarded = context.transaction.abort().await?;
        self.record_completed(partition, context.transaction.stats());
        Ok(discarded)
    }

    /// End of stream: end every open partition
    ///
    /// Partitions are ended in key order; the first failure stops the run and
    /// leaves the remaining partitions open.
    pub async fn finish(&mut self) -> LoaderResult<LoadSummary> {
        let mut keys: Vec<String> = self.partitions.keys().cloned().collect();
        keys.sort();

        for key in keys {
            self.end_partition(&key).await?;
        }

        Ok(LoadSummary {
            partitions: self.completed.clone(),
        })
    }

    /// Roll back every open partition
    ///
    /// Every partition is attempted; the first error is returned. The handler
    /// rejects further rows afterwards.
    pub async fn abort(&mut self) -> LoaderResult<usize> {
        self.aborted = true;
        let keys: Vec<String> = self.partitions.keys().cloned().collect();
        let mut discarded = 0;
        let mut first_error = None;

        for key in keys {
            match self.abort_partition(&key).await {
                Ok(n) => discarded += n,
                Err(e) => {
                    warn!("Failed to roll back partition '{}': {}", key, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(discarded),
        }
    }

    async fn open_partition(&self, partition: &str) -> LoaderResult<PartitionContext> {
        let sample = if self.config.columns.is_all() {
            self.sampler.sample()
        } else {
            None
        };

        let columns =
            statement_columns(&self.config.columns, sample.as_ref(), self.config.timestamps)
                .ok_or_else(|| {
                    LoaderError::config(format!(
                        "No column spec configured and no sample row available for table '{}'",
                        self.table
                    ))
                })?;
        if columns.is_empty() {
            return Err(LoaderError::config(format!(
                "Sample row for table '{}' has no columns",
                self.table
            )));
        }

        let session = self
            .manager
            .session(&self.config.sink_profile)
            .await
            .map_err(|source| match source {
                SinkError::UnknownProfile { profile } => {
                    LoaderError::config(format!("Unknown sink profile '{}'", profile))
                }
                source => LoaderError::Statement {
                    partition: partition.to_string(),
                    source,
                },
            })?;

        let insert = InsertStatement::new(self.table.clone(), columns.clone())
            .prepare(session.as_ref())
            .await
            .map_err(|source| LoaderError::Statement {
                partition: partition.to_string(),
                source,
            })?;

        let policy = if self.config.transaction {
            CommitPolicy::windowed(self.config.commit_size)
        } else {
            CommitPolicy::autocommit()
        };

        debug!(
            "Opened partition '{}' on profile '{}' with columns {:?}",
            partition, self.config.sink_profile, columns
        );

        Ok(PartitionContext {
            columns,
            insert,
            transaction: BatchTransaction::new(partition, session, policy),
        })
    }

    fn record_completed(&mut self, partition: &str, stats: PartitionStats) {
        let entry = self.completed.entry(partition.to_string()).or_default();
        entry.rows_written += stats.rows_written;
        entry.rows_committed += stats.rows_committed;
        entry.commits += stats.commits;
    }
}

impl Drop for InsertHandler {
    fn drop(&mut self) {
        // Rollback needs the runtime; the driver discards the open transaction
        // when the session closes
        if !self.partitions.is_empty() {
            warn!(
                "Insert handler for table '{}' dropped with {} open partitions",
                self.table,
                self.partitions.len()
            );
        }
    }
}
