//! SQL Sink Connector for Danube Connect
//!
//! Loads rows into a relational table through a windowed transaction protocol:
//! rows are inserted with one prepared statement per partition and committed
//! every `commit_size` rows, with a final commit when the partition ends.
//!
//! # Features
//!
//! - **Column Mapping**: Keep all columns, a subset, or rename them
//! - **Windowed Transactions**: Bounded uncommitted work per partition
//! - **Partition Isolation**: One session, statement and transaction per partition
//! - **Timestamps**: Optional `created_at` / `updated_at` stamping in UTC
//! - **Backends**: PostgreSQL (feature `postgres`) and an in-memory dry-run sink
//!
//! # Example Configuration
//!
//! ```toml
//! [loader]
//! table = "users"
//! partition_field = "tenant"
//! columns = { id = "user_id", name = "full_name" }
//! commit_size = 500
//! timestamps = true
//! sink_profile = "default"
//!
//! [profiles.default]
//! url = "postgres://etl@localhost/warehouse"
//! connection_timeout_secs = 10
//! ```
//!
//! # Library Use
//!
//! ```rust,ignore
//! let loader = Loader::with_config(config, Arc::new(sink));
//! let mut handler = loader.handler(Arc::new(FixedSample(sample)), "users")?;
//! for (row, partition) in rows {
//!     let row = handler.handle(row, &partition).await?;
//! }
//! handler.finish().await?;
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod memory;
pub mod record;
pub mod sink;
pub mod statement;
pub mod transaction;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use config::{LoaderConfig, ProfileConfig, SqlSinkConfig};
pub use connector::{FixedSample, InsertHandler, LoadSummary, Loader, SchemaSampler};
pub use error::{LoaderError, LoaderResult, SinkError, SinkResult};
pub use memory::MemorySink;
pub use record::{transform, ColumnSpec, Row};
pub use sink::{Placeholder, PreparedInsert, ProfileRegistry, SinkManager, SinkSession};
pub use statement::InsertStatement;
pub use transaction::{BatchTransaction, CommitPolicy, PartitionStats, TransactionState};
