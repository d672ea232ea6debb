//! Windowed transaction control for one partition
//!
//! Rows are executed inside a transaction that is committed every
//! `commit_size` rows. The next window begins with the next row, and the
//! last, partial window is committed when the partition ends. With
//! transactions disabled every execute stands alone.

use crate::error::{LoaderError, LoaderResult, SinkError};
use crate::record::Row;
use crate::sink::{PreparedInsert, SinkSession};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// When to commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    pub enabled: bool,
    pub size: usize,
}

impl CommitPolicy {
    pub fn windowed(size: usize) -> Self {
        Self {
            enabled: true,
            size: size.max(1),
        }
    }

    pub fn autocommit() -> Self {
        Self {
            enabled: false,
            size: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No window open
    Idle,
    /// A window is open with uncommitted rows
    Open,
    /// The partition ended and its last window was committed
    Committed,
    /// COMMIT failed; the backend already ended the window, so only abort is accepted
    Failed,
    /// The partition was aborted and its open window rolled back
    RolledBack,
}

/// Counters for one partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    /// Rows executed successfully
    pub rows_written: u64,
    /// Rows covered by a successful commit (or autocommitted)
    pub rows_committed: u64,
    /// Explicit commits issued
    pub commits: u64,
}

/// Transaction controller for one partition
///
/// Owns the partition's session, so no other partition can interleave
/// statements into its transaction.
pub struct BatchTransaction {
    partition: String,
    session: Box<dyn SinkSession>,
    policy: CommitPolicy,
    state: TransactionState,
    pending: usize,
    stats: PartitionStats,
}

impl BatchTransaction {
    pub fn new(
        partition: impl Into<String>,
        session: Box<dyn SinkSession>,
        policy: CommitPolicy,
    ) -> Self {
        Self {
            partition: partition.into(),
            session,
            policy,
            state: TransactionState::Idle,
            pending: 0,
            stats: PartitionStats::default(),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn session(&self) -> &dyn SinkSession {
        self.session.as_ref()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Rows executed in the open window
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn stats(&self) -> PartitionStats {
        self.stats
    }

    /// Execute one row, committing the window if it is full
    ///
    /// On failure the window stays open and uncommitted; `row` is reported
    /// back in the error.
    pub async fn execute(
        &mut self,
        insert: &dyn PreparedInsert,
        params: &[Value],
        row: &Row,
    ) -> LoaderResult<()> {
        if self.state == TransactionState::Failed {
            return Err(self.failed_window());
        }

        if !self.policy.enabled {
            self.run(insert, params, row).await?;
            self.stats.rows_committed += 1;
            return Ok(());
        }

        if self.state != TransactionState::Open {
            self.begin().await?;
        }

        self.run(insert, params, row).await?;
        self.pending += 1;

        if self.pending >= self.policy.size {
            self.commit().await?;
        }

        Ok(())
    }

    /// Commit whatever is pending and mark the partition done
    pub async fn finish(&mut self) -> LoaderResult<PartitionStats> {
        if self.state == TransactionState::Failed {
            return Err(self.failed_window());
        }
        if self.state == TransactionState::Open {
            self.commit().await?;
        }
        self.state = TransactionState::Committed;
        Ok(self.stats)
    }

    /// Roll back the open window; returns how many rows were discarded
    pub async fn abort(&mut self) -> LoaderResult<usize> {
        let discarded = self.pending;

        if self.state == TransactionState::Open {
            warn!(
                "Rolling back {} uncommitted rows in partition '{}'",
                discarded, self.partition
            );
            self.session
                .rollback()
                .await
                .map_err(|source| LoaderError::Transaction {
                    partition: self.partition.clone(),
                    source,
                })?;
        } else if self.state == TransactionState::Failed {
            warn!(
                "Discarding {} rows of the failed window in partition '{}'",
                discarded, self.partition
            );
        }

        self.pending = 0;
        self.state = TransactionState::RolledBack;
        Ok(discarded)
    }

    async fn run(
        &mut self,
        insert: &dyn PreparedInsert,
        params: &[Value],
        row: &Row,
    ) -> LoaderResult<()> {
        insert
            .execute(params)
            .await
            .map_err(|source| LoaderError::Write {
                partition: self.partition.clone(),
                row: Box::new(row.clone()),
                source,
            })?;
        self.stats.rows_written += 1;
        Ok(())
    }

    async fn begin(&mut self) -> LoaderResult<()> {
        self.session
            .begin()
            .await
            .map_err(|source| LoaderError::Transaction {
                partition: self.partition.clone(),
                source,
            })?;
        debug!("Began transaction for partition '{}'", self.partition);
        self.state = TransactionState::Open;
        self.pending = 0;
        Ok(())
    }

    async fn commit(&mut self) -> LoaderResult<()> {
        if let Err(source) = self.session.commit().await {
            self.state = TransactionState::Failed;
            return Err(LoaderError::Commit {
                partition: self.partition.clone(),
                uncommitted: self.pending,
                source,
            });
        }

        debug!(
            "Committed {} rows for partition '{}'",
            self.pending, self.partition
        );
        self.stats.commits += 1;
        self.stats.rows_committed += self.pending as u64;
        self.pending = 0;
        self.state = TransactionState::Idle;
        Ok(())
    }

    fn failed_window(&self) -> LoaderError {
        LoaderError::Transaction {
            partition: self.partition.clone(),
            source: SinkError::transaction(format!(
                "a commit failed with {} rows in the window; abort the partition first",
                self.pending
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySink;
    use crate::sink::SinkManager;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    const SQL: &str = r#"INSERT INTO "t" ("id") VALUES (?)"#;

    async fn setup(
        policy: CommitPolicy,
    ) -> (MemorySink, BatchTransaction, Box<dyn PreparedInsert>) {
        let sink = MemorySink::new();
        let session = sink.session("default").await.unwrap();
        let insert = session.prepare(SQL).await.unwrap();
        (sink, BatchTransaction::new("meta", session, policy), insert)
    }

    fn row(id: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), json!(id));
        row
    }

    async fn write(tx: &mut BatchTransaction, insert: &dyn PreparedInsert, count: i64) {
        for id in 0..count {
            let row = row(id);
            assert_ok!(tx.execute(insert, &[json!(id)], &row).await);
        }
    }

    #[tokio::test]
    async fn test_commits_every_window() {
        let (sink, mut tx, insert) = setup(CommitPolicy::windowed(3)).await;

        write(&mut tx, insert.as_ref(), 7).await;
        assert_eq!(sink.commits().await, 2);
        assert_eq!(tx.pending(), 1);
        assert_eq!(tx.state(), TransactionState::Open);

        let stats = tx.finish().await.unwrap();
        assert_eq!(sink.commits().await, 3);
        assert_eq!(sink.begins().await, 3);
        assert_eq!(stats.commits, 3);
        assert_eq!(stats.rows_committed, 7);
        assert_eq!(tx.state(), TransactionState::Committed);
    }

    #[tokio::test]
    async fn test_exact_multiple_leaves_no_empty_window() {
        let (sink, mut tx, insert) = setup(CommitPolicy::windowed(3)).await;

        write(&mut tx, insert.as_ref(), 6).await;
        assert_eq!(tx.state(), TransactionState::Idle);

        let stats = tx.finish().await.unwrap();
        assert_eq!(stats.commits, 2);
        assert_eq!(sink.begins().await, 2);
        assert_eq!(sink.commits().await, 2);
    }

    #[tokio::test]
    async fn test_below_threshold_waits_for_finish() {
        let (sink, mut tx, insert) = setup(CommitPolicy::windowed(50)).await;

        write(&mut tx, insert.as_ref(), 1).await;
        assert_eq!(sink.commits().await, 0);
        assert!(sink.committed().await.is_empty());

        assert_ok!(tx.finish().await);
        assert_eq!(sink.commits().await, 1);
        assert_eq!(sink.committed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_autocommit_skips_transactions() {
        let (sink, mut tx, insert) = setup(CommitPolicy::autocommit()).await;

        write(&mut tx, insert.as_ref(), 4).await;
        let stats = tx.finish().await.unwrap();

        assert_eq!(sink.begins().await, 0);
        assert_eq!(sink.commits().await, 0);
        assert_eq!(sink.committed().await.len(), 4);
        assert_eq!(stats.rows_committed, 4);
        assert_eq!(stats.commits, 0);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_window_open() {
        let (sink, mut tx, insert) = setup(CommitPolicy::windowed(10)).await;
        sink.fail_execute_at(2).await;

        write(&mut tx, insert.as_ref(), 1).await;
        let failed = row(99);
        let err = tx
            .execute(insert.as_ref(), &[json!(99)], &failed)
            .await
            .unwrap_err();

        match err {
            LoaderError::Write { partition, row, .. } => {
                assert_eq!(partition, "meta");
                assert_eq!(*row, failed);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tx.state(), TransactionState::Open);
        assert_eq!(tx.pending(), 1);
        assert_eq!(sink.commits().await, 0);
    }

    #[tokio::test]
    async fn test_abort_rolls_back_open_window() {
        let (sink, mut tx, insert) = setup(CommitPolicy::windowed(2)).await;

        write(&mut tx, insert.as_ref(), 3).await;
        let discarded = tx.abort().await.unwrap();

        assert_eq!(discarded, 1);
        assert_eq!(sink.rollbacks().await, 1);
        // The first full window stays durable
        assert_eq!(sink.committed().await.len(), 2);
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[tokio::test]
    async fn test_commit_failure_reports_uncommitted() {
        let (sink, mut tx, insert) = setup(CommitPolicy::windowed(10)).await;

        write(&mut tx, insert.as_ref(), 4).await;
        sink.fail_commits(true).await;

        let err = tx.finish().await.unwrap_err();
        assert!(matches!(err, LoaderError::Commit { uncommitted: 4, .. }));
        assert_eq!(tx.state(), TransactionState::Failed);
        assert_err!(tx.finish().await);

        // The backend already ended the window, so nothing is rolled back
        assert_eq!(assert_ok!(tx.abort().await), 4);
        assert_eq!(sink.rollbacks().await, 0);
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[tokio::test]
    async fn test_rows_after_failed_commit_are_refused() {
        let (sink, mut tx, insert) = setup(CommitPolicy::windowed(2)).await;
        sink.fail_commits(true).await;

        write(&mut tx, insert.as_ref(), 1).await;
        let err = tx.execute(insert.as_ref(), &[json!(1)], &row(1)).await.unwrap_err();
        assert!(matches!(err, LoaderError::Commit { uncommitted: 2, .. }));

        sink.fail_commits(false).await;
        let err = tx.execute(insert.as_ref(), &[json!(2)], &row(2)).await.unwrap_err();
        assert!(matches!(err, LoaderError::Transaction { .. }));

        assert_eq!(sink.executes().await, 2);
        assert!(sink.committed().await.is_empty());
        assert_eq!(tx.stats().rows_committed, 0);
        assert_eq!(assert_ok!(tx.abort().await), 2);
    }

    #[test]
    fn test_policy_constructors() {
        assert_eq!(CommitPolicy::windowed(0).size, 1);
        assert!(!CommitPolicy::autocommit().enabled);
    }
}
