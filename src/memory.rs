//! In-memory sink backend
//!
//! Keeps committed inserts apart from in-flight ones and logs every call, so a
//! load can be dry-run (`memory://` profile) and its transaction boundaries
//! inspected. Failures can be injected for execute, commit and prepare.

use crate::error::{SinkError, SinkResult};
use crate::sink::{Placeholder, PreparedInsert, SinkManager, SinkSession};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A call observed by the in-memory sink
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Connect { profile: String },
    Prepare { sql: String },
    Begin,
    Execute { sql: String, params: Vec<Value> },
    Commit,
    Rollback,
}

/// An insert as the sink received it
#[derive(Debug, Clone, PartialEq)]
pub struct InsertedRow {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<SinkEvent>,
    committed: Vec<InsertedRow>,
    profiles: Option<HashSet<String>>,
    executes: usize,
    fail_execute_at: Option<usize>,
    fail_commits: bool,
    fail_prepare: bool,
}

/// Shared in-memory sink; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    /// A sink that accepts any profile name
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that only knows the given profiles
    pub fn with_profiles<I, S>(profiles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = MemoryState {
            profiles: Some(profiles.into_iter().map(Into::into).collect()),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Fail the `n`-th execute (1-based, counted across all sessions)
    pub async fn fail_execute_at(&self, n: usize) {
        self.state.lock().await.fail_execute_at = Some(n);
    }

    pub async fn fail_commits(&self, fail: bool) {
        self.state.lock().await.fail_commits = fail;
    }

    pub async fn fail_prepare(&self, fail: bool) {
        self.state.lock().await.fail_prepare = fail;
    }

    pub async fn events(&self) -> Vec<SinkEvent> {
        self.state.lock().await.events.clone()
    }

    /// Inserts that are durable: autocommitted or part of a committed transaction
    pub async fn committed(&self) -> Vec<InsertedRow> {
        self.state.lock().await.committed.clone()
    }

    pub async fn count(&self, predicate: impl Fn(&SinkEvent) -> bool) -> usize {
        self.state
            .lock()
            .await
            .events
            .iter()
            .filter(|&e| predicate(e))
            .count()
    }

    pub async fn begins(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::Begin)).await
    }

    pub async fn commits(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::Commit)).await
    }

    pub async fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::Rollback)).await
    }

    pub async fn executes(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::Execute { .. })).await
    }
}

#[async_trait]
impl SinkManager for MemorySink {
    async fn session(&self, profile: &str) -> SinkResult<Box<dyn SinkSession>> {
        let mut state = self.state.lock().await;
        if let Some(profiles) = &state.profiles {
            if !profiles.contains(profile) {
                return Err(SinkError::UnknownProfile {
                    profile: profile.to_string(),
                });
            }
        }
        state.events.push(SinkEvent::Connect {
            profile: profile.to_string(),
        });

        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            pending: Arc::new(Mutex::new(None)),
        }))
    }
}

/// Open transaction buffer; `None` means autocommit
type Pending = Arc<Mutex<Option<Vec<InsertedRow>>>>;

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    pending: Pending,
}

#[async_trait]
impl SinkSession for MemorySession {
    fn placeholder(&self) -> Placeholder {
        Placeholder::QuestionMark
    }

    async fn prepare(&self, sql: &str) -> SinkResult<Box<dyn PreparedInsert>> {
        let mut state = self.state.lock().await;
        if state.fail_prepare {
            return Err(SinkError::query_with_sql("prepare failed", sql));
        }
        state.events.push(SinkEvent::Prepare {
            sql: sql.to_string(),
        });

        Ok(Box::new(MemoryInsert {
            state: Arc::clone(&self.state),
            pending: Arc::clone(&self.pending),
            sql: sql.to_string(),
        }))
    }

    async fn begin(&self) -> SinkResult<()> {
        let mut state = self.state.lock().await;
        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            return Err(SinkError::transaction("transaction already in progress"));
        }
        *pending = Some(Vec::new());
        state.events.push(SinkEvent::Begin);
        Ok(())
    }

    async fn commit(&self) -> SinkResult<()> {
        let mut state = self.state.lock().await;
        let mut pending = self.pending.lock().await;
        let Some(rows) = pending.take() else {
            return Err(SinkError::transaction("no transaction in progress"));
        };
        if state.fail_commits {
            // A failed COMMIT ends the transaction without persisting it
            return Err(SinkError::transaction("commit failed"));
        }
        state.committed.extend(rows);
        state.events.push(SinkEvent::Commit);
        Ok(())
    }

    async fn rollback(&self) -> SinkResult<()> {
        let mut state = self.state.lock().await;
        self.pending.lock().await.take();
        state.events.push(SinkEvent::Rollback);
        Ok(())
    }
}

struct MemoryInsert {
    state: Arc<Mutex<MemoryState>>,
    pending: Pending,
    sql: String,
}

#[async_trait]
impl PreparedInsert for MemoryInsert {
    async fn execute(&self, params: &[Value]) -> SinkResult<u64> {
        let mut state = self.state.lock().await;
        let mut pending = self.pending.lock().await;

        state.executes += 1;
        if state.fail_execute_at == Some(state.executes) {
            return Err(SinkError::query_with_sql("execute failed", &self.sql));
        }

        let expected = self.sql.matches('?').count();
        if params.len() != expected {
            return Err(SinkError::query_with_sql(
                format!("expected {} parameters, got {}", expected, params.len()),
                &self.sql,
            ));
        }

        state.events.push(SinkEvent::Execute {
            sql: self.sql.clone(),
            params: params.to_vec(),
        });

        let row = InsertedRow {
            sql: self.sql.clone(),
            params: params.to_vec(),
        };
        match pending.as_mut() {
            Some(rows) => rows.push(row),
            None => state.committed.push(row),
        }

        Ok(1)
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    const SQL: &str = r#"INSERT INTO "t" ("id") VALUES (?)"#;

    #[tokio::test]
    async fn test_transaction_visibility() {
        let sink = MemorySink::new();
        let session = sink.session("default").await.unwrap();
        let insert = session.prepare(SQL).await.unwrap();

        assert_ok!(session.begin().await);
        assert_ok!(insert.execute(&[json!(1)]).await);
        assert!(sink.committed().await.is_empty());

        assert_ok!(session.commit().await);
        assert_eq!(sink.committed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_pending() {
        let sink = MemorySink::new();
        let session = sink.session("default").await.unwrap();
        let insert = session.prepare(SQL).await.unwrap();

        assert_ok!(session.begin().await);
        assert_ok!(insert.execute(&[json!(1)]).await);
        assert_ok!(session.rollback().await);

        assert!(sink.committed().await.is_empty());
        assert_eq!(sink.rollbacks().await, 1);
    }

    #[tokio::test]
    async fn test_autocommit_without_transaction() {
        let sink = MemorySink::new();
        let session = sink.session("default").await.unwrap();
        let insert = session.prepare(SQL).await.unwrap();

        assert_ok!(insert.execute(&[json!(1)]).await);
        assert_eq!(sink.committed().await.len(), 1);
        assert_eq!(sink.begins().await, 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let sink = MemorySink::new();
        let session = sink.session("default").await.unwrap();
        let insert = session.prepare(SQL).await.unwrap();

        sink.fail_execute_at(2).await;
        assert_ok!(insert.execute(&[json!(1)]).await);
        assert_err!(insert.execute(&[json!(2)]).await);
        assert_ok!(insert.execute(&[json!(3)]).await);

        sink.fail_commits(true).await;
        assert_ok!(session.begin().await);
        assert_err!(session.commit().await);
        assert_eq!(sink.committed().await.len(), 2);
    }

    #[tokio::test]
    async fn test_parameter_count_checked() {
        let sink = MemorySink::new();
        let session = sink.session("default").await.unwrap();
        let insert = session.prepare(SQL).await.unwrap();
        assert_err!(insert.execute(&[json!(1), json!(2)]).await);
    }

    #[tokio::test]
    async fn test_profile_restriction() {
        let sink = MemorySink::with_profiles(["default"]);
        assert!(sink.session("default").await.is_ok());
        assert!(matches!(
            sink.session("other").await,
            Err(SinkError::UnknownProfile { .. })
        ));
    }
}
