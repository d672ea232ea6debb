//! Sink abstractions for the SQL Sink Connector
//!
//! The loader never talks to a driver directly. It goes through:
//! - `SinkManager`: opens a session against a named profile
//! - `SinkSession`: one connection, owned by one partition at a time
//! - `PreparedInsert`: a prepared parameterized insert bound to a session
//!
//! `ProfileRegistry` is the manager used by the binary; it maps profile names
//! to backends by URL scheme.

use crate::config::ProfileConfig;
use crate::error::{LoaderError, LoaderResult, SinkError, SinkResult};
use crate::memory::MemorySink;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

#[cfg(feature = "postgres")]
use crate::postgres::PgConnector;
#[cfg(feature = "postgres")]
use std::time::Duration;

/// How a backend spells statement parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `$1, $2, ...` (PostgreSQL)
    Dollar,
    /// `?, ?, ...` (MySQL, SQLite, in-memory)
    QuestionMark,
}

impl Placeholder {
    /// Render the placeholder for a 1-based parameter index
    pub fn render(self, index: usize) -> String {
        match self {
            Self::Dollar => format!("${}", index),
            Self::QuestionMark => "?".to_string(),
        }
    }
}

/// Opens sessions against named sink profiles
#[async_trait]
pub trait SinkManager: Send + Sync {
    /// Open a session for `profile`; fails with `SinkError::UnknownProfile` if not configured
    async fn session(&self, profile: &str) -> SinkResult<Box<dyn SinkSession>>;
}

/// A single connection to the sink
///
/// Transaction control is per session, so partitions that run concurrently
/// must each hold their own.
#[async_trait]
pub trait SinkSession: Send + Sync {
    fn placeholder(&self) -> Placeholder;

    async fn prepare(&self, sql: &str) -> SinkResult<Box<dyn PreparedInsert>>;

    async fn begin(&self) -> SinkResult<()>;

    async fn commit(&self) -> SinkResult<()>;

    async fn rollback(&self) -> SinkResult<()>;
}

/// A prepared insert, executed once per row
#[async_trait]
pub trait PreparedInsert: Send + Sync {
    /// Execute with one value per column, returns affected row count
    async fn execute(&self, params: &[Value]) -> SinkResult<u64>;

    fn sql(&self) -> &str;
}

enum Backend {
    Memory(MemorySink),
    #[cfg(feature = "postgres")]
    Postgres(PgConnector),
}

/// Routes profile names to configured backends
pub struct ProfileRegistry {
    backends: HashMap<String, Backend>,
}

impl ProfileRegistry {
    /// Build backends for every configured profile
    pub fn from_profiles(profiles: &HashMap<String, ProfileConfig>) -> LoaderResult<Self> {
        let mut backends = HashMap::with_capacity(profiles.len());

        for (name, profile) in profiles {
            let backend = match profile.scheme() {
                Some("memory") => Backend::Memory(MemorySink::new()),
                #[cfg(feature = "postgres")]
                Some("postgres") | Some("postgresql") => Backend::Postgres(PgConnector::new(
                    profile.url.clone(),
                    Duration::from_secs(profile.connection_timeout_secs),
                )),
                Some(other) => {
                    return Err(LoaderError::config(format!(
                        "Profile '{}' uses unsupported scheme '{}'",
                        name, other
                    )))
                }
                None => {
                    return Err(LoaderError::config(format!(
                        "Profile '{}' has an invalid URL",
                        name
                    )))
                }
            };
            debug!("Registered sink profile '{}'", name);
            backends.insert(name.clone(), backend);
        }

        Ok(Self { backends })
    }

    /// The in-memory sink behind `profile`, if it is a memory profile
    pub fn memory_sink(&self, profile: &str) -> Option<&MemorySink> {
        match self.backends.get(profile) {
            Some(Backend::Memory(sink)) => Some(sink),
            _ => None,
        }
    }

    pub fn profiles(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

#[async_trait]
impl SinkManager for ProfileRegistry {
    async fn session(&self, profile: &str) -> SinkResult<Box<dyn SinkSession>> {
        match self.backends.get(profile) {
            Some(Backend::Memory(sink)) => sink.session(profile).await,
            #[cfg(feature = "postgres")]
            Some(Backend::Postgres(connector)) => Ok(Box::new(connector.connect().await?)),
            None => Err(SinkError::UnknownProfile {
                profile: profile.to_string(),
            }),
        }
    }
}
