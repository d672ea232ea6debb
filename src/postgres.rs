//! PostgreSQL backend for the SQL Sink Connector
//!
//! Every session is its own client connection, so concurrent partitions never
//! share a transaction. Row values arrive as JSON scalars and are encoded for
//! whatever type the server inferred for each parameter.

use crate::error::{SinkError, SinkResult};
use crate::record::TIMESTAMP_FORMAT;
use crate::sink::{Placeholder, PreparedInsert, SinkSession};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Number, Value};
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls, Statement};
use tracing::{debug, error};

type BoxError = Box<dyn StdError + Sync + Send>;

/// Opens PostgreSQL sessions for one profile
pub struct PgConnector {
    url: String,
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub async fn connect(&self) -> SinkResult<PgSession> {
        let (client, connection) =
            tokio::time::timeout(self.connect_timeout, tokio_postgres::connect(&self.url, NoTls))
                .await
                .map_err(|_| {
                    SinkError::connection(format!(
                        "timed out after {:?} connecting to PostgreSQL",
                        self.connect_timeout
                    ))
                })?
                .map_err(|e| SinkError::connection_with_source("failed to connect to PostgreSQL", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        debug!("Opened PostgreSQL session");
        Ok(PgSession {
            client: Arc::new(client),
        })
    }
}

/// One PostgreSQL connection
pub struct PgSession {
    client: Arc<Client>,
}

impl PgSession {
    async fn simple(&self, sql: &str) -> SinkResult<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| SinkError::transaction(format!("{} failed: {}", sql, e)))
    }
}

#[async_trait]
impl SinkSession for PgSession {
    fn placeholder(&self) -> Placeholder {
        Placeholder::Dollar
    }

    async fn prepare(&self, sql: &str) -> SinkResult<Box<dyn PreparedInsert>> {
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| SinkError::query_with_sql(e.to_string(), sql))?;

        Ok(Box::new(PgInsert {
            client: Arc::clone(&self.client),
            statement,
            sql: sql.to_string(),
        }))
    }

    async fn begin(&self) -> SinkResult<()> {
        self.simple("BEGIN").await
    }

    async fn commit(&self) -> SinkResult<()> {
        self.simple("COMMIT").await
    }

    async fn rollback(&self) -> SinkResult<()> {
        self.simple("ROLLBACK").await
    }
}

/// A prepared PostgreSQL insert
pub struct PgInsert {
    client: Arc<Client>,
    statement: Statement,
    sql: String,
}

#[async_trait]
impl PreparedInsert for PgInsert {
    async fn execute(&self, params: &[Value]) -> SinkResult<u64> {
        let params: Vec<PgParam<'_>> = params.iter().map(PgParam).collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();

        self.client
            .execute(&self.statement, &param_refs)
            .await
            .map_err(|e| SinkError::query_with_sql(e.to_string(), &self.sql))
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

/// A JSON scalar encoded for the parameter type the server expects
#[derive(Debug)]
struct PgParam<'a>(&'a Value);

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) if *ty == Type::BOOL => b.to_sql(ty, out),
            Value::Bool(b) => string_to_sql(&b.to_string(), ty, out),
            Value::Number(n) => number_to_sql(n, ty, out),
            Value::String(s) => string_to_sql(s, ty, out),
            Value::Array(_) | Value::Object(_) if is_json(ty) => self.0.to_sql(ty, out),
            Value::Array(_) | Value::Object(_) => text_to_sql(&self.0.to_string(), ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn is_json(ty: &Type) -> bool {
    *ty == Type::JSON || *ty == Type::JSONB
}

fn number_to_sql(n: &Number, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if *ty == Type::INT2 {
        i16::try_from(integer(n)?)?.to_sql(ty, out)
    } else if *ty == Type::INT4 {
        i32::try_from(integer(n)?)?.to_sql(ty, out)
    } else if *ty == Type::INT8 {
        integer(n)?.to_sql(ty, out)
    } else if *ty == Type::FLOAT4 {
        (float(n)? as f32).to_sql(ty, out)
    } else if *ty == Type::FLOAT8 {
        float(n)?.to_sql(ty, out)
    } else if is_json(ty) {
        Value::Number(n.clone()).to_sql(ty, out)
    } else {
        text_to_sql(&n.to_string(), ty, out)
    }
}

fn string_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if *ty == Type::INT2 {
        s.trim().parse::<i16>()?.to_sql(ty, out)
    } else if *ty == Type::INT4 {
        s.trim().parse::<i32>()?.to_sql(ty, out)
    } else if *ty == Type::INT8 {
        s.trim().parse::<i64>()?.to_sql(ty, out)
    } else if *ty == Type::FLOAT4 {
        s.trim().parse::<f32>()?.to_sql(ty, out)
    } else if *ty == Type::FLOAT8 {
        s.trim().parse::<f64>()?.to_sql(ty, out)
    } else if *ty == Type::BOOL {
        s.trim().parse::<bool>()?.to_sql(ty, out)
    } else if *ty == Type::TIMESTAMP {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)?.to_sql(ty, out)
    } else if *ty == Type::TIMESTAMPTZ {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)?
            .and_utc()
            .to_sql(ty, out)
    } else if *ty == Type::DATE {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")?.to_sql(ty, out)
    } else if is_json(ty) {
        Value::String(s.to_string()).to_sql(ty, out)
    } else {
        text_to_sql(s, ty, out)
    }
}

fn text_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if !<&str as ToSql>::accepts(ty) {
        return Err(format!("cannot encode text value as {}", ty).into());
    }
    s.to_sql(ty, out)
}

fn integer(n: &Number) -> Result<i64, BoxError> {
    n.as_i64()
        .ok_or_else(|| format!("{} is not a 64-bit integer", n).into())
}

fn float(n: &Number) -> Result<f64, BoxError> {
    n.as_f64()
        .ok_or_else(|| format!("{} is not representable as a float", n).into())
}
