//! Insert statement building
//!
//! One parameterized `INSERT` per partition, with a placeholder per column in
//! the partition's column order. The statement is prepared once on the
//! partition's session and reused for every row.

use crate::error::{SinkError, SinkResult};
use crate::sink::{Placeholder, PreparedInsert, SinkSession};
use tracing::debug;

/// A parameterized insert into `table` with a fixed column list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    table: String,
    columns: Vec<String>,
}

impl InsertStatement {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Render the SQL text for the given placeholder style
    ///
    /// `schema.table` names are quoted per part.
    pub fn to_sql(&self, placeholder: Placeholder) -> SinkResult<String> {
        if self.table.trim().is_empty() {
            return Err(SinkError::query("insert target table is empty"));
        }
        if self.columns.is_empty() {
            return Err(SinkError::query(format!(
                "insert into '{}' has no columns",
                self.table
            )));
        }

        let table = self
            .table
            .split('.')
            .map(quote_identifier)
            .collect::<Vec<_>>()
            .join(".");
        let columns = self
            .columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let values = (1..=self.columns.len())
            .map(|i| placeholder.render(i))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table, columns, values
        ))
    }

    /// Prepare on `session`, in the session's placeholder style
    pub async fn prepare(&self, session: &dyn SinkSession) -> SinkResult<Box<dyn PreparedInsert>> {
        let sql = self.to_sql(session.placeholder())?;
        debug!("Preparing insert: {}", sql);
        session.prepare(&sql).await
    }
}

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
