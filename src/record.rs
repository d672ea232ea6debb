//! Record processing module for the SQL Sink Connector
//!
//! Turns an incoming row into the row that is actually inserted:
//! - Column selection: pass everything through, keep a subset, or rename
//! - Optional `created_at` / `updated_at` stamping
//!
//! Rows are JSON objects with insertion order preserved, since the first row's
//! key order fixes the statement's parameter order.

use crate::error::{SinkError, SinkResult};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// An ordered mapping from column name to scalar value
pub type Row = Map<String, Value>;

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

/// Format of injected timestamps (second resolution)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Which columns of a row are persisted, and under which names
///
/// In TOML an array is a filter and a table is a rename map:
///
/// ```toml
/// columns = ["id", "name"]
/// columns = { id = "user_id", name = "full_name" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    /// Every column, in the row's own order
    #[default]
    All,
    /// Only these columns, in this order
    Filter(Vec<String>),
    /// Source column -> target column, in map order; unmapped columns are dropped
    Rename(IndexMap<String, String>),
}

impl ColumnSpec {
    pub fn filter<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Filter(columns.into_iter().map(Into::into).collect())
    }

    pub fn rename<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Rename(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Output column names this spec produces, or `None` when they depend on the row
    pub fn target_columns(&self) -> Option<Vec<String>> {
        match self {
            Self::All => None,
            Self::Filter(columns) => Some(columns.clone()),
            Self::Rename(mapping) => Some(mapping.values().cloned().collect()),
        }
    }

    /// Check the column list is usable: non-empty, no blank names, no duplicate outputs
    pub fn validate(&self) -> Result<(), String> {
        let Some(targets) = self.target_columns() else {
            return Ok(());
        };

        if targets.is_empty() {
            return Err("column spec must name at least one column".to_string());
        }

        if let Self::Rename(mapping) = self {
            if mapping.keys().any(|k| k.trim().is_empty()) {
                return Err("column spec contains an empty source column".to_string());
            }
        }

        let mut seen = HashSet::new();
        for column in &targets {
            if column.trim().is_empty() {
                return Err("column spec contains an empty column name".to_string());
            }
            if !seen.insert(column.as_str()) {
                return Err(format!("column '{}' appears more than once", column));
            }
        }

        Ok(())
    }

    /// Apply the selection/rename to a row, leaving the input untouched
    pub fn resolve(&self, row: &Row) -> Row {
        match self {
            Self::All => row.clone(),
            Self::Filter(columns) => columns
                .iter()
                .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                .collect(),
            Self::Rename(mapping) => mapping
                .iter()
                .filter_map(|(from, to)| row.get(from).map(|v| (to.clone(), v.clone())))
                .collect(),
        }
    }
}

/// Transform a row for insertion, stamping with the current time when asked
///
/// Returns the output row and its column names in order.
pub fn transform(row: &Row, spec: &ColumnSpec, timestamps: bool) -> (Row, Vec<String>) {
    transform_at(row, spec, timestamps.then(Utc::now))
}

/// Same as [`transform`] with an explicit stamp time
pub fn transform_at(
    row: &Row,
    spec: &ColumnSpec,
    stamp: Option<DateTime<Utc>>,
) -> (Row, Vec<String>) {
    let mut output = spec.resolve(row);

    if let Some(at) = stamp {
        // Stamps always go last, even if the row already carried them
        output.retain(|k, _| k != CREATED_AT && k != UPDATED_AT);
        let formatted = format_timestamp(at);
        output.insert(CREATED_AT.to_string(), Value::String(formatted.clone()));
        output.insert(UPDATED_AT.to_string(), Value::String(formatted));
    }

    let columns = output.keys().cloned().collect();
    (output, columns)
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Columns a partition's statement is built with
///
/// Explicit specs decide on their own; otherwise the sample row's keys are used.
/// Timestamp columns are appended when enabled.
pub fn statement_columns(
    spec: &ColumnSpec,
    sample: Option<&Row>,
    timestamps: bool,
) -> Option<Vec<String>> {
    let mut columns = match spec.target_columns() {
        Some(columns) => columns,
        None => sample?.keys().cloned().collect(),
    };

    if timestamps {
        columns.retain(|c| c != CREATED_AT && c != UPDATED_AT);
        columns.push(CREATED_AT.to_string());
        columns.push(UPDATED_AT.to_string());
    }

    Some(columns)
}

/// Extract parameter values in statement order
///
/// The transformed row must carry exactly the partition's columns; a missing
/// or extra key is a `ColumnMismatch`.
pub fn bind_values(row: &Row, columns: &[String]) -> SinkResult<Vec<Value>> {
    let values: Option<Vec<Value>> = columns.iter().map(|c| row.get(c).cloned()).collect();

    match values {
        Some(values) if row.len() == columns.len() => Ok(values),
        _ => Err(SinkError::ColumnMismatch {
            expected: columns.to_vec(),
            actual: row.keys().cloned().collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn jane() -> Row {
        let value = json!({"id": "1", "name": "Jane Doe", "email": "janedoe@example.com"});
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn keys(row: &Row) -> Vec<&str> {
        row.keys().map(String::as_str).collect()
    }

    #[test]
    fn test_passthrough_keeps_row_and_order() {
        let row = jane();
        let (out, columns) = transform(&row, &ColumnSpec::All, false);
        assert_eq!(out, row);
        assert_eq!(keys(&out), vec!["id", "name", "email"]);
        assert_eq!(columns, vec!["id", "name", "email"]);
    }

    #[test]
    fn test_filter_follows_spec_order() {
        let row = jane();
        let spec = ColumnSpec::filter(["email", "id"]);
        let (out, columns) = transform(&row, &spec, false);
        assert_eq!(columns, vec!["email", "id"]);
        assert_eq!(out["email"], json!("janedoe@example.com"));
        assert_eq!(out["id"], json!("1"));
    }

    #[test]
    fn test_filter_skips_missing_columns() {
        let row = jane();
        let spec = ColumnSpec::filter(["id", "phone", "name"]);
        let (_, columns) = transform(&row, &spec, false);
        assert_eq!(columns, vec!["id", "name"]);
    }

    #[test]
    fn test_rename_maps_and_drops_unmapped() {
        let row = jane();
        let spec = ColumnSpec::rename([("name", "full_name"), ("id", "user_id")]);
        let (out, columns) = transform(&row, &spec, false);
        assert_eq!(columns, vec!["full_name", "user_id"]);
        assert_eq!(out["full_name"], json!("Jane Doe"));
        assert_eq!(out["user_id"], json!("1"));
        assert!(!out.contains_key("email"));
    }

    #[test]
    fn test_timestamps_appended_last_and_equal() {
        let row = jane();
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        let (out, columns) = transform_at(&row, &ColumnSpec::filter(["id"]), Some(at));
        assert_eq!(columns, vec!["id", CREATED_AT, UPDATED_AT]);
        assert_eq!(out[CREATED_AT], json!("2024-03-09 07:05:02"));
        assert_eq!(out[CREATED_AT], out[UPDATED_AT]);
    }

    #[test]
    fn test_existing_stamp_columns_move_to_end() {
        let mut row = Row::new();
        row.insert(CREATED_AT.to_string(), json!("old"));
        row.insert("id".to_string(), json!(7));
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let (out, columns) = transform_at(&row, &ColumnSpec::All, Some(at));
        assert_eq!(columns, vec!["id", CREATED_AT, UPDATED_AT]);
        assert_eq!(out[CREATED_AT], json!("2024-01-01 00:00:00"));
    }

    #[test]
    fn test_transform_does_not_touch_input() {
        let row = jane();
        let before = row.clone();
        let _ = transform(&row, &ColumnSpec::rename([("id", "user_id")]), true);
        assert_eq!(row, before);
    }

    #[test]
    fn test_statement_columns() {
        let sample = jane();
        assert_eq!(
            statement_columns(&ColumnSpec::All, Some(&sample), false).unwrap(),
            vec!["id", "name", "email"]
        );
        assert_eq!(
            statement_columns(&ColumnSpec::rename([("id", "user_id")]), None, true).unwrap(),
            vec!["user_id", CREATED_AT, UPDATED_AT]
        );
        assert!(statement_columns(&ColumnSpec::All, None, false).is_none());
    }

    #[test]
    fn test_bind_values_checks_columns() {
        let row = jane();
        let columns: Vec<String> = vec!["id".into(), "name".into(), "email".into()];
        let values = bind_values(&row, &columns).unwrap();
        assert_eq!(values[1], json!("Jane Doe"));

        let err = bind_values(&row, &columns[..2]).unwrap_err();
        assert!(matches!(err, SinkError::ColumnMismatch { .. }));

        let mut short = jane();
        short.remove("name");
        let err = bind_values(&short, &columns).unwrap_err();
        assert!(matches!(err, SinkError::ColumnMismatch { .. }));
    }

    #[test]
    fn test_spec_validation() {
        assert!(ColumnSpec::All.validate().is_ok());
        assert!(ColumnSpec::filter(["id"]).validate().is_ok());
        assert!(ColumnSpec::Filter(vec![]).validate().is_err());
        assert!(ColumnSpec::filter(["id", "id"]).validate().is_err());
        assert!(ColumnSpec::filter([" "]).validate().is_err());
        assert!(ColumnSpec::rename([("a", "x"), ("b", "x")]).validate().is_err());
        assert!(ColumnSpec::rename([("", "x")]).validate().is_err());
    }

    #[test]
    fn test_spec_deserialization() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default)]
            columns: ColumnSpec,
        }

        let filter: Holder = toml::from_str(r#"columns = ["id", "name"]"#).unwrap();
        assert_eq!(filter.columns, ColumnSpec::filter(["id", "name"]));

        let rename: Holder =
            toml::from_str(r#"columns = { name = "full_name", id = "user_id" }"#).unwrap();
        assert_eq!(
            rename.columns.target_columns().unwrap(),
            vec!["full_name", "user_id"]
        );

        let unset: Holder = toml::from_str("").unwrap();
        assert!(unset.columns.is_all());
    }
}
