//! Row payload normalization.
//!
//! Push and pull exchange full post-images of rows as JSON objects keyed by
//! lower-snake-case column names. Normalization validates an incoming object
//! against the table registry and produces the canonical form that is written
//! to the projection, appended to the change log, and compared for
//! idempotency. The canonical encoding keeps keys sorted so byte equality is
//! meaningful.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::errors::SyncError;
use crate::models::ChangeOp;
use crate::tables::{ColumnType, TableDef};
use crate::SyncResult;

/// Client-side bookkeeping column; stripped on ingest and never emitted.
const CLIENT_ONLY_COLUMNS: &[&str] = &["last_server_seq"];

/// Value every emitted payload carries; replicas overwrite their local
/// pending markers with it.
pub const SYNC_STATUS_SYNCED: &str = "synced";

/// A validated full post-image for one row of a synchronized table.
#[derive(Debug, Clone)]
pub struct NormalizedRow {
    pub table: &'static TableDef,
    pub row_id: String,
    values: BTreeMap<String, Value>,
}

impl NormalizedRow {
    pub fn updated_at(&self) -> i64 {
        self.values
            .get("updated_at")
            .and_then(Value::as_i64)
            .unwrap_or_default()
    }

    pub fn deleted_at(&self) -> Option<i64> {
        self.values.get("deleted_at").and_then(Value::as_i64)
    }

    /// Log operation implied by the post-image.
    pub fn op(&self) -> ChangeOp {
        if self.deleted_at().is_some() {
            ChangeOp::Delete
        } else {
            ChangeOp::Upsert
        }
    }

    pub fn get(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&Value::Null)
    }

    /// Override `updated_at`, used when a forced workflow apply must keep the
    /// per-row timestamp monotonic.
    pub fn set_updated_at(&mut self, millis: i64) {
        self.values
            .insert("updated_at".to_string(), Value::from(millis));
    }

    /// The payload as emitted on pull, keys sorted.
    pub fn payload(&self) -> Value {
        Value::Object(self.values.clone().into_iter().collect())
    }

    /// Canonical byte encoding used for the idempotency comparison.
    pub fn canonical(&self) -> String {
        self.payload().to_string()
    }
}

/// Re-serialize an already-stored payload into the canonical encoding.
/// JSONB round-trips lose key order, so comparisons always go through this.
pub fn canonicalize(payload: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), sort(v)))
                    .collect::<BTreeMap<_, _>>()
                    .into_iter()
                    .collect::<Map<_, _>>(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(payload).to_string()
}

/// Validate a raw wire object against `table` and produce its canonical form.
pub fn normalize(table: &'static TableDef, raw: &Value) -> SyncResult<NormalizedRow> {
    let object = raw.as_object().ok_or_else(|| {
        SyncError::validation(format!("{}: row payload must be a JSON object", table.name))
    })?;

    for key in object.keys() {
        if CLIENT_ONLY_COLUMNS.contains(&key.as_str()) {
            continue;
        }
        if table.column(key).is_none() {
            return Err(SyncError::validation(format!(
                "{}: unknown column {key}",
                table.name
            )));
        }
    }

    let row_id = match object.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        _ => {
            return Err(SyncError::validation(format!(
                "{}: row id must be a non-empty string",
                table.name
            )))
        }
    };

    let mut values = BTreeMap::new();
    for column in table.columns {
        let incoming = object.get(column.name).unwrap_or(&Value::Null);
        let value = coerce(table, column.name, column.ty, incoming)?;

        if value.is_null() && column.not_null && column.name != "sync_status" {
            return Err(SyncError::validation(format!(
                "{}: missing required column {} for row {row_id}",
                table.name, column.name
            )));
        }
        values.insert(column.name.to_string(), value);
    }

    // The server is the authority on sync status: emitted payloads always
    // read "synced", whatever pending marker the client stored locally.
    values.insert(
        "sync_status".to_string(),
        Value::from(SYNC_STATUS_SYNCED),
    );

    Ok(NormalizedRow {
        table,
        row_id,
        values,
    })
}

fn coerce(
    table: &TableDef,
    column: &str,
    ty: ColumnType,
    value: &Value,
) -> SyncResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match ty {
        ColumnType::Text => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err(type_error(table, column, "a string", value)),
        },
        ColumnType::BigInt => match value.as_i64() {
            Some(n) => Ok(Value::from(n)),
            None => Err(type_error(table, column, "a 64-bit integer", value)),
        },
        ColumnType::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            _ => Err(type_error(table, column, "a boolean", value)),
        },
        // JSON columns embed the raw value; anything that parsed is well
        // formed, including quoted link-target scalars.
        ColumnType::Json => Ok(value.clone()),
    }
}

fn type_error(table: &TableDef, column: &str, expected: &str, got: &Value) -> SyncError {
    SyncError::validation(format!(
        "{}.{column}: expected {expected}, got {got}",
        table.name
    ))
}
