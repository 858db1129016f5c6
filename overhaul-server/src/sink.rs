//! Idempotent write path: applies post-images to the projection tables and
//! appends matching change log entries in the same transaction.
//!
//! The sink is the only code that writes synchronized tables. Both the push
//! handler and the workflow apply path feed it; the upsert statements are
//! generated from the table registry so every synchronized table goes through
//! the same merge, staleness, and idempotency rules.

use overhaul_core::models::now_millis;
use overhaul_core::payload::{canonicalize, NormalizedRow};
use overhaul_core::tables::{ColumnType, TableDef};
use overhaul_core::{SyncError, SyncResult};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::{change_log, ownership};

#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Timestamp to stamp on appended log entries; defaults to now. The
    /// workflow apply path pins it to the request's decision time.
    pub log_created_at: Option<i64>,
    /// Claim first-writer ownership for rows this batch touches. Off for the
    /// workflow path, where the owner predates the request.
    pub claim_ownership: bool,
    /// Apply even when the incoming `updated_at` trails the projection, and
    /// append a log entry even when the post-image matches the last emission.
    /// An applied change request must always produce its own entry stamped at
    /// decision time, including when the same content already landed through
    /// a direct push.
    pub force: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            log_created_at: None,
            claim_ownership: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowDisposition {
    /// Projection merged and a log entry appended with this seq.
    Logged(i64),
    /// Post-image byte-identical to the last emission; nothing written.
    Unchanged,
    /// Incoming `updated_at` trails the projection; write skipped.
    Stale,
}

#[derive(Debug, Default)]
pub struct SinkReport {
    /// Number of log entries appended.
    pub applied: u64,
    pub dispositions: Vec<RowDisposition>,
}

pub async fn apply(
    pool: &PgPool,
    actor: &Actor,
    changes: &[NormalizedRow],
    opts: &SinkOptions,
) -> SyncResult<SinkReport> {
    let mut tx = pool.begin().await?;
    let report = apply_in_tx(&mut tx, actor, changes, opts).await?;
    tx.commit().await?;
    Ok(report)
}

/// Apply a batch inside an existing transaction. Any database failure aborts
/// the whole batch through the caller's rollback; the error names the
/// offending `(table, row)`.
#[instrument(skip_all, fields(actor = %actor.username, rows = changes.len()))]
pub async fn apply_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    actor: &Actor,
    changes: &[NormalizedRow],
    opts: &SinkOptions,
) -> SyncResult<SinkReport> {
    let mut report = SinkReport::default();

    for change in changes {
        let disposition = apply_one(tx, actor, change, opts)
            .await
            .map_err(|e| contextualize(change, e))?;
        if let RowDisposition::Logged(_) = disposition {
            report.applied += 1;
        }
        report.dispositions.push(disposition);
    }

    Ok(report)
}

async fn apply_one(
    tx: &mut Transaction<'_, Postgres>,
    actor: &Actor,
    change: &NormalizedRow,
    opts: &SinkOptions,
) -> SyncResult<RowDisposition> {
    let table = change.table;
    let mut row = change.clone();

    // Row-lock the current projection state for the staleness floor.
    let current_updated_at: Option<i64> = sqlx::query(&format!(
        "SELECT updated_at FROM {} WHERE id = $1 FOR UPDATE",
        table.name
    ))
    .bind(&row.row_id)
    .fetch_optional(&mut **tx)
    .await?
    .map(|r| r.try_get("updated_at"))
    .transpose()?;

    let log_created_at = opts.log_created_at.unwrap_or_else(now_millis);

    if let Some(current) = current_updated_at {
        if current > row.updated_at() {
            if !opts.force {
                tracing::debug!(
                    table = table.name,
                    row_id = %row.row_id,
                    "skipping stale write ({} < {current})",
                    row.updated_at()
                );
                return Ok(RowDisposition::Stale);
            }
            // Forced last-writer-wins apply keeps updated_at monotonic by
            // stamping the decision time.
            row.set_updated_at(log_created_at);
        }
    }

    // Replay of an identical post-image appends nothing, otherwise the log
    // grows without bound on retries. A forced apply skips the check: every
    // applied change request emits exactly one entry at its decision time.
    if !opts.force {
        if let Some((last_op, last_payload)) =
            change_log::last_entry(tx, table.name, &row.row_id).await?
        {
            if last_op == row.op() && canonicalize(&last_payload) == row.canonical() {
                return Ok(RowDisposition::Unchanged);
            }
        }
    }

    let sql = upsert_sql(table);
    let query = bind_row(sqlx::query(&sql), table, &row);
    query.execute(&mut **tx).await?;

    let payload = row.payload();
    let seq = change_log::append(
        tx,
        table.name,
        &row.row_id,
        row.op(),
        &payload,
        log_created_at,
    )
    .await?;

    if opts.claim_ownership {
        ownership::ensure_owner(tx, table.name, &row.row_id, actor.user_id, &actor.username)
            .await?;
    }

    Ok(RowDisposition::Logged(seq))
}

/// Merge-by-primary-key statement for one registry table. Soft deletes go
/// through the same statement; the post-image carries `deleted_at` and the
/// row stays addressable.
fn upsert_sql(table: &TableDef) -> String {
    let columns: Vec<&str> = table.columns.iter().map(|c| c.name).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    let assignments: Vec<String> = columns
        .iter()
        .filter(|c| **c != "id")
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (id) DO UPDATE SET {}",
        table.name,
        columns.join(", "),
        placeholders.join(", "),
        assignments.join(", ")
    )
}

fn bind_row<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    table: &TableDef,
    row: &NormalizedRow,
) -> Query<'q, Postgres, PgArguments> {
    for column in table.columns {
        let value = row.get(column.name);
        query = match column.ty {
            ColumnType::Text => query.bind(value.as_str().map(str::to_string)),
            ColumnType::BigInt => query.bind(value.as_i64()),
            ColumnType::Bool => query.bind(value.as_bool()),
            ColumnType::Json => {
                if value.is_null() {
                    query.bind(None::<serde_json::Value>)
                } else {
                    query.bind(Some(value.clone()))
                }
            }
        };
    }
    query
}

/// Name the offending row and classify constraint violations as validation
/// failures so clients do not retry them verbatim.
fn contextualize(change: &NormalizedRow, error: SyncError) -> SyncError {
    let SyncError::Database(db_error) = error else {
        return error;
    };

    let constraint_class = db_error
        .as_database_error()
        .and_then(|e| e.code())
        .map(|code| matches!(code.as_ref(), "23502" | "23503" | "23505" | "23514"))
        .unwrap_or(false);

    if constraint_class {
        SyncError::validation(format!(
            "{}/{}: {}",
            change.table.name,
            change.row_id,
            db_error
                .as_database_error()
                .map(|e| e.message().to_string())
                .unwrap_or_else(|| db_error.to_string())
        ))
    } else {
        SyncError::Database(db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overhaul_core::tables;

    #[test]
    fn upsert_sql_merges_every_non_key_column() {
        let sql = upsert_sql(&tables::ENTITY_TYPES);
        assert!(sql.starts_with("INSERT INTO entity_types (id, code, name,"));
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE SET"));
        assert!(sql.contains("code = EXCLUDED.code"));
        assert!(sql.contains("deleted_at = EXCLUDED.deleted_at"));
        assert!(!sql.contains("id = EXCLUDED.id"));
    }

    #[test]
    fn upsert_sql_placeholder_count_matches_columns() {
        for table in tables::SYNC_TABLES {
            let sql = upsert_sql(table);
            assert!(sql.contains(&format!("${}", table.columns.len())));
            assert!(!sql.contains(&format!("${}", table.columns.len() + 1)));
        }
    }
}
