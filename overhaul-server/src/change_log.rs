//! Append-only monotonic change log, the source of truth for pull.
//!
//! `server_seq` is assigned by the database sequence at insert time, so it is
//! strictly increasing in commit order. Rolled-back transactions may leave
//! holes in the numbering; readers advance by the last observed seq
//! (`seq > cursor`), never by expecting contiguous integers.

use std::str::FromStr;

use overhaul_core::models::{ChangeLogEntry, ChangeOp};
use overhaul_core::{SyncError, SyncResult};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};

/// Append one entry inside the transaction that performs the matching
/// projection write. Returns the assigned seq.
pub async fn append(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    row_id: &str,
    op: ChangeOp,
    payload: &Value,
    created_at: i64,
) -> SyncResult<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO change_log (table_name, row_id, op, payload_json, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING server_seq
        "#,
    )
    .bind(table)
    .bind(row_id)
    .bind(op.to_string())
    .bind(payload)
    .bind(created_at)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row.try_get("server_seq")?)
}

/// Latest emitted entry for `(table, row_id)`, used for the idempotency
/// comparison before appending a replayed post-image.
pub async fn last_entry(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    row_id: &str,
) -> SyncResult<Option<(ChangeOp, Value)>> {
    let row = sqlx::query(
        r#"
        SELECT op, payload_json
        FROM change_log
        WHERE table_name = $1 AND row_id = $2
        ORDER BY server_seq DESC
        LIMIT 1
        "#,
    )
    .bind(table)
    .bind(row_id)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(|row| {
        let op = parse_op(row.try_get("op")?)?;
        Ok((op, row.try_get("payload_json")?))
    })
    .transpose()
}

/// Entries with `seq > after_seq`, ascending, bounded by `limit`.
pub async fn range(pool: &PgPool, after_seq: i64, limit: i64) -> SyncResult<Vec<ChangeLogEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT server_seq, table_name, row_id, op, payload_json, created_at
        FROM change_log
        WHERE server_seq > $1
        ORDER BY server_seq ASC
        LIMIT $2
        "#,
    )
    .bind(after_seq)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(ChangeLogEntry {
                seq: row.try_get("server_seq")?,
                table: row.try_get("table_name")?,
                row_id: row.try_get("row_id")?,
                op: parse_op(row.try_get("op")?)?,
                payload: row.try_get("payload_json")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Maximum committed seq, 0 when the log is empty.
pub async fn max_seq(pool: &PgPool) -> SyncResult<i64> {
    let row = sqlx::query("SELECT COALESCE(MAX(server_seq), 0) AS max_seq FROM change_log")
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("max_seq")?)
}

fn parse_op(raw: String) -> SyncResult<ChangeOp> {
    ChangeOp::from_str(&raw)
        .map_err(|_| SyncError::internal(format!("change_log holds unknown op {raw}")))
}
