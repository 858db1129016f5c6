//! Pre-approval queue for edits to foreign-owned rows.
//!
//! Pushes that touch a row owned by someone else land here as pending change
//! requests instead of mutating the projection. A reviewer applies or rejects
//! them; apply replays the stored post-image through the sink with the log
//! entry stamped at decision time.

use std::str::FromStr;

use overhaul_core::models::{now_millis, ChangeRequest, RequestStatus, RowOwner};
use overhaul_core::payload::{self, NormalizedRow};
use overhaul_core::{tables, SyncError, SyncResult};
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::auth::AuthedUser;
use crate::sink::{self, Actor, SinkOptions};

#[derive(Debug, Clone, Copy)]
pub struct CreateOutcome {
    pub id: Uuid,
    /// True when an identical pending request already existed.
    pub deduped: bool,
}

/// Enqueue a pending request. Replays carrying the same post-image reuse the
/// existing pending request instead of stacking duplicates.
pub async fn create_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    row: &NormalizedRow,
    before: Option<Value>,
    author: &Actor,
    owner: &RowOwner,
    note: Option<&str>,
) -> SyncResult<CreateOutcome> {
    let after = row.payload();

    let existing: Option<Uuid> = sqlx::query(
        r#"
        SELECT id FROM change_requests
        WHERE table_name = $1 AND row_id = $2 AND status = 'pending' AND after_json = $3
        "#,
    )
    .bind(row.table.name)
    .bind(&row.row_id)
    .bind(&after)
    .fetch_optional(&mut **tx)
    .await?
    .map(|r| r.try_get("id"))
    .transpose()?;

    if let Some(id) = existing {
        return Ok(CreateOutcome { id, deduped: true });
    }

    let root_entity_id = row.table.root_entity_column.and_then(|column| {
        if column == "id" {
            Some(row.row_id.clone())
        } else {
            row.get(column).as_str().map(str::to_string)
        }
    });

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO change_requests (
            id, status, table_name, row_id, root_entity_id,
            before_json, after_json,
            record_owner_id, record_owner_username,
            change_author_id, change_author_username,
            note, created_at
        ) VALUES ($1, 'pending', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(id)
    .bind(row.table.name)
    .bind(&row.row_id)
    .bind(root_entity_id)
    .bind(before)
    .bind(&after)
    .bind(owner.owner_user_id)
    .bind(&owner.owner_username)
    .bind(author.user_id)
    .bind(&author.username)
    .bind(note)
    .bind(now_millis())
    .execute(&mut **tx)
    .await?;

    Ok(CreateOutcome { id, deduped: false })
}

pub async fn get(pool: &PgPool, id: Uuid) -> SyncResult<ChangeRequest> {
    let row = sqlx::query(SELECT_REQUEST)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("change request {id}")))?;
    map_request(&row)
}

pub async fn list(
    pool: &PgPool,
    status: Option<RequestStatus>,
    limit: i64,
) -> SyncResult<Vec<ChangeRequest>> {
    let rows = sqlx::query(
        r#"
        SELECT id, status, table_name, row_id, root_entity_id,
               before_json, after_json,
               record_owner_id, record_owner_username,
               change_author_id, change_author_username,
               note, created_at, decided_at, decided_by_id, decided_by_username
        FROM change_requests
        WHERE ($1::TEXT IS NULL OR status = $1)
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(status.map(|s| s.to_string()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_request).collect()
}

/// Apply a pending request: replay its `after_json` through the sink, stamp
/// the log entry with the decision time, and close the request. One
/// transaction; the request row is locked for the duration.
#[instrument(skip(pool, reviewer), fields(reviewer = %reviewer.username))]
pub async fn apply(pool: &PgPool, id: Uuid, reviewer: &AuthedUser) -> SyncResult<(RequestStatus, i64)> {
    let mut tx = pool.begin().await?;
    let request = lock_pending(&mut tx, id).await?;

    let table = tables::lookup(&request.table_name).ok_or_else(|| {
        SyncError::internal(format!(
            "change request {id} references unknown table {}",
            request.table_name
        ))
    })?;
    reviewer.require_review(table)?;

    // Re-validate the stored post-image; the registry may be stricter than it
    // was when the request was enqueued.
    let row = payload::normalize(table, &request.after_json)?;

    let decided_at = now_millis();
    let actor = reviewer.as_actor();

    // Stale after_json still applies (last-writer-wins); auditors keep both
    // states via before_json and the emitted log entry.
    sink::apply_in_tx(
        &mut tx,
        &actor,
        std::slice::from_ref(&row),
        &SinkOptions {
            log_created_at: Some(decided_at),
            claim_ownership: false,
            force: true,
        },
    )
    .await?;

    decide(&mut tx, id, RequestStatus::Applied, decided_at, reviewer, None).await?;

    let audit = audit_row(
        &actor,
        "change_request.applied",
        &request.table_name,
        &request.row_id,
        json!({ "change_request_id": id }),
        decided_at,
    )?;
    sink::apply_in_tx(&mut tx, &actor, &[audit], &SinkOptions::default()).await?;

    tx.commit().await?;
    Ok((RequestStatus::Applied, decided_at))
}

/// Reject a pending request. No projection change; the reviewer and an
/// optional note are recorded.
#[instrument(skip(pool, reviewer), fields(reviewer = %reviewer.username))]
pub async fn reject(
    pool: &PgPool,
    id: Uuid,
    reviewer: &AuthedUser,
    note: Option<&str>,
) -> SyncResult<(RequestStatus, i64)> {
    let mut tx = pool.begin().await?;
    let request = lock_pending(&mut tx, id).await?;

    let table = tables::lookup(&request.table_name).ok_or_else(|| {
        SyncError::internal(format!(
            "change request {id} references unknown table {}",
            request.table_name
        ))
    })?;
    reviewer.require_review(table)?;

    let decided_at = now_millis();
    decide(&mut tx, id, RequestStatus::Rejected, decided_at, reviewer, note).await?;

    let actor = reviewer.as_actor();
    let audit = audit_row(
        &actor,
        "change_request.rejected",
        &request.table_name,
        &request.row_id,
        json!({ "change_request_id": id }),
        decided_at,
    )?;
    sink::apply_in_tx(&mut tx, &actor, &[audit], &SinkOptions::default()).await?;

    tx.commit().await?;
    Ok((RequestStatus::Rejected, decided_at))
}

/// `SELECT ... FOR UPDATE` so apply and reject serialize per request id.
async fn lock_pending(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> SyncResult<ChangeRequest> {
    let row = sqlx::query(&format!("{SELECT_REQUEST} FOR UPDATE"))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("change request {id}")))?;

    let request = map_request(&row)?;
    if request.status != RequestStatus::Pending {
        return Err(SyncError::validation(format!(
            "change request {id} already {}",
            request.status
        )));
    }
    Ok(request)
}

async fn decide(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    status: RequestStatus,
    decided_at: i64,
    reviewer: &AuthedUser,
    note: Option<&str>,
) -> SyncResult<()> {
    sqlx::query(
        r#"
        UPDATE change_requests
        SET status = $2, decided_at = $3, decided_by_id = $4, decided_by_username = $5,
            note = COALESCE($6, note)
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.to_string())
    .bind(decided_at)
    .bind(reviewer.id)
    .bind(&reviewer.username)
    .bind(note)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Server-authored audit entry, written through the sink so it propagates to
/// replicas like any synchronized row.
pub(crate) fn audit_row(
    actor: &Actor,
    action: &str,
    table_name: &str,
    row_id: &str,
    details: Value,
    at: i64,
) -> SyncResult<NormalizedRow> {
    payload::normalize(
        &tables::AUDIT_LOG,
        &json!({
            "id": Uuid::new_v4().to_string(),
            "actor_id": actor.user_id.to_string(),
            "actor_username": actor.username,
            "action": action,
            "table_name": table_name,
            "row_id": row_id,
            "details_json": details,
            "created_at": at,
            "updated_at": at,
            "deleted_at": null,
        }),
    )
}

const SELECT_REQUEST: &str = r#"
    SELECT id, status, table_name, row_id, root_entity_id,
           before_json, after_json,
           record_owner_id, record_owner_username,
           change_author_id, change_author_username,
           note, created_at, decided_at, decided_by_id, decided_by_username
    FROM change_requests
    WHERE id = $1
"#;

fn map_request(row: &PgRow) -> SyncResult<ChangeRequest> {
    let status_raw: String = row.try_get("status")?;
    Ok(ChangeRequest {
        id: row.try_get("id")?,
        status: RequestStatus::from_str(&status_raw).map_err(|_| {
            SyncError::internal(format!("change_requests holds unknown status {status_raw}"))
        })?,
        table_name: row.try_get("table_name")?,
        row_id: row.try_get("row_id")?,
        root_entity_id: row.try_get("root_entity_id")?,
        before_json: row.try_get("before_json")?,
        after_json: row.try_get("after_json")?,
        record_owner_id: row.try_get("record_owner_id")?,
        record_owner_username: row.try_get("record_owner_username")?,
        change_author_id: row.try_get("change_author_id")?,
        change_author_username: row.try_get("change_author_username")?,
        note: row.try_get("note")?,
        created_at: row.try_get("created_at")?,
        decided_at: row.try_get("decided_at")?,
        decided_by_id: row.try_get("decided_by_id")?,
        decided_by_username: row.try_get("decided_by_username")?,
    })
}
