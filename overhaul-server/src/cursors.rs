//! Per-client sync cursors. The first push or pull auto-creates the row;
//! nothing ever expires it.

use overhaul_core::models::SyncState;
use overhaul_core::SyncResult;
use sqlx::{PgPool, Row};

pub async fn get(pool: &PgPool, client_id: &str) -> SyncResult<Option<SyncState>> {
    let row = sqlx::query(
        r#"
        SELECT client_id, last_pulled_server_seq, last_pushed_at, last_pulled_at
        FROM sync_state
        WHERE client_id = $1
        "#,
    )
    .bind(client_id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        Ok(SyncState {
            client_id: row.try_get("client_id")?,
            last_pulled_server_seq: row.try_get("last_pulled_server_seq")?,
            last_pushed_at: row.try_get("last_pushed_at")?,
            last_pulled_at: row.try_get("last_pulled_at")?,
        })
    })
    .transpose()
}

/// Advance the pull cursor after a response has been emitted.
pub async fn touch_pull(
    pool: &PgPool,
    client_id: &str,
    last_pulled_server_seq: i64,
    at: i64,
) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_state (client_id, last_pulled_server_seq, last_pulled_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (client_id) DO UPDATE
        SET last_pulled_server_seq = EXCLUDED.last_pulled_server_seq,
            last_pulled_at = EXCLUDED.last_pulled_at
        "#,
    )
    .bind(client_id)
    .bind(last_pulled_server_seq)
    .bind(at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn touch_push(pool: &PgPool, client_id: &str, at: i64) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_state (client_id, last_pushed_at)
        VALUES ($1, $2)
        ON CONFLICT (client_id) DO UPDATE
        SET last_pushed_at = EXCLUDED.last_pushed_at
        "#,
    )
    .bind(client_id)
    .bind(at)
    .execute(pool)
    .await?;

    Ok(())
}
