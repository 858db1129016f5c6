//! Row ownership registry: first writer of a `(table, row)` claims it.
//!
//! Ownership decides whether a push applies directly or is queued for
//! approval. Reassignment is an administrative action outside the sync path.

use overhaul_core::models::RowOwner;
use overhaul_core::SyncResult;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

/// Idempotent claim: inserts unless `(table, row)` already has an owner.
pub async fn ensure_owner(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    row_id: &str,
    user_id: Uuid,
    username: &str,
) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO row_owners (id, table_name, row_id, owner_user_id, owner_username)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (table_name, row_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(table)
    .bind(row_id)
    .bind(user_id)
    .bind(username)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn lookup_owner(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    row_id: &str,
) -> SyncResult<Option<RowOwner>> {
    let row = sqlx::query(
        r#"
        SELECT id, table_name, row_id, owner_user_id, owner_username
        FROM row_owners
        WHERE table_name = $1 AND row_id = $2
        "#,
    )
    .bind(table)
    .bind(row_id)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(|row| {
        Ok(RowOwner {
            id: row.try_get("id")?,
            table_name: row.try_get("table_name")?,
            row_id: row.try_get("row_id")?,
            owner_user_id: row.try_get("owner_user_id")?,
            owner_username: row.try_get("owner_username")?,
        })
    })
    .transpose()
}

/// Administrative reassignment; overwrites any existing owner.
pub async fn reassign_owner(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    row_id: &str,
    new_owner_id: Uuid,
    new_owner_username: &str,
) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO row_owners (id, table_name, row_id, owner_user_id, owner_username)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (table_name, row_id) DO UPDATE
        SET owner_user_id = EXCLUDED.owner_user_id,
            owner_username = EXCLUDED.owner_username
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(table)
    .bind(row_id)
    .bind(new_owner_id)
    .bind(new_owner_username)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
