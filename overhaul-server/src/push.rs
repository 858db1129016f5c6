//! Push handler: validates a client batch, routes each row to the sink or
//! the approval queue, and reports per-row outcomes.
//!
//! The transaction boundary is the table: a database failure rolls back that
//! table's rows and is reported against the first offending change, while
//! other tables in the same push commit independently. Validation and
//! permission failures never abort siblings; they surface as per-row errors.

use overhaul_core::models::now_millis;
use overhaul_core::payload::{self, NormalizedRow};
use overhaul_core::protocol::{PushRequest, PushResponse, QueuedRow, RowError, TableBatch};
use overhaul_core::tables::{self, TableDef};
use overhaul_core::{SyncError, SyncResult};
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use tracing::instrument;

use crate::auth::AuthedUser;
use crate::sink::{self, SinkOptions};
use crate::{change_log, cursors, ownership, workflow, AppState};

#[instrument(skip_all, fields(client_id = %request.client_id, actor = %actor.username))]
pub async fn handle_push(
    state: &AppState,
    actor: &AuthedUser,
    request: PushRequest,
) -> SyncResult<PushResponse> {
    if request.client_id.is_empty() {
        return Err(SyncError::validation("client_id must not be empty"));
    }

    let total_rows: usize = request
        .upserts
        .iter()
        .chain(request.deletes.iter())
        .map(|b| b.rows.len())
        .sum();
    if total_rows > state.config.push_max_batch {
        return Err(SyncError::validation(format!(
            "push of {total_rows} rows exceeds the batch ceiling of {}",
            state.config.push_max_batch
        )));
    }

    let mut response = PushResponse {
        ok: true,
        applied: 0,
        queued: Vec::new(),
        errors: Vec::new(),
    };

    let groups = group_by_table(&request, &mut response.errors);

    for (table, rows) in groups {
        push_table(state, actor, table, rows, &mut response).await?;
    }

    cursors::touch_push(&state.pool, &request.client_id, now_millis()).await?;

    Ok(response)
}

/// Partition the request's rows by registry table, preserving input order
/// within a table. Tables come out in foreign-key dependency order so parents
/// land before children. Unknown tables become per-row errors.
fn group_by_table<'req>(
    request: &'req PushRequest,
    errors: &mut Vec<RowError>,
) -> Vec<(&'static TableDef, Vec<&'req Value>)> {
    let batches: Vec<&TableBatch> = request.upserts.iter().chain(request.deletes.iter()).collect();

    for batch in &batches {
        if tables::lookup(&batch.table).is_none() {
            for row in &batch.rows {
                errors.push(row_error(
                    &batch.table,
                    row_id_of(row),
                    &SyncError::UnknownTable(batch.table.clone()),
                ));
            }
        }
    }

    tables::SYNC_TABLES
        .iter()
        .filter_map(|table| {
            let rows: Vec<&Value> = batches
                .iter()
                .filter(|b| b.table == table.name)
                .flat_map(|b| b.rows.iter())
                .collect();
            (!rows.is_empty()).then_some((table, rows))
        })
        .collect()
}

/// Apply one table's rows in a single transaction.
async fn push_table(
    state: &AppState,
    actor: &AuthedUser,
    table: &'static TableDef,
    rows: Vec<&Value>,
    response: &mut PushResponse,
) -> SyncResult<()> {
    // Validation and permission failures are collected up front; they leave
    // the transaction untouched.
    let mut accepted = Vec::new();
    for raw in rows {
        match validate_row(actor, table, raw) {
            Ok(row) => accepted.push(row),
            Err(error) => response.errors.push(row_error(table.name, row_id_of(raw), &error)),
        }
    }
    if accepted.is_empty() {
        return Ok(());
    }

    let mut tx = state.pool.begin().await?;
    let mut applied: u64 = 0;
    let mut queued = Vec::new();

    for row in &accepted {
        match route_row(&mut tx, actor, row).await {
            Ok(Route::Direct) => {
                let report = match sink::apply_in_tx(
                    &mut tx,
                    &actor.as_actor(),
                    std::slice::from_ref(row),
                    &SinkOptions::default(),
                )
                .await
                {
                    Ok(report) => report,
                    Err(error) => {
                        // Table batches are atomic: the first offending
                        // change aborts everything this table staged.
                        response
                            .errors
                            .push(row_error(table.name, Some(row.row_id.clone()), &error));
                        return Ok(());
                    }
                };
                applied += report.applied;
            }
            Ok(Route::Queued(change_request_id)) => {
                queued.push(QueuedRow {
                    table: table.name.to_string(),
                    row_id: row.row_id.clone(),
                    change_request_id,
                });
            }
            Err(error) => {
                response
                    .errors
                    .push(row_error(table.name, Some(row.row_id.clone()), &error));
                return Ok(());
            }
        }
    }

    tx.commit().await?;
    response.applied += applied;
    response.queued.append(&mut queued);
    Ok(())
}

enum Route {
    Direct,
    Queued(uuid::Uuid),
}

/// Ownership routing. Creates apply directly and claim ownership; updates to
/// rows owned by someone else are enqueued for approval unless the actor's
/// role auto-approves.
async fn route_row(
    tx: &mut Transaction<'_, Postgres>,
    actor: &AuthedUser,
    row: &NormalizedRow,
) -> SyncResult<Route> {
    let table = row.table;
    let owner = ownership::lookup_owner(tx, table.name, &row.row_id).await?;

    let foreign_owner = match owner {
        None => None,
        Some(owner) if owner.owner_user_id == actor.id => None,
        Some(owner) => Some(owner),
    };

    let Some(owner) = foreign_owner else {
        return Ok(Route::Direct);
    };

    if actor.auto_approves() {
        return Ok(Route::Direct);
    }

    let before = change_log::last_entry(tx, table.name, &row.row_id)
        .await?
        .map(|(_, payload)| payload);

    let outcome =
        workflow::create_in_tx(tx, row, before, &actor.as_actor(), &owner, None).await?;
    if outcome.deduped {
        tracing::debug!(
            table = table.name,
            row_id = %row.row_id,
            "identical pending change request already queued"
        );
    }
    Ok(Route::Queued(outcome.id))
}

fn validate_row(
    actor: &AuthedUser,
    table: &'static TableDef,
    raw: &Value,
) -> SyncResult<NormalizedRow> {
    actor.require_push(table)?;
    payload::normalize(table, raw)
}

fn row_id_of(raw: &Value) -> Option<String> {
    raw.get("id").and_then(Value::as_str).map(str::to_string)
}

fn row_error(table: &str, row_id: Option<String>, error: &SyncError) -> RowError {
    RowError {
        table: table.to_string(),
        row_id: row_id.unwrap_or_default(),
        code: error.code(),
        message: error.to_string(),
    }
}
