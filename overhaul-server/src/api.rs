//! HTTP surface: thin axum handlers over the sync engine.
//!
//! Push, pull, and workflow decisions run under the request deadline and the
//! concurrency bound; timing out aborts the transaction so nothing partial is
//! observable and cursors stay put.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use overhaul_core::compat::{self, ClientSchema, GateDecision, ServerSchema};
use overhaul_core::models::{now_millis, ChangeRequest, RequestStatus, Role};
use overhaul_core::protocol::{
    DecisionRequest, DecisionResponse, HandshakeRequest, HandshakeResponse, PullRequest,
    PullResponse, PushRequest, PushResponse, SchemaResponse,
};
use overhaul_core::{schema, tables, SyncError, SyncResult};

use crate::auth::{self, AuthedUser};
use crate::{change_log, ownership, pull, push, sink, workflow, AppState};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/auth/login", post(login))
        .route("/sync/handshake", post(handshake))
        .route("/sync/schema", get(schema_descriptor))
        .route("/sync/push", post(sync_push))
        .route("/sync/pull", post(sync_pull))
        .route("/changes", get(changes_list))
        .route("/changes/:id", get(changes_get))
        .route("/changes/apply", post(changes_apply))
        .route("/changes/reject", post(changes_reject))
        .route("/admin/users", post(admin_create_user))
        .route("/admin/owners/reassign", post(admin_reassign_owner))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run `work` under the configured request deadline. A timed-out transaction
/// is dropped mid-flight, which rolls it back.
async fn with_deadline<T, F>(state: &AppState, work: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    let deadline = Duration::from_millis(state.config.request_timeout_ms);
    match tokio::time::timeout(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::DeadlineExceeded),
    }
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    ok: bool,
    token: String,
    user_id: Uuid,
    username: String,
    role: Role,
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> SyncResult<Json<LoginResponse>> {
    let (user, token) = auth::login(&state.pool, &request.username, &request.password).await?;
    Ok(Json(LoginResponse {
        ok: true,
        token,
        user_id: user.id,
        username: user.username,
        role: user.role,
    }))
}

/// Session-start compatibility gate. Proceed and migrate answers are 200s;
/// rebuild and reject surface as `conflict_schema` with the action attached
/// so the client knows whether a rebuild recovers it.
async fn handshake(
    _user: AuthedUser,
    Json(request): Json<HandshakeRequest>,
) -> Response {
    let server = ServerSchema {
        version: schema::SCHEMA_VERSION,
        hash: schema::current_hash(),
    };
    let client = ClientSchema {
        version: request.schema_version,
        hash: request.schema_hash,
    };

    let decision = compat::evaluate(&client, &server);
    match &decision {
        GateDecision::Proceed { .. } | GateDecision::Migrate { .. } => {
            let migrations = match &decision {
                GateDecision::Migrate { steps } => {
                    steps.iter().map(|s| s.to_string()).collect()
                }
                _ => Vec::new(),
            };
            Json(HandshakeResponse {
                ok: true,
                action: decision.action(),
                version: server.version,
                hash: server.hash,
                migrations,
            })
            .into_response()
        }
        GateDecision::Rebuild | GateDecision::Reject => (
            StatusCode::CONFLICT,
            Json(json!({
                "ok": false,
                "code": "conflict_schema",
                "message": "client schema is incompatible with the server schema",
                "action": decision.action(),
                "version": server.version,
                "hash": server.hash,
            })),
        )
            .into_response(),
    }
}

async fn schema_descriptor(_user: AuthedUser) -> Json<SchemaResponse> {
    let snapshot = schema::snapshot();
    let hash = snapshot.hash();
    Json(SchemaResponse {
        version: snapshot.version,
        hash,
        tables: snapshot.tables,
    })
}

async fn sync_push(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<PushRequest>,
) -> SyncResult<Json<PushResponse>> {
    let _permit = acquire_sync_permit(&state)?;
    let response = with_deadline(&state, push::handle_push(&state, &user, request)).await?;
    Ok(Json(response))
}

async fn sync_pull(
    State(state): State<AppState>,
    _user: AuthedUser,
    Json(request): Json<PullRequest>,
) -> SyncResult<Json<PullResponse>> {
    let _permit = acquire_sync_permit(&state)?;
    let response = with_deadline(&state, pull::handle_pull(&state, request)).await?;
    Ok(Json(response))
}

fn acquire_sync_permit(
    state: &AppState,
) -> SyncResult<tokio::sync::OwnedSemaphorePermit> {
    state
        .sync_permits
        .clone()
        .try_acquire_owned()
        .map_err(|_| SyncError::RateLimited("too many concurrent sync requests".to_string()))
}

#[derive(Deserialize)]
struct ChangesQuery {
    status: Option<String>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct ChangesList {
    ok: bool,
    changes: Vec<ChangeRequest>,
}

async fn changes_list(
    State(state): State<AppState>,
    user: AuthedUser,
    Query(query): Query<ChangesQuery>,
) -> SyncResult<Json<ChangesList>> {
    user.require_reviewer()?;

    let status = query
        .status
        .as_deref()
        .map(|raw| {
            RequestStatus::from_str(raw)
                .map_err(|_| SyncError::validation(format!("unknown status {raw}")))
        })
        .transpose()?;
    let limit = query.limit.unwrap_or(200).clamp(1, 1_000);

    let changes = workflow::list(&state.pool, status, limit).await?;
    Ok(Json(ChangesList { ok: true, changes }))
}

#[derive(Serialize)]
struct ChangeDetail {
    ok: bool,
    change: ChangeRequest,
}

async fn changes_get(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> SyncResult<Json<ChangeDetail>> {
    user.require_reviewer()?;
    let change = workflow::get(&state.pool, id).await?;
    Ok(Json(ChangeDetail { ok: true, change }))
}

async fn changes_apply(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<DecisionRequest>,
) -> SyncResult<Json<DecisionResponse>> {
    let (status, decided_at) =
        with_deadline(&state, workflow::apply(&state.pool, request.id, &user)).await?;
    Ok(Json(DecisionResponse {
        ok: true,
        id: request.id,
        status,
        decided_at,
    }))
}

async fn changes_reject(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<DecisionRequest>,
) -> SyncResult<Json<DecisionResponse>> {
    let (status, decided_at) = with_deadline(
        &state,
        workflow::reject(&state.pool, request.id, &user, request.note.as_deref()),
    )
    .await?;
    Ok(Json(DecisionResponse {
        ok: true,
        id: request.id,
        status,
        decided_at,
    }))
}

#[derive(Deserialize)]
struct CreateUserRequest {
    username: String,
    password: String,
    role: String,
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Serialize)]
struct CreateUserResponse {
    ok: bool,
    user_id: Uuid,
}

async fn admin_create_user(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<CreateUserRequest>,
) -> SyncResult<Json<CreateUserResponse>> {
    user.require_superadmin()?;

    let role = Role::from_str(&request.role)
        .map_err(|_| SyncError::validation(format!("unknown role {}", request.role)))?;
    let user_id = auth::create_user(
        &state.pool,
        &request.username,
        &request.password,
        role,
        &request.permissions,
    )
    .await?;

    Ok(Json(CreateUserResponse { ok: true, user_id }))
}

#[derive(Deserialize)]
struct ReassignOwnerRequest {
    table: String,
    row_id: String,
    new_owner_id: Uuid,
}

/// Ownership transfer is an administrative action outside the sync path. It
/// re-emits the row's current post-image so replicas observe the handover,
/// and records it in the audit stream.
async fn admin_reassign_owner(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<ReassignOwnerRequest>,
) -> SyncResult<Json<serde_json::Value>> {
    user.require_superadmin()?;

    let table = tables::lookup(&request.table)
        .ok_or_else(|| SyncError::UnknownTable(request.table.clone()))?;

    let new_owner = sqlx::query("SELECT username FROM users WHERE id = $1 AND deleted_at IS NULL")
        .bind(request.new_owner_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("user {}", request.new_owner_id)))?;
    let new_owner_username: String = sqlx::Row::try_get(&new_owner, "username")?;

    let mut tx = state.pool.begin().await?;

    let Some((op, payload)) = change_log::last_entry(&mut tx, table.name, &request.row_id).await?
    else {
        return Err(SyncError::NotFound(format!(
            "{}/{} has never been synchronized",
            table.name, request.row_id
        )));
    };

    ownership::reassign_owner(
        &mut tx,
        table.name,
        &request.row_id,
        request.new_owner_id,
        &new_owner_username,
    )
    .await?;

    // The post-image is byte-identical, so the sink would skip it; append
    // directly so replicas observe the handover.
    let at = now_millis();
    change_log::append(&mut tx, table.name, &request.row_id, op, &payload, at).await?;

    let actor = user.as_actor();
    let audit = workflow::audit_row(
        &actor,
        "row_owner.reassigned",
        table.name,
        &request.row_id,
        json!({ "new_owner_id": request.new_owner_id, "new_owner_username": new_owner_username }),
        at,
    )?;
    sink::apply_in_tx(&mut tx, &actor, &[audit], &sink::SinkOptions::default()).await?;

    tx.commit().await?;
    Ok(Json(json!({ "ok": true })))
}
