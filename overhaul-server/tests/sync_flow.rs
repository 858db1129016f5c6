//! End-to-end sync engine tests against a real postgres instance.
//!
//! These connect via DATABASE_URL and skip (with a log line) when it is not
//! set. Tests share one database and may run concurrently, so every test
//! works with freshly generated row ids and asserts relative to the log seq
//! observed before its own writes, never against absolute sequence numbers.

use std::collections::HashSet;

use overhaul_core::models::{now_millis, ChangeLogEntry, ChangeOp, RequestStatus, Role};
use overhaul_core::protocol::{PullRequest, PushRequest, TableBatch};
use overhaul_server::auth::{self, AuthedUser};
use overhaul_server::{change_log, cursors, database, pull, push, workflow, AppState, Config};
use serde_json::{json, Value};
use uuid::Uuid;

struct TestContext {
    state: AppState,
}

async fn setup() -> Option<TestContext> {
    if std::env::var("DATABASE_URL").is_err() {
        println!("skipping test: DATABASE_URL not set");
        return None;
    }

    let config = Config::from_env();
    let pool = database::connect(&config).await.expect("connect");
    database::run_migrations(&pool).await.expect("migrations");

    Some(TestContext {
        state: AppState::new(pool, config),
    })
}

impl TestContext {
    async fn create_user(&self, role: Role, grants: &[&str]) -> AuthedUser {
        let username = format!("{role}-{}", Uuid::new_v4().simple());
        let grants: Vec<String> = grants.iter().map(|s| s.to_string()).collect();
        let id = auth::create_user(&self.state.pool, &username, "shop-floor-pw", role, &grants)
            .await
            .expect("create user");
        AuthedUser {
            id,
            username,
            role,
            permissions: grants.into_iter().collect(),
        }
    }

    async fn baseline(&self) -> i64 {
        change_log::max_seq(&self.state.pool).await.expect("max_seq")
    }

    async fn entries_for(&self, baseline: i64, row_id: &str) -> Vec<ChangeLogEntry> {
        change_log::range(&self.state.pool, baseline, 10_000)
            .await
            .expect("range")
            .into_iter()
            .filter(|e| e.row_id == row_id)
            .collect()
    }

    async fn pull(&self, client_id: &str, since_seq: i64) -> overhaul_core::protocol::PullResponse {
        pull::handle_pull(
            &self.state,
            PullRequest {
                client_id: client_id.to_string(),
                since_seq: Some(since_seq),
                limit: None,
            },
        )
        .await
        .expect("pull")
    }
}

fn upsert_push(client_id: &str, table: &str, rows: Vec<Value>) -> PushRequest {
    PushRequest {
        client_id: client_id.to_string(),
        upserts: vec![TableBatch {
            table: table.to_string(),
            rows,
        }],
        deletes: Vec::new(),
    }
}

fn entity_type_row(id: &str, code: &str, name: &str, stamp: i64) -> Value {
    json!({
        "id": id,
        "code": code,
        "name": name,
        "created_at": stamp,
        "updated_at": stamp,
        "deleted_at": null,
    })
}

#[tokio::test]
async fn create_then_pull_round_trips_the_post_image() {
    let Some(ctx) = setup().await else { return };
    let owner = ctx.create_user(Role::Master, &["catalog.edit"]).await;

    let baseline = ctx.baseline().await;
    let row_id = Uuid::new_v4().to_string();
    let code = format!("engine-{}", Uuid::new_v4().simple());
    let stamp = 1_700_000_000_000i64;

    let response = push::handle_push(
        &ctx.state,
        &owner,
        upsert_push("c1", "entity_types", vec![entity_type_row(&row_id, &code, "Engine", stamp)]),
    )
    .await
    .expect("push");

    assert_eq!(response.applied, 1);
    assert!(response.queued.is_empty());
    assert!(response.errors.is_empty(), "{:?}", response.errors);

    let pulled = ctx.pull("c2", baseline).await;
    let entry = pulled
        .entries
        .iter()
        .find(|e| e.row_id == row_id)
        .expect("entry for pushed row");

    assert_eq!(entry.op, ChangeOp::Upsert);
    assert_eq!(entry.table, "entity_types");
    assert_eq!(entry.payload["code"], json!(code));
    assert_eq!(entry.payload["name"], json!("Engine"));
    assert_eq!(entry.payload["created_at"], json!(stamp));
    assert_eq!(entry.payload["updated_at"], json!(stamp));
    assert_eq!(entry.payload["deleted_at"], Value::Null);
    assert_eq!(entry.payload["sync_status"], json!("synced"));
    assert!(entry.payload.get("last_server_seq").is_none());

    // Cursor advancement: pulling from next_seq returns nothing for this row.
    let again = ctx.pull("c2", pulled.next_seq).await;
    assert!(again.entries.iter().all(|e| e.row_id != row_id));
}

#[tokio::test]
async fn pulled_batches_are_strictly_increasing() {
    let Some(ctx) = setup().await else { return };
    let owner = ctx.create_user(Role::Master, &["catalog.edit"]).await;

    let baseline = ctx.baseline().await;
    let stamp = now_millis();
    let rows: Vec<Value> = (0..5)
        .map(|i| {
            entity_type_row(
                &Uuid::new_v4().to_string(),
                &format!("part-{}", Uuid::new_v4().simple()),
                "Part",
                stamp + i,
            )
        })
        .collect();

    push::handle_push(&ctx.state, &owner, upsert_push("c1", "entity_types", rows))
        .await
        .expect("push");

    // Walk the log in batches of 2 from the baseline.
    let mut cursor = baseline;
    let mut last_seen = baseline;
    loop {
        let batch = pull::handle_pull(
            &ctx.state,
            PullRequest {
                client_id: "c-walk".to_string(),
                since_seq: Some(cursor),
                limit: Some(2),
            },
        )
        .await
        .expect("pull");

        for entry in &batch.entries {
            assert!(entry.seq > last_seen, "seq must be strictly increasing");
            last_seen = entry.seq;
        }
        if !batch.has_more {
            break;
        }
        cursor = batch.next_seq;
    }
}

#[tokio::test]
async fn replaying_a_push_appends_nothing() {
    let Some(ctx) = setup().await else { return };
    let owner = ctx.create_user(Role::Master, &["catalog.edit"]).await;

    let baseline = ctx.baseline().await;
    let row_id = Uuid::new_v4().to_string();
    let request = upsert_push(
        "c1",
        "entity_types",
        vec![entity_type_row(
            &row_id,
            &format!("engine-{}", Uuid::new_v4().simple()),
            "Engine",
            1_700_000_000_000,
        )],
    );

    let first = push::handle_push(&ctx.state, &owner, request.clone())
        .await
        .expect("first push");
    assert_eq!(first.applied, 1);

    let replay = push::handle_push(&ctx.state, &owner, request)
        .await
        .expect("replay push");
    assert_eq!(replay.applied, 0);
    assert!(replay.errors.is_empty());

    assert_eq!(ctx.entries_for(baseline, &row_id).await.len(), 1);
}

#[tokio::test]
async fn soft_delete_emits_a_tombstone() {
    let Some(ctx) = setup().await else { return };
    let owner = ctx.create_user(Role::Master, &["catalog.edit"]).await;

    let baseline = ctx.baseline().await;
    let row_id = Uuid::new_v4().to_string();
    let code = format!("engine-{}", Uuid::new_v4().simple());

    push::handle_push(
        &ctx.state,
        &owner,
        upsert_push(
            "c1",
            "entity_types",
            vec![entity_type_row(&row_id, &code, "Engine", 1_700_000_000_000)],
        ),
    )
    .await
    .expect("create");

    let mut tombstone = entity_type_row(&row_id, &code, "Engine", 1_700_000_000_000);
    tombstone["updated_at"] = json!(1_700_000_001_000i64);
    tombstone["deleted_at"] = json!(1_700_000_001_000i64);

    let response = push::handle_push(
        &ctx.state,
        &owner,
        upsert_push("c1", "entity_types", vec![tombstone]),
    )
    .await
    .expect("delete");
    assert_eq!(response.applied, 1);

    let entries = ctx.entries_for(baseline, &row_id).await;
    let last = entries.last().expect("tombstone entry");
    assert_eq!(last.op, ChangeOp::Delete);
    assert_eq!(last.payload["deleted_at"], json!(1_700_000_001_000i64));

    // The row stays addressable in the projection.
    let row = sqlx::query("SELECT deleted_at FROM entity_types WHERE id = $1")
        .bind(&row_id)
        .fetch_one(&ctx.state.pool)
        .await
        .expect("projection row");
    let deleted_at: Option<i64> = sqlx::Row::try_get(&row, "deleted_at").unwrap();
    assert_eq!(deleted_at, Some(1_700_000_001_000));
}

#[tokio::test]
async fn stale_writes_are_skipped() {
    let Some(ctx) = setup().await else { return };
    let owner = ctx.create_user(Role::Master, &["catalog.edit"]).await;

    let baseline = ctx.baseline().await;
    let row_id = Uuid::new_v4().to_string();
    let code = format!("engine-{}", Uuid::new_v4().simple());

    push::handle_push(
        &ctx.state,
        &owner,
        upsert_push(
            "c1",
            "entity_types",
            vec![entity_type_row(&row_id, &code, "Fresh", 2_000)],
        ),
    )
    .await
    .expect("fresh write");

    let stale = push::handle_push(
        &ctx.state,
        &owner,
        upsert_push(
            "c1",
            "entity_types",
            vec![entity_type_row(&row_id, &code, "Stale", 1_000)],
        ),
    )
    .await
    .expect("stale write");
    assert_eq!(stale.applied, 0);

    let entries = ctx.entries_for(baseline, &row_id).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload["name"], json!("Fresh"));
}

#[tokio::test]
async fn foreign_owned_rows_queue_for_approval() {
    let Some(ctx) = setup().await else { return };
    let record_owner = ctx.create_user(Role::Master, &["catalog.edit"]).await;
    let outsider = ctx.create_user(Role::Master, &["catalog.edit"]).await;
    let reviewer = ctx
        .create_user(Role::Admin, &["catalog.edit", "catalog.approve"])
        .await;

    let baseline = ctx.baseline().await;
    let row_id = Uuid::new_v4().to_string();
    let code = format!("engine-{}", Uuid::new_v4().simple());

    push::handle_push(
        &ctx.state,
        &record_owner,
        upsert_push(
            "c-owner",
            "entity_types",
            vec![entity_type_row(&row_id, &code, "Engine", 1_000)],
        ),
    )
    .await
    .expect("owner create");

    let edited = entity_type_row(&row_id, &code, "Engine (overhauled)", 2_000);
    let response = push::handle_push(
        &ctx.state,
        &outsider,
        upsert_push("c-outsider", "entity_types", vec![edited.clone()]),
    )
    .await
    .expect("outsider push");

    assert_eq!(response.applied, 0);
    assert_eq!(response.queued.len(), 1);
    let request_id = response.queued[0].change_request_id;

    // No projection mutation and no new log entry yet.
    assert_eq!(ctx.entries_for(baseline, &row_id).await.len(), 1);

    // A replay of the same edit reuses the pending request.
    let replay = push::handle_push(
        &ctx.state,
        &outsider,
        upsert_push("c-outsider", "entity_types", vec![edited]),
    )
    .await
    .expect("outsider replay");
    assert_eq!(replay.queued.len(), 1);
    assert_eq!(replay.queued[0].change_request_id, request_id);

    let stored = workflow::get(&ctx.state.pool, request_id).await.expect("request");
    assert_eq!(stored.status, RequestStatus::Pending);
    assert_eq!(stored.record_owner_id, Some(record_owner.id));
    assert_eq!(stored.change_author_id, outsider.id);
    assert!(stored.before_json.is_some());

    let (status, decided_at) = workflow::apply(&ctx.state.pool, request_id, &reviewer)
        .await
        .expect("apply");
    assert_eq!(status, RequestStatus::Applied);

    let entries = ctx.entries_for(baseline, &row_id).await;
    let applied_entry = entries.last().expect("applied entry");
    assert_eq!(applied_entry.payload["name"], json!("Engine (overhauled)"));
    assert_eq!(applied_entry.created_at, decided_at);

    // Deciding twice is rejected.
    assert!(workflow::apply(&ctx.state.pool, request_id, &reviewer)
        .await
        .is_err());
}

#[tokio::test]
async fn applying_a_request_always_logs_even_when_content_already_landed() {
    let Some(ctx) = setup().await else { return };
    let record_owner = ctx.create_user(Role::Master, &["catalog.edit"]).await;
    let outsider = ctx.create_user(Role::Master, &["catalog.edit"]).await;
    let reviewer = ctx.create_user(Role::Admin, &["catalog.approve"]).await;

    let baseline = ctx.baseline().await;
    let row_id = Uuid::new_v4().to_string();
    let code = format!("engine-{}", Uuid::new_v4().simple());

    push::handle_push(
        &ctx.state,
        &record_owner,
        upsert_push(
            "c-owner",
            "entity_types",
            vec![entity_type_row(&row_id, &code, "Engine", 1_000)],
        ),
    )
    .await
    .expect("owner create");

    let edit = entity_type_row(&row_id, &code, "Engine (reworked)", 2_000);
    let response = push::handle_push(
        &ctx.state,
        &outsider,
        upsert_push("c-outsider", "entity_types", vec![edit.clone()]),
    )
    .await
    .expect("outsider push");
    let request_id = response.queued[0].change_request_id;

    // The owner independently pushes the exact same content while the
    // request is still pending.
    let owner_push = push::handle_push(
        &ctx.state,
        &record_owner,
        upsert_push("c-owner", "entity_types", vec![edit]),
    )
    .await
    .expect("owner push of identical content");
    assert_eq!(owner_push.applied, 1);
    assert_eq!(ctx.entries_for(baseline, &row_id).await.len(), 2);

    // Applying the request must still emit its own entry at decision time,
    // even though the projection already matches after_json.
    let (status, decided_at) = workflow::apply(&ctx.state.pool, request_id, &reviewer)
        .await
        .expect("apply");
    assert_eq!(status, RequestStatus::Applied);

    let entries = ctx.entries_for(baseline, &row_id).await;
    assert_eq!(entries.len(), 3);
    let applied_entry = entries.last().unwrap();
    assert_eq!(applied_entry.created_at, decided_at);
    assert_eq!(applied_entry.op, ChangeOp::Upsert);
    assert_eq!(applied_entry.payload["name"], json!("Engine (reworked)"));
}

#[tokio::test]
async fn rejected_requests_leave_the_projection_untouched() {
    let Some(ctx) = setup().await else { return };
    let record_owner = ctx.create_user(Role::Master, &["catalog.edit"]).await;
    let outsider = ctx.create_user(Role::Master, &["catalog.edit"]).await;
    let reviewer = ctx.create_user(Role::Admin, &["catalog.approve"]).await;

    let baseline = ctx.baseline().await;
    let row_id = Uuid::new_v4().to_string();
    let code = format!("engine-{}", Uuid::new_v4().simple());

    push::handle_push(
        &ctx.state,
        &record_owner,
        upsert_push(
            "c-owner",
            "entity_types",
            vec![entity_type_row(&row_id, &code, "Engine", 1_000)],
        ),
    )
    .await
    .expect("owner create");

    let response = push::handle_push(
        &ctx.state,
        &outsider,
        upsert_push(
            "c-outsider",
            "entity_types",
            vec![entity_type_row(&row_id, &code, "Vandalized", 2_000)],
        ),
    )
    .await
    .expect("outsider push");
    let request_id = response.queued[0].change_request_id;

    let (status, _) = workflow::reject(
        &ctx.state.pool,
        request_id,
        &reviewer,
        Some("not an approved rename"),
    )
    .await
    .expect("reject");
    assert_eq!(status, RequestStatus::Rejected);

    let entries = ctx.entries_for(baseline, &row_id).await;
    assert_eq!(entries.last().unwrap().payload["name"], json!("Engine"));

    let stored = workflow::get(&ctx.state.pool, request_id).await.expect("request");
    assert_eq!(stored.status, RequestStatus::Rejected);
    assert_eq!(stored.note.as_deref(), Some("not an approved rename"));
    assert_eq!(stored.decided_by_id, Some(reviewer.id));
}

#[tokio::test]
async fn superseded_entries_compact_within_a_pull_batch() {
    let Some(ctx) = setup().await else { return };
    let owner = ctx
        .create_user(Role::Master, &["catalog.edit"])
        .await;

    let baseline = ctx.baseline().await;

    // Seed the attribute chain the value row hangs off.
    let type_id = Uuid::new_v4().to_string();
    let entity_id = Uuid::new_v4().to_string();
    let def_id = Uuid::new_v4().to_string();
    let value_id = Uuid::new_v4().to_string();

    push::handle_push(
        &ctx.state,
        &owner,
        PushRequest {
            client_id: "c1".to_string(),
            upserts: vec![
                TableBatch {
                    table: "entity_types".to_string(),
                    rows: vec![entity_type_row(
                        &type_id,
                        &format!("engine-{}", Uuid::new_v4().simple()),
                        "Engine",
                        1,
                    )],
                },
                TableBatch {
                    table: "entities".to_string(),
                    rows: vec![json!({
                        "id": entity_id, "type_id": type_id,
                        "created_at": 1, "updated_at": 1, "deleted_at": null,
                    })],
                },
                TableBatch {
                    table: "attribute_defs".to_string(),
                    rows: vec![json!({
                        "id": def_id, "type_id": type_id,
                        "code": "displacement", "name": "Displacement", "data_type": "number",
                        "is_required": false, "sort_order": 1, "meta_json": null,
                        "created_at": 1, "updated_at": 1, "deleted_at": null,
                    })],
                },
            ],
            deletes: Vec::new(),
        },
    )
    .await
    .expect("seed chain");

    for (stamp, liters) in [(10i64, "12.0"), (11, "12.5"), (12, "13.0")] {
        let response = push::handle_push(
            &ctx.state,
            &owner,
            upsert_push(
                "c1",
                "attribute_values",
                vec![json!({
                    "id": value_id, "entity_id": entity_id, "attribute_def_id": def_id,
                    "value_json": liters,
                    "created_at": 10, "updated_at": stamp, "deleted_at": null,
                })],
            ),
        )
        .await
        .expect("value push");
        assert_eq!(response.applied, 1);
    }

    let pulled = ctx.pull("c2", baseline).await;
    let value_entries: Vec<_> = pulled
        .entries
        .iter()
        .filter(|e| e.row_id == value_id)
        .collect();

    assert_eq!(value_entries.len(), 1, "superseded entries must compact");
    assert_eq!(value_entries[0].payload["updated_at"], json!(12));
    assert_eq!(value_entries[0].payload["value_json"], json!("13.0"));
}

#[tokio::test]
async fn permission_failures_are_per_row() {
    let Some(ctx) = setup().await else { return };
    let mechanic = ctx.create_user(Role::User, &[]).await;

    let note_id = Uuid::new_v4().to_string();
    let response = push::handle_push(
        &ctx.state,
        &mechanic,
        PushRequest {
            client_id: "c-mechanic".to_string(),
            upserts: vec![
                TableBatch {
                    table: "entity_types".to_string(),
                    rows: vec![entity_type_row(
                        &Uuid::new_v4().to_string(),
                        &format!("sneaky-{}", Uuid::new_v4().simple()),
                        "Sneaky",
                        1,
                    )],
                },
                TableBatch {
                    table: "notes".to_string(),
                    rows: vec![json!({
                        "id": note_id,
                        "owner_id": mechanic.id.to_string(),
                        "owner_username": mechanic.username.clone(),
                        "title": "torque specs",
                        "body": "check the manual",
                        "created_at": 1, "updated_at": 1, "deleted_at": null,
                    })],
                },
            ],
            deletes: Vec::new(),
        },
    )
    .await
    .expect("push");

    assert_eq!(response.applied, 1, "the note should land");
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].table, "entity_types");
    assert_eq!(
        response.errors[0].code,
        overhaul_core::protocol::ErrorCode::Forbidden
    );
}

#[tokio::test]
async fn unknown_tables_and_malformed_rows_error_without_aborting() {
    let Some(ctx) = setup().await else { return };
    let owner = ctx.create_user(Role::Master, &["catalog.edit"]).await;

    let good_id = Uuid::new_v4().to_string();
    let response = push::handle_push(
        &ctx.state,
        &owner,
        PushRequest {
            client_id: "c1".to_string(),
            upserts: vec![
                TableBatch {
                    table: "widgets".to_string(),
                    rows: vec![json!({"id": "w1"})],
                },
                TableBatch {
                    table: "entity_types".to_string(),
                    rows: vec![
                        json!({"id": "", "code": "x", "name": "X", "created_at": 1, "updated_at": 1}),
                        entity_type_row(
                            &good_id,
                            &format!("good-{}", Uuid::new_v4().simple()),
                            "Good",
                            1,
                        ),
                    ],
                },
            ],
            deletes: Vec::new(),
        },
    )
    .await
    .expect("push");

    assert_eq!(response.applied, 1);
    let codes: HashSet<_> = response.errors.iter().map(|e| e.code).collect();
    assert!(codes.contains(&overhaul_core::protocol::ErrorCode::Validation));
    assert_eq!(response.errors.len(), 2);
}

#[tokio::test]
async fn cursors_advance_with_successful_syncs() {
    let Some(ctx) = setup().await else { return };
    let owner = ctx.create_user(Role::Master, &["catalog.edit"]).await;

    let client_id = format!("cursor-client-{}", Uuid::new_v4().simple());
    let baseline = ctx.baseline().await;

    push::handle_push(
        &ctx.state,
        &owner,
        upsert_push(
            &client_id,
            "entity_types",
            vec![entity_type_row(
                &Uuid::new_v4().to_string(),
                &format!("engine-{}", Uuid::new_v4().simple()),
                "Engine",
                1,
            )],
        ),
    )
    .await
    .expect("push");

    let after_push = cursors::get(&ctx.state.pool, &client_id)
        .await
        .expect("cursor fetch")
        .expect("cursor row auto-created");
    assert!(after_push.last_pushed_at.is_some());
    assert!(after_push.last_pulled_at.is_none());

    let pulled = ctx.pull(&client_id, baseline).await;
    let after_pull = cursors::get(&ctx.state.pool, &client_id)
        .await
        .expect("cursor fetch")
        .expect("cursor row");
    assert_eq!(after_pull.last_pulled_server_seq, pulled.next_seq);
    assert!(after_pull.last_pulled_at.is_some());

    // Invariant: the cursor never runs ahead of the committed log.
    let max_seq = change_log::max_seq(&ctx.state.pool).await.unwrap();
    assert!(after_pull.last_pulled_server_seq <= max_seq);
}
