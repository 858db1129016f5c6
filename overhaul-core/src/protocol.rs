//! Wire types for the JSON-over-HTTP sync protocol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;
use uuid::Uuid;

use crate::models::ChangeLogEntry;
use crate::schema::TableSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    AuthRequired,
    Forbidden,
    Validation,
    ConflictSchema,
    NotFound,
    RateLimited,
    Internal,
}

/// `POST /sync/push` request body. Rows are full post-images keyed by
/// lower-snake-case column names, exactly as emitted on pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub client_id: String,
    #[serde(default)]
    pub upserts: Vec<TableBatch>,
    #[serde(default)]
    pub deletes: Vec<TableBatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableBatch {
    pub table: String,
    pub rows: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub ok: bool,
    /// Number of change log entries the push appended.
    pub applied: u64,
    pub queued: Vec<QueuedRow>,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRow {
    pub table: String,
    pub row_id: String,
    pub change_request_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowError {
    pub table: String,
    pub row_id: String,
    pub code: ErrorCode,
    pub message: String,
}

/// `POST /sync/pull` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub client_id: String,
    #[serde(default)]
    pub since_seq: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub ok: bool,
    pub entries: Vec<ChangeLogEntry>,
    pub next_seq: i64,
    pub has_more: bool,
}

/// `GET /sync/schema` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaResponse {
    pub version: i32,
    pub hash: String,
    pub tables: BTreeMap<String, TableSchema>,
}

/// `POST /sync/handshake` request body: the client-declared schema state
/// evaluated by the compatibility gate before any push or pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub client_id: String,
    #[serde(default)]
    pub schema_version: Option<i32>,
    #[serde(default)]
    pub schema_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GateAction {
    Proceed,
    Migrate,
    Rebuild,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub ok: bool,
    pub action: GateAction,
    pub version: i32,
    pub hash: String,
    /// Ordered migration step names for `action = migrate`, empty otherwise.
    #[serde(default)]
    pub migrations: Vec<String>,
}

/// `POST /changes/apply` and `POST /changes/reject` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub id: Uuid,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub ok: bool,
    pub id: Uuid,
    pub status: crate::models::RequestStatus,
    pub decided_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_request_tolerates_missing_sections() {
        let req: PushRequest =
            serde_json::from_value(json!({"client_id": "c1"})).unwrap();
        assert!(req.upserts.is_empty());
        assert!(req.deletes.is_empty());
    }

    #[test]
    fn error_codes_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(ErrorCode::ConflictSchema).unwrap(),
            json!("conflict_schema")
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::RateLimited).unwrap(),
            json!("rate_limited")
        );
    }

    #[test]
    fn gate_actions_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(GateAction::Rebuild).unwrap(),
            json!("rebuild")
        );
    }

    #[test]
    fn pull_request_defaults() {
        let req: PullRequest =
            serde_json::from_value(json!({"client_id": "c2"})).unwrap();
        assert_eq!(req.since_seq, None);
        assert_eq!(req.limit, None);
    }
}
