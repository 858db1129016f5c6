use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Current time as Unix milliseconds, the timestamp unit used everywhere in
/// the sync protocol and the lifecycle columns.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Operation recorded in the change log for one row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeOp {
    Upsert,
    Delete,
}

/// One record of the monotonic append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub seq: i64,
    pub table: String,
    pub row_id: String,
    pub op: ChangeOp,
    pub payload: Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Applied,
    Rejected,
}

/// A row-level edit awaiting approval by a privileged reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: Uuid,
    pub status: RequestStatus,
    pub table_name: String,
    pub row_id: String,
    pub root_entity_id: Option<String>,
    pub before_json: Option<Value>,
    pub after_json: Value,
    pub record_owner_id: Option<Uuid>,
    pub record_owner_username: Option<String>,
    pub change_author_id: Uuid,
    pub change_author_username: String,
    pub note: Option<String>,
    pub created_at: i64,
    pub decided_at: Option<i64>,
    pub decided_by_id: Option<Uuid>,
    pub decided_by_username: Option<String>,
}

/// First-writer owner of a `(table, row)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowOwner {
    pub id: Uuid,
    pub table_name: String,
    pub row_id: String,
    pub owner_user_id: Uuid,
    pub owner_username: String,
}

/// Per-client sync cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub client_id: String,
    pub last_pulled_server_seq: i64,
    pub last_pushed_at: Option<i64>,
    pub last_pulled_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Superadmin,
    Admin,
    Master,
    User,
}

impl Role {
    /// Admin tier accounts may hold the global edit grant that bypasses the
    /// approval queue.
    pub fn is_admin_tier(self) -> bool {
        matches!(self, Role::Superadmin | Role::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn change_op_round_trips_through_sql_text() {
        assert_eq!(ChangeOp::Upsert.to_string(), "upsert");
        assert_eq!(ChangeOp::from_str("delete").unwrap(), ChangeOp::Delete);
        assert!(ChangeOp::from_str("truncate").is_err());
    }

    #[test]
    fn request_status_round_trips_through_sql_text() {
        assert_eq!(RequestStatus::Pending.to_string(), "pending");
        assert_eq!(
            RequestStatus::from_str("rejected").unwrap(),
            RequestStatus::Rejected
        );
    }

    #[test]
    fn role_tiers() {
        assert!(Role::Superadmin.is_admin_tier());
        assert!(Role::Admin.is_admin_tier());
        assert!(!Role::Master.is_admin_tier());
        assert!(!Role::User.is_admin_tier());
    }
}
