//! Schema compatibility gate.
//!
//! Evaluated during session bootstrap, before any push or pull. The client
//! declares the schema version and server hash it last synced under; the gate
//! decides whether it may proceed, must run local migrations, must rebuild its
//! replica from scratch, or is ahead of the server and rejected outright.
//!
//! Migration transforms run on the client's local replica only. The server
//! side of the registry is just the step names, so the gate can tell a
//! migratable gap from an unmigratable one.

use crate::protocol::GateAction;

#[derive(Debug, Clone)]
pub struct ServerSchema {
    pub version: i32,
    pub hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClientSchema {
    pub version: Option<i32>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub from: i32,
    pub to: i32,
    pub name: &'static str,
}

/// Static migration registry. Each step advances exactly one version; the
/// chain from `from` to the current version exists iff every intermediate
/// step is present.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        from: 1,
        to: 2,
        name: "add-note-shares",
    },
    Migration {
        from: 2,
        to: 3,
        name: "attribute-def-sort-order",
    },
];

/// Ordered step names covering `from..to`, or `None` when the chain is broken.
pub fn chain(from: i32, to: i32) -> Option<Vec<&'static str>> {
    let mut steps = Vec::new();
    let mut at = from;
    while at < to {
        let step = MIGRATIONS.iter().find(|m| m.from == at)?;
        steps.push(step.name);
        at = step.to;
    }
    Some(steps)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Client may sync. `baseline` is set when the client had no recorded
    /// version and should store the current one.
    Proceed { baseline: bool },
    /// Client must run the named local migrations, then record the new
    /// version and hash.
    Migrate { steps: Vec<&'static str> },
    /// Client must rebuild its local store from a fresh pull.
    Rebuild,
    /// Client is ahead of the server; it must downgrade or the server must
    /// upgrade.
    Reject,
}

impl GateDecision {
    pub fn action(&self) -> GateAction {
        match self {
            GateDecision::Proceed { .. } => GateAction::Proceed,
            GateDecision::Migrate { .. } => GateAction::Migrate,
            GateDecision::Rebuild => GateAction::Rebuild,
            GateDecision::Reject => GateAction::Reject,
        }
    }
}

/// The §-decision table: one row per (version, hash) condition.
pub fn evaluate(client: &ClientSchema, server: &ServerSchema) -> GateDecision {
    let Some(client_version) = client.version else {
        return GateDecision::Proceed { baseline: true };
    };

    if client_version > server.version {
        return GateDecision::Reject;
    }

    if client_version < server.version {
        return match chain(client_version, server.version) {
            Some(steps) => GateDecision::Migrate { steps },
            None => GateDecision::Rebuild,
        };
    }

    match client.hash.as_deref() {
        Some(hash) if hash == server.hash => GateDecision::Proceed { baseline: false },
        _ => GateDecision::Rebuild,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn server() -> ServerSchema {
        ServerSchema {
            version: schema::SCHEMA_VERSION,
            hash: "cafebabe".to_string(),
        }
    }

    fn client(version: Option<i32>, hash: Option<&str>) -> ClientSchema {
        ClientSchema {
            version,
            hash: hash.map(str::to_string),
        }
    }

    #[test]
    fn unrecorded_version_is_a_baseline() {
        assert_eq!(
            evaluate(&client(None, None), &server()),
            GateDecision::Proceed { baseline: true }
        );
    }

    #[test]
    fn client_ahead_is_rejected() {
        assert_eq!(
            evaluate(&client(Some(schema::SCHEMA_VERSION + 1), Some("cafebabe")), &server()),
            GateDecision::Reject
        );
    }

    #[test]
    fn migratable_gap_yields_the_chain() {
        let decision = evaluate(&client(Some(1), Some("old")), &server());
        assert_eq!(
            decision,
            GateDecision::Migrate {
                steps: vec!["add-note-shares", "attribute-def-sort-order"]
            }
        );
    }

    #[test]
    fn unmigratable_gap_forces_rebuild() {
        // Version 0 predates the registry; no step covers 0 -> 1.
        assert_eq!(
            evaluate(&client(Some(0), Some("ancient")), &server()),
            GateDecision::Rebuild
        );
    }

    #[test]
    fn hash_drift_at_equal_versions_forces_rebuild() {
        assert_eq!(
            evaluate(
                &client(Some(schema::SCHEMA_VERSION), Some("deadbeef")),
                &server()
            ),
            GateDecision::Rebuild
        );
    }

    #[test]
    fn missing_hash_at_equal_versions_forces_rebuild() {
        assert_eq!(
            evaluate(&client(Some(schema::SCHEMA_VERSION), None), &server()),
            GateDecision::Rebuild
        );
    }

    #[test]
    fn matching_version_and_hash_proceeds() {
        assert_eq!(
            evaluate(
                &client(Some(schema::SCHEMA_VERSION), Some("cafebabe")),
                &server()
            ),
            GateDecision::Proceed { baseline: false }
        );
    }

    #[test]
    fn chain_is_ordered_and_bounded() {
        assert_eq!(chain(2, 3), Some(vec!["attribute-def-sort-order"]));
        assert_eq!(chain(3, 3), Some(vec![]));
        assert_eq!(chain(0, 3), None);
    }
}
