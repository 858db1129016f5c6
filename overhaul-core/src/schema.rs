//! Canonical snapshot and stable hash of the synchronized table set.
//!
//! The snapshot is what `GET /sync/schema` advertises and what the
//! compatibility gate compares against. Hash stability only holds over the
//! normalized form: columns sorted by name, foreign keys and unique
//! constraints sorted lexicographically, tables keyed by name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tables::{self, TableDef};

/// Bumped whenever the synchronized table set changes shape. The client-side
/// migration registry in [`crate::compat`] must cover the gap from any prior
/// version that is still migratable.
pub const SCHEMA_VERSION: i32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ColumnSchema {
    pub name: String,
    pub not_null: bool,
    pub data_type: String,
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ForeignKeySchema {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct UniqueSchema {
    pub columns: Vec<String>,
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
    pub foreign_keys: Vec<ForeignKeySchema>,
    pub unique_constraints: Vec<UniqueSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaSnapshot {
    pub version: i32,
    pub tables: BTreeMap<String, TableSchema>,
}

impl TableSchema {
    fn from_def(def: &TableDef) -> Self {
        Self {
            columns: def
                .columns
                .iter()
                .map(|c| ColumnSchema {
                    name: c.name.to_string(),
                    not_null: c.not_null,
                    data_type: c.ty.sql_name().to_string(),
                    default: c.default.map(str::to_string),
                })
                .collect(),
            foreign_keys: def
                .foreign_keys
                .iter()
                .map(|fk| ForeignKeySchema {
                    column: fk.column.to_string(),
                    references_table: fk.references_table.to_string(),
                    references_column: fk.references_column.to_string(),
                })
                .collect(),
            unique_constraints: def
                .uniques
                .iter()
                .map(|u| UniqueSchema {
                    columns: u.columns.iter().map(|c| c.to_string()).collect(),
                    primary: u.primary,
                })
                .collect(),
        }
    }

    fn normalize(&mut self) {
        self.columns.sort();
        self.foreign_keys.sort();
        self.unique_constraints.sort();
    }
}

impl SchemaSnapshot {
    /// Sort every list so that the hash does not depend on declaration order.
    pub fn normalize(&mut self) {
        for table in self.tables.values_mut() {
            table.normalize();
        }
    }

    /// SHA-256 over the canonical JSON encoding, lowercase hex.
    pub fn hash(&self) -> String {
        let mut normalized = self.clone();
        normalized.normalize();
        let encoded =
            serde_json::to_vec(&normalized).expect("schema snapshot serialization is infallible");
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        format!("{:x}", hasher.finalize())
    }
}

/// Snapshot of the current synchronized table set, already normalized.
pub fn snapshot() -> SchemaSnapshot {
    let mut snapshot = SchemaSnapshot {
        version: SCHEMA_VERSION,
        tables: tables::SYNC_TABLES
            .iter()
            .map(|def| (def.name.to_string(), TableSchema::from_def(def)))
            .collect(),
    };
    snapshot.normalize();
    snapshot
}

/// Hash of the current synchronized table set.
pub fn current_hash() -> String {
    snapshot().hash()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_across_calls() {
        assert_eq!(snapshot().hash(), snapshot().hash());
        assert_eq!(current_hash().len(), 64);
    }

    #[test]
    fn hash_ignores_declaration_order() {
        let reference = snapshot();

        let mut shuffled = snapshot();
        for table in shuffled.tables.values_mut() {
            table.columns.reverse();
            table.foreign_keys.reverse();
            table.unique_constraints.reverse();
        }

        assert_eq!(reference.hash(), shuffled.hash());
    }

    #[test]
    fn hash_tracks_structural_changes() {
        let reference = snapshot();

        let mut widened = snapshot();
        widened
            .tables
            .get_mut("entities")
            .unwrap()
            .columns
            .push(ColumnSchema {
                name: "serial_number".into(),
                not_null: false,
                data_type: "text".into(),
                default: None,
            });
        assert_ne!(reference.hash(), widened.hash());

        let mut retyped = snapshot();
        retyped
            .tables
            .get_mut("operations")
            .unwrap()
            .columns
            .iter_mut()
            .find(|c| c.name == "note")
            .unwrap()
            .not_null = true;
        assert_ne!(reference.hash(), retyped.hash());
    }

    #[test]
    fn snapshot_covers_the_whole_sync_set() {
        let snapshot = snapshot();
        assert_eq!(snapshot.tables.len(), tables::SYNC_TABLES.len());
        assert!(snapshot.tables.contains_key("attribute_values"));
        assert!(snapshot.tables.contains_key("user_presence"));
    }
}
