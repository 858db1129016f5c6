//! Static registry of the synchronized table set.
//!
//! The registry is the single source of truth for the projection schema: the
//! change sink builds its upsert statements from it, payload validation checks
//! incoming rows against it, and the schema descriptor hashes it. Adding a
//! synchronized table means adding one `TableDef` here plus its migration.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    BigInt,
    Bool,
    Json,
}

impl ColumnType {
    /// Postgres type name, as advertised in the schema descriptor.
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::BigInt => "bigint",
            ColumnType::Bool => "boolean",
            ColumnType::Json => "jsonb",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub not_null: bool,
    pub default: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references_table: &'static str,
    pub references_column: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct UniqueConstraint {
    pub columns: &'static [&'static str],
    pub primary: bool,
}

/// Permission class of a synchronized table. Catalog and Operations tables
/// require an explicit grant to push; Personal and Diagnostics tables are open
/// to any authenticated user, with row ownership routing foreign edits into
/// the approval queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    Catalog,
    Operations,
    Personal,
    Diagnostics,
}

#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub foreign_keys: &'static [ForeignKey],
    pub uniques: &'static [UniqueConstraint],
    pub access: AccessClass,
    /// Column naming the entity a change request should be filed under.
    pub root_entity_column: Option<&'static str>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&'static ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Permission code required to push rows of this table, if any.
    pub fn push_permission(&self) -> Option<&'static str> {
        match self.access {
            AccessClass::Catalog => Some("catalog.edit"),
            AccessClass::Operations => Some("operations.edit"),
            AccessClass::Personal | AccessClass::Diagnostics => None,
        }
    }

    /// Permission code required to decide change requests on this table.
    /// Review authority is scoped the same way push authority is: the gated
    /// classes carry their own approve code, everything else falls under the
    /// generic one.
    pub fn review_permission(&self) -> &'static str {
        match self.access {
            AccessClass::Catalog => "catalog.approve",
            AccessClass::Operations => "operations.approve",
            AccessClass::Personal | AccessClass::Diagnostics => "changes.approve",
        }
    }
}

/// Every review permission code; checked where review authority matters
/// without a specific table in hand (listing the queue).
pub const REVIEW_PERMISSIONS: &[&str] =
    &["catalog.approve", "operations.approve", "changes.approve"];

const fn col(name: &'static str, ty: ColumnType, not_null: bool) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        not_null,
        default: None,
    }
}

const ID: ColumnDef = col("id", ColumnType::Text, true);
const CREATED_AT: ColumnDef = col("created_at", ColumnType::BigInt, true);
const UPDATED_AT: ColumnDef = col("updated_at", ColumnType::BigInt, true);
const DELETED_AT: ColumnDef = col("deleted_at", ColumnType::BigInt, false);
const SYNC_STATUS: ColumnDef = ColumnDef {
    name: "sync_status",
    ty: ColumnType::Text,
    not_null: true,
    default: Some("'synced'"),
};

const PK: UniqueConstraint = UniqueConstraint {
    columns: &["id"],
    primary: true,
};

pub const ENTITY_TYPES: TableDef = TableDef {
    name: "entity_types",
    columns: &[
        ID,
        col("code", ColumnType::Text, true),
        col("name", ColumnType::Text, true),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[],
    uniques: &[
        PK,
        UniqueConstraint {
            columns: &["code"],
            primary: false,
        },
    ],
    access: AccessClass::Catalog,
    root_entity_column: None,
};

pub const ENTITIES: TableDef = TableDef {
    name: "entities",
    columns: &[
        ID,
        col("type_id", ColumnType::Text, true),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[ForeignKey {
        column: "type_id",
        references_table: "entity_types",
        references_column: "id",
    }],
    uniques: &[PK],
    access: AccessClass::Catalog,
    root_entity_column: Some("id"),
};

pub const ATTRIBUTE_DEFS: TableDef = TableDef {
    name: "attribute_defs",
    columns: &[
        ID,
        col("type_id", ColumnType::Text, true),
        col("code", ColumnType::Text, true),
        col("name", ColumnType::Text, true),
        col("data_type", ColumnType::Text, true),
        col("is_required", ColumnType::Bool, true),
        col("sort_order", ColumnType::BigInt, true),
        col("meta_json", ColumnType::Json, false),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[ForeignKey {
        column: "type_id",
        references_table: "entity_types",
        references_column: "id",
    }],
    uniques: &[
        PK,
        UniqueConstraint {
            columns: &["type_id", "code"],
            primary: false,
        },
    ],
    access: AccessClass::Catalog,
    root_entity_column: None,
};

pub const ATTRIBUTE_VALUES: TableDef = TableDef {
    name: "attribute_values",
    columns: &[
        ID,
        col("entity_id", ColumnType::Text, true),
        col("attribute_def_id", ColumnType::Text, true),
        col("value_json", ColumnType::Json, false),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[
        ForeignKey {
            column: "entity_id",
            references_table: "entities",
            references_column: "id",
        },
        ForeignKey {
            column: "attribute_def_id",
            references_table: "attribute_defs",
            references_column: "id",
        },
    ],
    uniques: &[
        PK,
        UniqueConstraint {
            columns: &["entity_id", "attribute_def_id"],
            primary: false,
        },
    ],
    access: AccessClass::Catalog,
    root_entity_column: Some("entity_id"),
};

pub const OPERATIONS: TableDef = TableDef {
    name: "operations",
    columns: &[
        ID,
        col("engine_entity_id", ColumnType::Text, true),
        col("operation_type", ColumnType::Text, true),
        col("status", ColumnType::Text, true),
        col("note", ColumnType::Text, false),
        col("performed_at", ColumnType::BigInt, false),
        col("performed_by", ColumnType::Text, false),
        col("meta_json", ColumnType::Json, false),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[ForeignKey {
        column: "engine_entity_id",
        references_table: "entities",
        references_column: "id",
    }],
    uniques: &[PK],
    access: AccessClass::Operations,
    root_entity_column: Some("engine_entity_id"),
};

pub const AUDIT_LOG: TableDef = TableDef {
    name: "audit_log",
    columns: &[
        ID,
        col("actor_id", ColumnType::Text, false),
        col("actor_username", ColumnType::Text, false),
        col("action", ColumnType::Text, true),
        col("table_name", ColumnType::Text, false),
        col("row_id", ColumnType::Text, false),
        col("details_json", ColumnType::Json, false),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[],
    uniques: &[PK],
    access: AccessClass::Diagnostics,
    root_entity_column: None,
};

pub const CHAT_MESSAGES: TableDef = TableDef {
    name: "chat_messages",
    columns: &[
        ID,
        col("author_id", ColumnType::Text, true),
        col("author_username", ColumnType::Text, true),
        col("body", ColumnType::Text, true),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[],
    uniques: &[PK],
    access: AccessClass::Personal,
    root_entity_column: None,
};

pub const CHAT_READS: TableDef = TableDef {
    name: "chat_reads",
    columns: &[
        ID,
        col("message_id", ColumnType::Text, true),
        col("user_id", ColumnType::Text, true),
        col("read_at", ColumnType::BigInt, true),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[ForeignKey {
        column: "message_id",
        references_table: "chat_messages",
        references_column: "id",
    }],
    uniques: &[PK],
    access: AccessClass::Personal,
    root_entity_column: None,
};

pub const NOTES: TableDef = TableDef {
    name: "notes",
    columns: &[
        ID,
        col("owner_id", ColumnType::Text, true),
        col("owner_username", ColumnType::Text, true),
        col("title", ColumnType::Text, true),
        col("body", ColumnType::Text, false),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[],
    uniques: &[PK],
    access: AccessClass::Personal,
    root_entity_column: None,
};

pub const NOTE_SHARES: TableDef = TableDef {
    name: "note_shares",
    columns: &[
        ID,
        col("note_id", ColumnType::Text, true),
        col("user_id", ColumnType::Text, true),
        col("can_edit", ColumnType::Bool, true),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[ForeignKey {
        column: "note_id",
        references_table: "notes",
        references_column: "id",
    }],
    uniques: &[PK],
    access: AccessClass::Personal,
    root_entity_column: None,
};

pub const USER_PRESENCE: TableDef = TableDef {
    name: "user_presence",
    columns: &[
        ID,
        col("user_id", ColumnType::Text, true),
        col("username", ColumnType::Text, true),
        col("status", ColumnType::Text, true),
        col("last_seen_at", ColumnType::BigInt, false),
        CREATED_AT,
        UPDATED_AT,
        DELETED_AT,
        SYNC_STATUS,
    ],
    foreign_keys: &[],
    uniques: &[PK],
    access: AccessClass::Personal,
    root_entity_column: None,
};

/// The synchronized table set, in foreign-key dependency order. The push
/// handler processes batches in this order so parents land before children.
pub const SYNC_TABLES: &[TableDef] = &[
    ENTITY_TYPES,
    ENTITIES,
    ATTRIBUTE_DEFS,
    ATTRIBUTE_VALUES,
    OPERATIONS,
    AUDIT_LOG,
    CHAT_MESSAGES,
    CHAT_READS,
    NOTES,
    NOTE_SHARES,
    USER_PRESENCE,
];

pub fn lookup(name: &str) -> Option<&'static TableDef> {
    SYNC_TABLES.iter().find(|t| t.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_table_carries_lifecycle_columns() {
        for table in SYNC_TABLES {
            for lifecycle in ["id", "created_at", "updated_at", "deleted_at", "sync_status"] {
                assert!(
                    table.column(lifecycle).is_some(),
                    "{} is missing {}",
                    table.name,
                    lifecycle
                );
            }
        }
    }

    #[test]
    fn every_table_has_a_primary_key() {
        for table in SYNC_TABLES {
            assert!(
                table.uniques.iter().any(|u| u.primary),
                "{} has no primary key marker",
                table.name
            );
        }
    }

    #[test]
    fn foreign_keys_point_at_registered_tables() {
        for table in SYNC_TABLES {
            for fk in table.foreign_keys {
                let target = lookup(fk.references_table)
                    .unwrap_or_else(|| panic!("{} references unknown {}", table.name, fk.references_table));
                assert!(target.column(fk.references_column).is_some());
                assert!(table.column(fk.column).is_some());
            }
        }
    }

    #[test]
    fn dependency_order_lists_parents_first() {
        for (idx, table) in SYNC_TABLES.iter().enumerate() {
            for fk in table.foreign_keys {
                let parent_idx = SYNC_TABLES
                    .iter()
                    .position(|t| t.name == fk.references_table)
                    .unwrap();
                assert!(parent_idx < idx, "{} listed before its parent", table.name);
            }
        }
    }

    #[test]
    fn lookup_rejects_unknown_names() {
        assert!(lookup("entities").is_some());
        assert!(lookup("users").is_none());
        assert!(lookup("change_log").is_none());
    }

    #[test]
    fn review_permissions_mirror_push_permissions() {
        assert_eq!(ENTITY_TYPES.review_permission(), "catalog.approve");
        assert_eq!(OPERATIONS.review_permission(), "operations.approve");
        assert_eq!(NOTES.review_permission(), "changes.approve");
        assert_eq!(AUDIT_LOG.review_permission(), "changes.approve");
        for table in SYNC_TABLES {
            assert!(REVIEW_PERMISSIONS.contains(&table.review_permission()));
        }
    }
}
