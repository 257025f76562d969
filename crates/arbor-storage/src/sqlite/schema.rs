//! DDL statements for the SQLite schema.
//!
//! Timestamps are stored as TEXT in ISO 8601 format (SQLite has no native
//! datetime type). Booleans are stored as INTEGER (0/1). JSON blobs,
//! including the four linked-id sets, are TEXT.

/// Stored in `PRAGMA user_version`. Bumped whenever the DDL changes.
pub const SCHEMA_VERSION: i32 = 2;

/// Idempotent DDL, applied in order whenever the stored version is older.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // -- Nodes table ---------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id                    TEXT PRIMARY KEY,
        parent_id             TEXT,
        node_type             TEXT NOT NULL DEFAULT 'leaf',
        label                 TEXT NOT NULL DEFAULT '',
        sort_order            INTEGER NOT NULL DEFAULT 0,
        -- Capability flags
        has_formula           INTEGER NOT NULL DEFAULT 0,
        has_condition         INTEGER NOT NULL DEFAULT 0,
        has_table             INTEGER NOT NULL DEFAULT 0,
        has_variable          INTEGER NOT NULL DEFAULT 0,
        metadata              TEXT NOT NULL DEFAULT '{}',
        repeater_template_ids TEXT NOT NULL DEFAULT '[]',
        -- Linked-id sets (JSON arrays, sorted, deduplicated)
        linked_formula_ids    TEXT NOT NULL DEFAULT '[]',
        linked_condition_ids  TEXT NOT NULL DEFAULT '[]',
        linked_table_ids      TEXT NOT NULL DEFAULT '[]',
        linked_variable_ids   TEXT NOT NULL DEFAULT '[]',
        created_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_repeater
         ON nodes(json_extract(metadata, '$.duplicatedFromRepeater'))",
    // -- Capacities table ----------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS capacities (
        id            TEXT PRIMARY KEY,
        kind          TEXT NOT NULL CHECK (kind IN ('formula', 'condition', 'table')),
        owner_node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
        name          TEXT NOT NULL DEFAULT '',
        is_default    INTEGER NOT NULL DEFAULT 0,
        body          TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_capacities_owner ON capacities(owner_node_id, kind)",
    // -- Variables table -----------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS variables (
        id           TEXT PRIMARY KEY,
        node_id      TEXT NOT NULL UNIQUE REFERENCES nodes(id) ON DELETE CASCADE,
        exposed_key  TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL DEFAULT '',
        source_type  TEXT NOT NULL DEFAULT 'manual',
        source_ref   TEXT,
        unit         TEXT,
        metadata     TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    // -- Repeater bookkeeping ------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS occurrence_counters (
        repeater_id TEXT PRIMARY KEY,
        last_index  INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blueprint_cache (
        repeater_id  TEXT PRIMARY KEY,
        blueprint    TEXT NOT NULL,
        declared_ids TEXT NOT NULL DEFAULT '[]',
        template_ids TEXT NOT NULL DEFAULT '[]',
        captured_at  TEXT NOT NULL
    )
    "#,
];
