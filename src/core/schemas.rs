//! SQLite schema for the anchor registry.
//!
//! One database file per store:
//! - `anchors`: the canonical anchor per (project, marker)
//! - `anchor_versions`: every committed version, append-only
//! - `lifecycles`: review conference cycles per (project, chat)

pub const ANCHOR_DB_NAME: &str = "anchors.db";

pub const ANCHOR_DB_SCHEMA_ANCHORS: &str = "
    CREATE TABLE IF NOT EXISTS anchors (
        project_id INTEGER NOT NULL,
        marker TEXT NOT NULL,
        version INTEGER NOT NULL,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (project_id, marker)
    )
";

pub const ANCHOR_DB_SCHEMA_VERSIONS: &str = "
    CREATE TABLE IF NOT EXISTS anchor_versions (
        project_id INTEGER NOT NULL,
        marker TEXT NOT NULL,
        version INTEGER NOT NULL,
        revision INTEGER NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        updated_by TEXT NOT NULL,
        PRIMARY KEY (project_id, marker, version)
    )
";

pub const ANCHOR_DB_SCHEMA_LIFECYCLES: &str = "
    CREATE TABLE IF NOT EXISTS lifecycles (
        project_id INTEGER NOT NULL,
        chat_id TEXT NOT NULL,
        cycle INTEGER NOT NULL,
        closed INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (project_id, chat_id)
    )
";

pub const ANCHOR_DB_SCHEMAS: &[&str] = &[
    ANCHOR_DB_SCHEMA_ANCHORS,
    ANCHOR_DB_SCHEMA_VERSIONS,
    ANCHOR_DB_SCHEMA_LIFECYCLES,
];
