//! Database schema definitions and migration runner.
//!
//! The applied version lives in SQLite's `user_version` pragma.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// `(version, description, sql)`, ascending from 1.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS sync_points (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            mapping     TEXT    NOT NULL,
            direction   TEXT    NOT NULL CHECK (direction IN ('forward', 'backward')),
            source_sha  TEXT    NOT NULL,
            target_sha  TEXT    NOT NULL,
            generation  INTEGER NOT NULL,
            is_current  INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_points_current
            ON sync_points (mapping, direction) WHERE is_current = 1;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_points_generation
            ON sync_points (mapping, direction, generation);

        CREATE TABLE IF NOT EXISTS manifest_entries (
            mapping         TEXT NOT NULL,
            package_id      TEXT NOT NULL,
            version         TEXT NOT NULL,
            sha             TEXT NOT NULL,
            repository_url  TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            PRIMARY KEY (mapping, package_id)
        );

        CREATE TABLE IF NOT EXISTS flow_runs (
            id              TEXT PRIMARY KEY,
            mapping         TEXT NOT NULL,
            direction       TEXT NOT NULL,
            build_id        TEXT NOT NULL,
            source_commit   TEXT NOT NULL,
            state           TEXT NOT NULL,
            branch          TEXT,
            target_branch   TEXT NOT NULL DEFAULT '',
            patch_json      TEXT,
            details         TEXT,
            started_at      TEXT NOT NULL,
            completed_at    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_flow_runs_request
            ON flow_runs (mapping, direction, build_id, source_commit);

        CREATE TABLE IF NOT EXISTS flow_conflicts (
            id          TEXT PRIMARY KEY,
            run_id      TEXT NOT NULL REFERENCES flow_runs (id),
            file_path   TEXT NOT NULL,
            kind        TEXT NOT NULL,
            resolution  TEXT NOT NULL,
            deleted_in  TEXT,
            detail      TEXT,
            status      TEXT NOT NULL DEFAULT 'open',
            resolved_by TEXT,
            created_at  TEXT NOT NULL,
            resolved_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_flow_conflicts_run ON flow_conflicts (run_id);
        CREATE INDEX IF NOT EXISTS idx_flow_conflicts_status ON flow_conflicts (status);

        CREATE TABLE IF NOT EXISTS patch_fingerprints (
            mapping     TEXT NOT NULL,
            direction   TEXT NOT NULL,
            base_sha    TEXT NOT NULL,
            source_sha  TEXT NOT NULL,
            scope_hash  TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (mapping, direction, base_sha, source_sha, scope_hash)
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT NOT NULL,
            mapping     TEXT,
            direction   TEXT,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);
        "#,
    ),
];

/// Apply every migration newer than the stored `user_version`, each in
/// its own batch, bumping the version after each one.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let pending: Vec<_> = MIGRATIONS.iter().filter(|(v, _, _)| *v > current).collect();
    if pending.is_empty() {
        debug!(version = current, "schema up to date");
        return Ok(());
    }

    for &&(version, description, sql) in &pending {
        info!(from = current, version, description, "applying migration");
        conn.execute_batch(sql)
            .map_err(|e| DatabaseError::MigrationFailed {
                version,
                detail: e.to_string(),
            })?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(())
}
