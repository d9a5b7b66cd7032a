//! Typed query helpers for every table in the code flow database.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use super::Database;
use crate::conflict::{ConflictKind, ConflictRecord, Resolution, Side};
use crate::errors::DatabaseError;
use crate::models::{AuditEntry, DependencyManifestEntry, Direction, FlowRun, SyncPoint};

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// Result of a compare-and-swap on the current sync point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The new sync point is now current.
    Swapped(SyncPoint),
    /// The stored generation did not match; nothing was written.
    Stale { found: Option<i64> },
}

/// A row from the `flow_conflicts` table.
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    pub id: String,
    pub run_id: String,
    pub file_path: String,
    pub kind: String,
    pub resolution: String,
    pub deleted_in: Option<String>,
    pub detail: Option<String>,
    /// `open`, `auto_resolved`, or `resolved`.
    pub status: String,
    pub resolved_by: Option<String>,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

impl ConflictEntry {
    /// Convert back into the in-memory record.
    pub fn to_record(&self) -> ConflictRecord {
        ConflictRecord {
            file_path: self.file_path.clone(),
            kind: ConflictKind::from_str_val(&self.kind),
            resolution: Resolution::from_str_val(&self.resolution),
            deleted_in: self.deleted_in.as_deref().and_then(parse_side),
            detail: self.detail.clone(),
        }
    }
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub mapping: Option<String>,
    pub direction: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

const FLOW_RUN_COLUMNS: &str = "id, mapping, direction, build_id, source_commit, state, branch,
     target_branch, patch_json, details, started_at, completed_at";

const CONFLICT_COLUMNS: &str = "id, run_id, file_path, kind, resolution, deleted_in, detail,
     status, resolved_by, created_at, resolved_at";

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- sync_points --------------------------------------------------------

    /// The current sync point for a mapping and direction.
    pub fn get_sync_point(
        &self,
        mapping: &str,
        direction: Direction,
    ) -> Result<Option<SyncPoint>, DatabaseError> {
        let conn = self.conn();
        current_sync_point(&conn, mapping, direction)
    }

    /// Replace the current sync point if its generation still equals
    /// `expected_generation` (`None` = no sync point yet), and upsert
    /// `entries` in the same transaction.
    ///
    /// Runs in an immediate transaction so the read and the write are a
    /// single step with respect to other writers of the same database.
    pub fn swap_sync_point(
        &self,
        mapping: &str,
        direction: Direction,
        expected_generation: Option<i64>,
        source_sha: &str,
        target_sha: &str,
        entries: &[DependencyManifestEntry],
    ) -> Result<SwapOutcome, DatabaseError> {
        self.immediate_transaction(|conn| {
            let current = current_sync_point(conn, mapping, direction)?;
            let found = current.as_ref().map(|sp| sp.generation);
            if found != expected_generation {
                debug!(mapping, %direction, ?expected_generation, ?found, "stale sync point swap");
                return Ok(SwapOutcome::Stale { found });
            }

            let now = Utc::now();
            let generation = found.unwrap_or(0) + 1;
            conn.execute(
                "UPDATE sync_points SET is_current = 0
                 WHERE mapping = ?1 AND direction = ?2 AND is_current = 1",
                params![mapping, direction.to_string()],
            )?;
            conn.execute(
                "INSERT INTO sync_points
                 (mapping, direction, source_sha, target_sha, generation, is_current, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                params![
                    mapping,
                    direction.to_string(),
                    source_sha,
                    target_sha,
                    generation,
                    now.to_rfc3339()
                ],
            )?;
            upsert_entries(conn, mapping, entries, &now.to_rfc3339())?;
            debug!(mapping, %direction, source_sha, target_sha, generation, "swapped sync point");

            Ok(SwapOutcome::Swapped(SyncPoint {
                mapping: mapping.to_string(),
                direction,
                source_sha: source_sha.to_string(),
                target_sha: target_sha.to_string(),
                generation,
                created_at: now,
            }))
        })
    }

    /// All sync points ever recorded for a key, newest first.
    pub fn list_sync_point_history(
        &self,
        mapping: &str,
        direction: Direction,
        limit: u32,
    ) -> Result<Vec<SyncPoint>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT mapping, direction, source_sha, target_sha, generation, created_at
             FROM sync_points WHERE mapping = ?1 AND direction = ?2
             ORDER BY generation DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![mapping, direction.to_string(), limit], row_to_sync_point)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- manifest_entries ---------------------------------------------------

    /// Insert or replace the entries for a mapping, keyed by package ID.
    pub fn upsert_manifest_entries(
        &self,
        mapping: &str,
        entries: &[DependencyManifestEntry],
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.transaction(|conn| upsert_entries(conn, mapping, entries, &now))?;
        debug!(mapping, count = entries.len(), "upserted manifest entries");
        Ok(())
    }

    /// All entries for a mapping, ordered by package ID.
    pub fn list_manifest_entries(
        &self,
        mapping: &str,
    ) -> Result<Vec<DependencyManifestEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT package_id, version, sha, repository_url FROM manifest_entries
             WHERE mapping = ?1 ORDER BY package_id",
        )?;
        let rows = stmt
            .query_map(params![mapping], row_to_manifest_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- flow_runs ----------------------------------------------------------

    /// Record a new flow run.
    pub fn insert_flow_run(&self, run: &FlowRun) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO flow_runs
             (id, mapping, direction, build_id, source_commit, state, branch, target_branch,
              patch_json, details, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.id,
                run.mapping,
                run.direction.to_string(),
                run.build_id,
                run.source_commit,
                run.state,
                run.branch,
                run.target_branch,
                run.patch_json,
                run.details,
                run.started_at,
                run.completed_at
            ],
        )?;
        debug!(id = %run.id, mapping = %run.mapping, direction = %run.direction, "inserted flow run");
        Ok(())
    }

    /// Move a run to a new state.
    pub fn update_flow_run_state(&self, id: &str, state: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE flow_runs SET state = ?1 WHERE id = ?2",
            params![state, id],
        )?;
        if changed == 0 {
            return Err(not_found("flow_run", id));
        }
        debug!(id, state, "flow run state changed");
        Ok(())
    }

    /// Record the working branch of a run.
    pub fn set_flow_run_branch(&self, id: &str, branch: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE flow_runs SET branch = ?1 WHERE id = ?2",
            params![branch, id],
        )?;
        Ok(())
    }

    /// Store the serialized patch of a run.
    pub fn set_flow_run_patch(&self, id: &str, patch_json: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE flow_runs SET patch_json = ?1 WHERE id = ?2",
            params![patch_json, id],
        )?;
        Ok(())
    }

    /// Mark a run as finished in a terminal state.
    pub fn complete_flow_run(
        &self,
        id: &str,
        state: &str,
        details: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE flow_runs SET state = ?1, details = ?2, completed_at = ?3 WHERE id = ?4",
            params![state, details, now, id],
        )?;
        if changed == 0 {
            return Err(not_found("flow_run", id));
        }
        debug!(id, state, "completed flow run");
        Ok(())
    }

    /// Get a run by ID.
    pub fn get_flow_run(&self, id: &str) -> Result<Option<FlowRun>, DatabaseError> {
        let conn = self.conn();
        let run = conn
            .query_row(
                &format!("SELECT {} FROM flow_runs WHERE id = ?1", FLOW_RUN_COLUMNS),
                params![id],
                row_to_flow_run,
            )
            .optional()?;
        Ok(run)
    }

    /// The most recent run for the same request key.
    pub fn latest_flow_run_for_request(
        &self,
        mapping: &str,
        direction: Direction,
        build_id: &str,
        source_commit: &str,
    ) -> Result<Option<FlowRun>, DatabaseError> {
        let conn = self.conn();
        let run = conn
            .query_row(
                &format!(
                    "SELECT {} FROM flow_runs
                     WHERE mapping = ?1 AND direction = ?2 AND build_id = ?3 AND source_commit = ?4
                     ORDER BY started_at DESC, rowid DESC LIMIT 1",
                    FLOW_RUN_COLUMNS
                ),
                params![mapping, direction.to_string(), build_id, source_commit],
                row_to_flow_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Recent runs, optionally for one mapping, newest first.
    pub fn list_flow_runs(
        &self,
        mapping: Option<&str>,
        limit: u32,
    ) -> Result<Vec<FlowRun>, DatabaseError> {
        let conn = self.conn();
        let rows = match mapping {
            Some(m) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM flow_runs WHERE mapping = ?1
                     ORDER BY started_at DESC, rowid DESC LIMIT ?2",
                    FLOW_RUN_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![m, limit], row_to_flow_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM flow_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
                    FLOW_RUN_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![limit], row_to_flow_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    // -- flow_conflicts -----------------------------------------------------

    /// Persist the conflicts of a run. Escalated records are stored `open`,
    /// policy-resolved ones `auto_resolved`.
    pub fn insert_flow_conflicts(
        &self,
        run_id: &str,
        records: &[ConflictRecord],
    ) -> Result<Vec<String>, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let ids = self.transaction(|conn| {
            let mut ids = Vec::with_capacity(records.len());
            for rec in records {
                let id = Uuid::new_v4().to_string();
                let status = if rec.is_escalated() { "open" } else { "auto_resolved" };
                conn.execute(
                    "INSERT INTO flow_conflicts
                     (id, run_id, file_path, kind, resolution, deleted_in, detail, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        id,
                        run_id,
                        rec.file_path,
                        rec.kind.to_string(),
                        rec.resolution.to_string(),
                        rec.deleted_in.map(side_str),
                        rec.detail,
                        status,
                        now
                    ],
                )?;
                ids.push(id);
            }
            Ok(ids)
        })?;
        debug!(run_id, count = ids.len(), "inserted flow conflicts");
        Ok(ids)
    }

    /// Get a conflict by ID (returns an error if not found).
    pub fn get_conflict_entry(&self, id: &str) -> Result<ConflictEntry, DatabaseError> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM flow_conflicts WHERE id = ?1", CONFLICT_COLUMNS),
            params![id],
            row_to_conflict,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => not_found("conflict", id),
            other => other.into(),
        })
    }

    /// All conflicts of a run, in the order they were recorded.
    pub fn list_conflicts_for_run(&self, run_id: &str) -> Result<Vec<ConflictEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM flow_conflicts WHERE run_id = ?1 ORDER BY rowid",
            CONFLICT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![run_id], row_to_conflict)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Conflicts filtered by status, newest first.
    pub fn list_conflicts(
        &self,
        status: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ConflictEntry>, DatabaseError> {
        let conn = self.conn();
        let rows = match status {
            Some(s) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM flow_conflicts WHERE status = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                    CONFLICT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![s, limit], row_to_conflict)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM flow_conflicts ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                    CONFLICT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![limit], row_to_conflict)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Mark an escalated conflict as resolved by an operator.
    pub fn resolve_conflict(&self, id: &str, resolved_by: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE flow_conflicts SET status = 'resolved', resolved_by = ?1, resolved_at = ?2
             WHERE id = ?3",
            params![resolved_by, now, id],
        )?;
        if changed == 0 {
            return Err(not_found("conflict", id));
        }
        debug!(id, resolved_by, "resolved conflict");
        Ok(())
    }

    /// Target paths an operator resolved in any run of the same request.
    pub fn resolved_conflict_paths(
        &self,
        mapping: &str,
        direction: Direction,
        build_id: &str,
        source_commit: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT c.file_path FROM flow_conflicts c
             JOIN flow_runs r ON r.id = c.run_id
             WHERE r.mapping = ?1 AND r.direction = ?2 AND r.build_id = ?3
               AND r.source_commit = ?4 AND c.status = 'resolved'
             ORDER BY c.file_path",
        )?;
        let rows = stmt
            .query_map(
                params![mapping, direction.to_string(), build_id, source_commit],
                |row| row.get(0),
            )?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    /// Number of conflicts of a run still waiting for an operator.
    pub fn count_open_conflicts(&self, run_id: &str) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM flow_conflicts WHERE run_id = ?1 AND status = 'open'",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- patch_fingerprints -------------------------------------------------

    /// The fingerprint recorded for a patch key, if any.
    pub fn get_patch_fingerprint(
        &self,
        mapping: &str,
        direction: Direction,
        base_sha: &str,
        source_sha: &str,
        scope_hash: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let fp = conn
            .query_row(
                "SELECT fingerprint FROM patch_fingerprints
                 WHERE mapping = ?1 AND direction = ?2 AND base_sha = ?3
                   AND source_sha = ?4 AND scope_hash = ?5",
                params![mapping, direction.to_string(), base_sha, source_sha, scope_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fp)
    }

    /// Record a fingerprint. An existing row for the same key is kept.
    pub fn insert_patch_fingerprint(
        &self,
        mapping: &str,
        direction: Direction,
        base_sha: &str,
        source_sha: &str,
        scope_hash: &str,
        fingerprint: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO patch_fingerprints
             (mapping, direction, base_sha, source_sha, scope_hash, fingerprint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                mapping,
                direction.to_string(),
                base_sha,
                source_sha,
                scope_hash,
                fingerprint,
                now
            ],
        )?;
        debug!(mapping, %direction, base_sha, source_sha, "recorded patch fingerprint");
        Ok(())
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit entry.
    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, mapping, direction, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.action,
                entry.mapping,
                entry.direction.map(|d| d.to_string()),
                entry.details,
                entry.success,
                entry.timestamp.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action = %entry.action, "inserted audit entry");
        Ok(id)
    }

    /// Most recent audit entries, newest first.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, mapping, direction, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    mapping: row.get(2)?,
                    direction: row.get(3)?,
                    details: row.get(4)?,
                    success: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Total number of audit entries.
    pub fn count_audit_log(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn current_sync_point(
    conn: &Connection,
    mapping: &str,
    direction: Direction,
) -> Result<Option<SyncPoint>, DatabaseError> {
    let sp = conn
        .query_row(
            "SELECT mapping, direction, source_sha, target_sha, generation, created_at
             FROM sync_points WHERE mapping = ?1 AND direction = ?2 AND is_current = 1",
            params![mapping, direction.to_string()],
            row_to_sync_point,
        )
        .optional()?;
    Ok(sp)
}

fn upsert_entries(
    conn: &Connection,
    mapping: &str,
    entries: &[DependencyManifestEntry],
    now: &str,
) -> Result<(), DatabaseError> {
    for entry in entries {
        conn.execute(
            "INSERT INTO manifest_entries
             (mapping, package_id, version, sha, repository_url, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(mapping, package_id) DO UPDATE SET
                version = excluded.version,
                sha = excluded.sha,
                repository_url = excluded.repository_url,
                updated_at = excluded.updated_at",
            params![
                mapping,
                entry.package_id,
                entry.version,
                entry.sha,
                entry.repository_url,
                now
            ],
        )?;
    }
    Ok(())
}

fn row_to_sync_point(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncPoint> {
    let direction: String = row.get(1)?;
    let created_at: String = row.get(5)?;
    Ok(SyncPoint {
        mapping: row.get(0)?,
        direction: Direction::from_str_val(&direction).unwrap_or(Direction::Forward),
        source_sha: row.get(2)?,
        target_sha: row.get(3)?,
        generation: row.get(4)?,
        created_at: parse_datetime(&created_at),
    })
}

fn row_to_manifest_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<DependencyManifestEntry> {
    Ok(DependencyManifestEntry {
        package_id: row.get(0)?,
        version: row.get(1)?,
        sha: row.get(2)?,
        repository_url: row.get(3)?,
    })
}

fn row_to_flow_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowRun> {
    let direction: String = row.get(2)?;
    Ok(FlowRun {
        id: row.get(0)?,
        mapping: row.get(1)?,
        direction: Direction::from_str_val(&direction).unwrap_or(Direction::Forward),
        build_id: row.get(3)?,
        source_commit: row.get(4)?,
        state: row.get(5)?,
        branch: row.get(6)?,
        target_branch: row.get(7)?,
        patch_json: row.get(8)?,
        details: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

fn row_to_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictEntry> {
    Ok(ConflictEntry {
        id: row.get(0)?,
        run_id: row.get(1)?,
        file_path: row.get(2)?,
        kind: row.get(3)?,
        resolution: row.get(4)?,
        deleted_in: row.get(5)?,
        detail: row.get(6)?,
        status: row.get(7)?,
        resolved_by: row.get(8)?,
        created_at: row.get(9)?,
        resolved_at: row.get(10)?,
    })
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Source => "source",
        Side::Target => "target",
    }
}

fn parse_side(s: &str) -> Option<Side> {
    match s {
        "source" => Some(Side::Source),
        "target" => Some(Side::Target),
        _ => None,
    }
}

fn not_found(entity: &str, id: &str) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.into(),
        id: id.to_string(),
    }
}

/// Parse a datetime string, returning Utc::now() as a fallback if parsing fails.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn sample_run(id: &str) -> FlowRun {
        FlowRun {
            id: id.into(),
            mapping: "sdk".into(),
            direction: Direction::Forward,
            build_id: "b1".into(),
            source_commit: "abc".into(),
            state: "ReadSyncPoint".into(),
            branch: None,
            target_branch: "main".into(),
            patch_json: None,
            details: None,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
        }
    }

    #[test]
    fn test_sync_point_swap() {
        let db = setup_db();
        assert!(db.get_sync_point("sdk", Direction::Forward).unwrap().is_none());

        let first = db
            .swap_sync_point("sdk", Direction::Forward, None, "s1", "t1", &[])
            .unwrap();
        assert!(matches!(first, SwapOutcome::Swapped(ref sp) if sp.generation == 1));

        let stale = db
            .swap_sync_point("sdk", Direction::Forward, None, "s2", "t2", &[])
            .unwrap();
        assert_eq!(stale, SwapOutcome::Stale { found: Some(1) });

        let entry = DependencyManifestEntry {
            package_id: "Acme.Core".into(),
            version: "1.0.0".into(),
            sha: "aaa".into(),
            repository_url: "https://example.com/core".into(),
        };
        db.swap_sync_point("sdk", Direction::Forward, Some(1), "s2", "t2", &[entry.clone()])
            .unwrap();
        assert_eq!(db.list_manifest_entries("sdk").unwrap(), vec![entry]);
        let sp = db.get_sync_point("sdk", Direction::Forward).unwrap().unwrap();
        assert_eq!(sp.source_sha, "s2");
        assert_eq!(sp.generation, 2);

        // Directions are independent keys.
        assert!(db.get_sync_point("sdk", Direction::Backward).unwrap().is_none());

        let history = db
            .list_sync_point_history("sdk", Direction::Forward, 10)
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].source_sha, "s1");
    }

    #[test]
    fn test_manifest_upsert() {
        let db = setup_db();
        let mut entry = DependencyManifestEntry {
            package_id: "Acme.Core".into(),
            version: "1.0.0".into(),
            sha: "aaa".into(),
            repository_url: "https://example.com/core".into(),
        };
        db.upsert_manifest_entries("sdk", &[entry.clone()]).unwrap();
        entry.version = "1.1.0".into();
        db.upsert_manifest_entries("sdk", &[entry.clone()]).unwrap();
        db.upsert_manifest_entries("sdk", &[entry.clone()]).unwrap();

        let all = db.list_manifest_entries("sdk").unwrap();
        assert_eq!(all, vec![entry]);
        assert!(db.list_manifest_entries("other").unwrap().is_empty());
    }

    #[test]
    fn test_flow_run_lifecycle() {
        let db = setup_db();
        db.insert_flow_run(&sample_run("r1")).unwrap();
        db.update_flow_run_state("r1", "BuildPatch").unwrap();
        db.set_flow_run_branch("r1", "codeflow/forward/sdk/b1").unwrap();
        db.complete_flow_run("r1", "Done", Some("ok")).unwrap();

        let run = db.get_flow_run("r1").unwrap().unwrap();
        assert_eq!(run.state, "Done");
        assert_eq!(run.branch.as_deref(), Some("codeflow/forward/sdk/b1"));
        assert!(run.completed_at.is_some());

        let latest = db
            .latest_flow_run_for_request("sdk", Direction::Forward, "b1", "abc")
            .unwrap();
        assert_eq!(latest.map(|r| r.id), Some("r1".to_string()));
        assert_eq!(db.list_flow_runs(Some("sdk"), 10).unwrap().len(), 1);
        assert!(db.update_flow_run_state("missing", "Done").is_err());
    }

    #[test]
    fn test_conflicts_crud() {
        let db = setup_db();
        db.insert_flow_run(&sample_run("r1")).unwrap();

        let mut auto = ConflictRecord::new("src/sdk/a.txt", ConflictKind::DeleteEdit)
            .deleted_in(Side::Source);
        auto.resolution = Resolution::Applied;
        let open = ConflictRecord::new("src/sdk/b.bin", ConflictKind::Binary);

        let ids = db.insert_flow_conflicts("r1", &[auto.clone(), open]).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(db.count_open_conflicts("r1").unwrap(), 1);

        let entries = db.list_conflicts_for_run("r1").unwrap();
        assert_eq!(entries[0].to_record(), auto);
        assert_eq!(entries[0].status, "auto_resolved");

        db.resolve_conflict(&ids[1], "alice").unwrap();
        assert_eq!(db.count_open_conflicts("r1").unwrap(), 0);
        assert_eq!(db.get_conflict_entry(&ids[1]).unwrap().status, "resolved");
        assert!(db.resolve_conflict("nope", "alice").is_err());
        assert_eq!(db.list_conflicts(Some("resolved"), 10).unwrap().len(), 1);

        assert_eq!(
            db.resolved_conflict_paths("sdk", Direction::Forward, "b1", "abc").unwrap(),
            vec!["src/sdk/b.bin".to_string()]
        );
        assert!(db
            .resolved_conflict_paths("sdk", Direction::Backward, "b1", "abc")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_patch_fingerprint() {
        let db = setup_db();
        let d = Direction::Backward;
        assert!(db.get_patch_fingerprint("m", d, "a", "b", "s").unwrap().is_none());
        db.insert_patch_fingerprint("m", d, "a", "b", "s", "fp1").unwrap();
        db.insert_patch_fingerprint("m", d, "a", "b", "s", "fp2").unwrap();
        assert_eq!(
            db.get_patch_fingerprint("m", d, "a", "b", "s").unwrap().as_deref(),
            Some("fp1")
        );
    }

    #[test]
    fn test_audit_log() {
        let db = setup_db();
        db.insert_audit_entry(&AuditEntry::success("flow", "ok").for_flow("sdk", Direction::Forward))
            .unwrap();
        let entries = db.list_audit_log(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction.as_deref(), Some("forward"));
        assert_eq!(db.count_audit_log().unwrap(), 1);
    }
}
