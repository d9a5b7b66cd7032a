//! Conflict resolution policies.
//!
//! [`ConflictResolver`] applies the deterministic policies to the conflicts a
//! patch application produced and escalates the rest. Operators close
//! escalated conflicts with [`ConflictResolver::mark_resolved`].

use std::path::PathBuf;

use tracing::{debug, info};

use crate::db::queries::ConflictEntry;
use crate::db::Database;
use crate::errors::{ConflictError, PatchError};
use crate::git::EntryMode;
use crate::manifest::render_dependency_file;
use crate::mapping::Mapping;
use crate::models::{AuditEntry, DependencyManifestEntry};
use crate::patch::applier::write_entry;
use crate::patch::{FilePatch, Patch};

use super::{ConflictKind, ConflictRecord, Resolution, Side};

/// Resolves conflicts in one working copy.
pub struct ConflictResolver<'a> {
    workdir: PathBuf,
    mapping: &'a Mapping,
    /// Dependency entries generated files are rendered from.
    entries: &'a [DependencyManifestEntry],
}

impl<'a> ConflictResolver<'a> {
    pub fn new(
        workdir: impl Into<PathBuf>,
        mapping: &'a Mapping,
        entries: &'a [DependencyManifestEntry],
    ) -> Self {
        Self {
            workdir: workdir.into(),
            mapping,
            entries,
        }
    }

    /// Apply policies to `conflicts`. Every record comes back with its
    /// resolution set; those still `Escalated` need an operator.
    ///
    /// - text conflict in a generated file: regenerate it from the entries
    /// - delete/edit: the edit wins, unless the mapping says deletes win
    /// - binary, out of scope, other text conflicts: escalate
    pub fn resolve(
        &self,
        patch: &Patch,
        conflicts: Vec<ConflictRecord>,
    ) -> Result<Vec<ConflictRecord>, PatchError> {
        let mut resolved = Vec::with_capacity(conflicts.len());
        for mut record in conflicts {
            let file = patch.files.iter().find(|f| f.path == record.file_path);
            record.resolution = match (record.kind, file) {
                (ConflictKind::TextConflict, Some(f)) if self.mapping.is_generated(&f.repo_path) => {
                    self.regenerate(&record.file_path)?
                }
                (ConflictKind::DeleteEdit, Some(f)) => self.delete_edit(&record, f)?,
                _ => Resolution::Escalated,
            };
            debug!(
                path = %record.file_path,
                kind = %record.kind,
                resolution = %record.resolution,
                "conflict policy applied"
            );
            resolved.push(record);
        }

        let escalated = resolved.iter().filter(|r| r.is_escalated()).count();
        if !resolved.is_empty() {
            info!(
                mapping = %self.mapping.name,
                total = resolved.len(),
                escalated,
                "conflicts resolved"
            );
        }
        Ok(resolved)
    }

    fn regenerate(&self, path: &str) -> Result<Resolution, PatchError> {
        write_entry(
            &self.workdir.join(path),
            render_dependency_file(self.entries).as_bytes(),
            EntryMode::Regular,
        )?;
        Ok(Resolution::Applied)
    }

    fn delete_edit(&self, record: &ConflictRecord, file: &FilePatch) -> Result<Resolution, PatchError> {
        let target = self.workdir.join(&record.file_path);
        match (record.deleted_in, self.mapping.delete_wins) {
            // Source deleted, target edited.
            (Some(Side::Source), false) => Ok(Resolution::Skipped),
            (Some(Side::Source), true) => {
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
                Ok(Resolution::Applied)
            }
            // Source edited, target deleted.
            (Some(Side::Target), false) => match file.content.as_deref() {
                Some(content) => {
                    write_entry(&target, content, file.new_mode)?;
                    Ok(Resolution::Applied)
                }
                None => Ok(Resolution::Escalated),
            },
            (Some(Side::Target), true) => Ok(Resolution::Skipped),
            (None, _) => Ok(Resolution::Escalated),
        }
    }

    /// Mark an escalated conflict as resolved by an operator and audit it.
    pub fn mark_resolved(
        db: &Database,
        conflict_id: &str,
        resolved_by: &str,
    ) -> Result<ConflictEntry, ConflictError> {
        let conflict = db.get_conflict_entry(conflict_id).map_err(|e| match e {
            crate::errors::DatabaseError::NotFound { .. } => {
                ConflictError::NotFound(conflict_id.to_string())
            }
            other => ConflictError::DatabaseError(other),
        })?;
        if conflict.status != "open" {
            return Err(ConflictError::AlreadyResolved(conflict_id.to_string()));
        }

        db.resolve_conflict(conflict_id, resolved_by)?;

        let details = format!(
            "resolved conflict on '{}' ({}) of run {} by '{}'",
            conflict.file_path, conflict.kind, conflict.run_id, resolved_by
        );
        db.insert_audit_entry(&AuditEntry::success("conflict_resolved", &details))?;

        info!(conflict_id, resolved_by, path = %conflict.file_path, "conflict resolved by operator");
        Ok(db.get_conflict_entry(conflict_id)?)
    }
}
