//! Applies a [`Patch`] to a target working copy, file by file.
//!
//! Files that apply cleanly are written immediately; anything that does not
//! becomes a [`ConflictRecord`] and the target file is left as it was. The
//! caller decides what to do with the conflicts (resolve, park, or roll
//! back). Cancellation is checked between files, never inside one.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::conflict::{ConflictKind, ConflictRecord, Side};
use crate::errors::PatchError;
use crate::flow::CancellationToken;
use crate::git::{blob_id, EntryMode};
use crate::mapping::filter::is_within;
use crate::mapping::Mapping;
use crate::models::Direction;

use super::builder::is_binary;
use super::{ChangeKind, FilePatch, Patch};

/// Outcome of applying one patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyResult {
    /// Target paths written or removed.
    pub applied_files: Vec<String>,
    pub conflicts: Vec<ConflictRecord>,
}

impl ApplyResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Writes patches into one working copy.
pub struct PatchApplier<'a> {
    workdir: PathBuf,
    mapping: &'a Mapping,
    direction: Direction,
}

enum Outcome {
    Applied,
    Conflict(ConflictRecord),
}

impl<'a> PatchApplier<'a> {
    pub fn new(workdir: impl Into<PathBuf>, mapping: &'a Mapping, direction: Direction) -> Self {
        Self {
            workdir: workdir.into(),
            mapping,
            direction,
        }
    }

    /// Apply `patch` in order. Paths in `skip` (target-relative) are left
    /// alone; a resumed run uses this for files an operator already
    /// resolved.
    pub fn apply(
        &self,
        patch: &Patch,
        skip: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, PatchError> {
        let mut result = ApplyResult::default();

        for file in &patch.files {
            if cancel.is_cancelled() {
                warn!(
                    mapping = %self.mapping.name,
                    applied = result.applied_files.len(),
                    "patch application cancelled"
                );
                return Err(PatchError::Cancelled {
                    applied: result.applied_files.len(),
                });
            }
            if skip.contains(&file.path) {
                debug!(path = %file.path, "skipping operator-resolved file");
                continue;
            }

            match self.apply_file(file)? {
                Outcome::Applied => result.applied_files.push(file.path.clone()),
                Outcome::Conflict(record) => {
                    debug!(path = %file.path, kind = %record.kind, "file did not apply");
                    result.conflicts.push(record);
                }
            }
        }

        info!(
            mapping = %self.mapping.name,
            direction = %self.direction,
            applied = result.applied_files.len(),
            conflicts = result.conflicts.len(),
            "patch applied"
        );
        Ok(result)
    }

    fn apply_file(&self, file: &FilePatch) -> Result<Outcome, PatchError> {
        if let Some(reason) = self.out_of_scope(file) {
            return Ok(Outcome::Conflict(
                ConflictRecord::new(&file.path, ConflictKind::OutOfScope).with_detail(reason),
            ));
        }

        let target = self.workdir.join(&file.path);
        let current = read_optional(&target)?;

        match &file.change {
            ChangeKind::Add => self.apply_add(file, &target, current),
            ChangeKind::Modify => self.apply_modify(file, &target, current),
            ChangeKind::Delete => self.apply_delete(file, &target, current),
            ChangeKind::Rename { from } => {
                let from_target = self.workdir.join(from);
                match read_optional(&from_target)? {
                    // Edit the old name in place, then move it.
                    Some(old) if current.is_none() => {
                        let outcome = self.apply_modify(file, &from_target, Some(old))?;
                        if matches!(outcome, Outcome::Applied) {
                            if let Some(parent) = target.parent() {
                                std::fs::create_dir_all(parent)?;
                            }
                            std::fs::rename(&from_target, &target)?;
                        }
                        Ok(outcome)
                    }
                    _ => {
                        let outcome = self.apply_add(file, &target, current)?;
                        if matches!(outcome, Outcome::Applied) && current_mode(&from_target)?.is_some() {
                            std::fs::remove_file(&from_target)?;
                        }
                        Ok(outcome)
                    }
                }
            }
        }
    }

    fn apply_add(
        &self,
        file: &FilePatch,
        target: &Path,
        current: Option<Vec<u8>>,
    ) -> Result<Outcome, PatchError> {
        let new = new_content(file)?;
        match current {
            None => {
                write_entry(target, new, file.new_mode)?;
                Ok(Outcome::Applied)
            }
            Some(existing) if existing == new => {
                ensure_mode(target, new, file.new_mode)?;
                Ok(Outcome::Applied)
            }
            Some(_) => Ok(Outcome::Conflict(
                ConflictRecord::new(&file.path, self.divergence_kind(file))
                    .with_detail("added on both sides with different content"),
            )),
        }
    }

    fn apply_modify(
        &self,
        file: &FilePatch,
        target: &Path,
        current: Option<Vec<u8>>,
    ) -> Result<Outcome, PatchError> {
        let new = new_content(file)?;
        let Some(existing) = current else {
            return Ok(Outcome::Conflict(
                ConflictRecord::new(&file.path, ConflictKind::DeleteEdit)
                    .deleted_in(Side::Target)
                    .with_detail("edited in source, missing in target"),
            ));
        };

        if existing == new {
            ensure_mode(target, new, file.new_mode)?;
            return Ok(Outcome::Applied);
        }
        if file.old_id.as_deref() == Some(blob_id(&existing)?.as_str()) {
            write_entry(target, new, file.new_mode)?;
            return Ok(Outcome::Applied);
        }
        if file.binary || is_binary(&existing) {
            return Ok(Outcome::Conflict(
                ConflictRecord::new(&file.path, ConflictKind::Binary)
                    .with_detail("binary content diverged"),
            ));
        }

        let Some(diff) = file.diff.as_deref() else {
            return Ok(Outcome::Conflict(
                ConflictRecord::new(&file.path, ConflictKind::TextConflict)
                    .with_detail("no diff recorded"),
            ));
        };
        let parsed = diffy::Patch::from_str(diff).map_err(|e| PatchError::MalformedDiff {
            path: file.path.clone(),
            detail: e.to_string(),
        })?;
        let base = String::from_utf8_lossy(&existing);
        match diffy::apply(&base, &parsed) {
            Ok(merged) => {
                write_entry(target, merged.as_bytes(), file.new_mode)?;
                Ok(Outcome::Applied)
            }
            Err(e) => Ok(Outcome::Conflict(
                ConflictRecord::new(&file.path, ConflictKind::TextConflict)
                    .with_detail(e.to_string()),
            )),
        }
    }

    fn apply_delete(
        &self,
        file: &FilePatch,
        target: &Path,
        current: Option<Vec<u8>>,
    ) -> Result<Outcome, PatchError> {
        let Some(existing) = current else {
            return Ok(Outcome::Applied);
        };
        if file.old_id.as_deref() == Some(blob_id(&existing)?.as_str()) {
            std::fs::remove_file(target)?;
            return Ok(Outcome::Applied);
        }
        Ok(Outcome::Conflict(
            ConflictRecord::new(&file.path, ConflictKind::DeleteEdit)
                .deleted_in(Side::Source)
                .with_detail("deleted in source, edited in target"),
        ))
    }

    fn divergence_kind(&self, file: &FilePatch) -> ConflictKind {
        if file.binary {
            ConflictKind::Binary
        } else {
            ConflictKind::TextConflict
        }
    }

    /// Why `file` may not be written by this applier, if it may not.
    fn out_of_scope(&self, file: &FilePatch) -> Option<String> {
        let mut paths = vec![file.path.as_str()];
        if let ChangeKind::Rename { from } = &file.change {
            paths.push(from.as_str());
        }
        for path in paths {
            let escapes = Path::new(path)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
            if escapes {
                return Some(format!("'{}' is not a plain relative path", path));
            }
            if self.direction == Direction::Forward && !is_within(path, &self.mapping.vmr_path) {
                return Some(format!("'{}' is outside {}", path, self.mapping.vmr_path));
            }
        }
        let decision = self.mapping.filter().evaluate(&file.repo_path);
        if !decision.in_scope() {
            return Some(format!("'{}' is {}", file.repo_path, decision.label()));
        }
        None
    }
}

fn new_content(file: &FilePatch) -> Result<&[u8], PatchError> {
    file.content
        .as_deref()
        .ok_or_else(|| PatchError::MalformedDiff {
            path: file.path.clone(),
            detail: "no content recorded".into(),
        })
}

/// Current content of a target entry. A symlink reads as its link text, the
/// way git stores it.
fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, PatchError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let link = std::fs::read_link(path)?;
            Ok(Some(link.to_string_lossy().into_owned().into_bytes()))
        }
        Ok(_) => Ok(Some(std::fs::read(path)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Mode of the entry at `path`, or `None` if there is none.
fn current_mode(path: &Path) -> Result<Option<EntryMode>, PatchError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_symlink() {
        return Ok(Some(EntryMode::Symlink));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 != 0 {
            return Ok(Some(EntryMode::Executable));
        }
    }
    Ok(Some(EntryMode::Regular))
}

/// Replace whatever is at `path` with an entry of `mode` holding `content`.
/// For symlinks `content` is the link target.
pub(crate) fn write_entry(path: &Path, content: &[u8], mode: EntryMode) -> Result<(), PatchError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if current_mode(path)? == Some(EntryMode::Symlink) || mode == EntryMode::Symlink {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
    }

    #[cfg(unix)]
    {
        if mode == EntryMode::Symlink {
            let link = String::from_utf8_lossy(content).into_owned();
            std::os::unix::fs::symlink(link, path)?;
            return Ok(());
        }
    }

    // Without symlink support the link text is checked out as a plain file.
    std::fs::write(path, content)?;
    set_executable(path, mode == EntryMode::Executable)
}

/// Bring an entry whose content already matches up to `mode`.
fn ensure_mode(path: &Path, content: &[u8], mode: EntryMode) -> Result<(), PatchError> {
    match current_mode(path)? {
        Some(current) if current == mode => Ok(()),
        Some(EntryMode::Symlink) => write_entry(path, content, mode),
        _ if mode == EntryMode::Symlink => write_entry(path, content, mode),
        _ => set_executable(path, mode == EntryMode::Executable),
    }
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<(), PatchError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    let mode = perms.mode();
    let wanted = if executable {
        mode | ((mode & 0o444) >> 2)
    } else {
        mode & !0o111
    };
    if wanted != mode {
        perms.set_mode(wanted);
        std::fs::set_permissions(path, perms)?;
        debug!(path = %path.display(), executable, "file mode updated");
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> Result<(), PatchError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MappingConfig;
    use std::collections::BTreeMap;

    fn mapping() -> Mapping {
        Mapping::from_config(&MappingConfig {
            name: "sdk".into(),
            vmr_path: Some("src/sdk".into()),
            default_remote: "/srv/sdk".into(),
            default_ref: "main".into(),
            include: vec![],
            exclude: vec!["docs/**".into()],
            submodules: vec![],
            submodule_pointers: false,
            delete_wins: false,
            generated_files: vec![],
            version_floors: BTreeMap::new(),
        })
        .unwrap()
    }

    fn file(repo_path: &str, change: ChangeKind, old: Option<&[u8]>, new: Option<&[u8]>) -> FilePatch {
        let diff = match (&change, new) {
            (ChangeKind::Delete, _) | (_, None) => None,
            (_, Some(n)) => Some(
                diffy::create_patch(
                    &String::from_utf8_lossy(old.unwrap_or_default()),
                    &String::from_utf8_lossy(n),
                )
                .to_string(),
            ),
        };
        FilePatch {
            path: format!("src/sdk/{}", repo_path),
            repo_path: repo_path.into(),
            change,
            old_id: old.map(|b| blob_id(b).unwrap()),
            new_id: new.map(|b| blob_id(b).unwrap()),
            binary: false,
            old_mode: EntryMode::Regular,
            new_mode: EntryMode::Regular,
            diff,
            content: new.map(|b| b.to_vec()),
        }
    }

    fn patch(files: Vec<FilePatch>) -> Patch {
        Patch {
            mapping: "sdk".into(),
            direction: Direction::Forward,
            base_sha: None,
            source_sha: "abc".into(),
            files,
            submodules: vec![],
        }
    }

    fn seed(dir: &Path, rel: &str, content: &[u8]) {
        write_entry(&dir.join(rel), content, EntryMode::Regular).unwrap();
    }

    #[test]
    fn test_clean_apply() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "src/sdk/a.txt", b"one\n");
        let m = mapping();
        let applier = PatchApplier::new(dir.path(), &m, Direction::Forward);
        let p = patch(vec![
            file("a.txt", ChangeKind::Modify, Some(b"one\n"), Some(b"two\n")),
            file("new/b.txt", ChangeKind::Add, None, Some(b"b\n")),
        ]);

        let result = applier
            .apply(&p, &BTreeSet::new(), &CancellationToken::new())
            .unwrap();
        assert!(!result.has_conflicts());
        assert_eq!(result.applied_files.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("src/sdk/a.txt")).unwrap(), b"two\n");
        assert_eq!(std::fs::read(dir.path().join("src/sdk/new/b.txt")).unwrap(), b"b\n");
    }

    #[test]
    fn test_three_way_merge_of_non_overlapping_edit() {
        let dir = tempfile::tempdir().unwrap();
        let base = b"1\n2\n3\n4\n5\n6\n7\n8\n9\n";
        let source = b"1\nTWO\n3\n4\n5\n6\n7\n8\n9\n";
        let target = b"1\n2\n3\n4\n5\n6\n7\n8\nNINE\n";
        seed(dir.path(), "src/sdk/n.txt", target);
        let m = mapping();
        let applier = PatchApplier::new(dir.path(), &m, Direction::Forward);
        let p = patch(vec![file("n.txt", ChangeKind::Modify, Some(base), Some(source))]);

        let result = applier
            .apply(&p, &BTreeSet::new(), &CancellationToken::new())
            .unwrap();
        assert!(!result.has_conflicts());
        assert_eq!(
            std::fs::read(dir.path().join("src/sdk/n.txt")).unwrap(),
            b"1\nTWO\n3\n4\n5\n6\n7\n8\nNINE\n"
        );
    }

    #[test]
    fn test_text_conflict_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "src/sdk/a.txt", b"mine\n");
        let m = mapping();
        let applier = PatchApplier::new(dir.path(), &m, Direction::Forward);
        let p = patch(vec![file("a.txt", ChangeKind::Modify, Some(b"base\n"), Some(b"theirs\n"))]);

        let result = applier
            .apply(&p, &BTreeSet::new(), &CancellationToken::new())
            .unwrap();
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].kind, ConflictKind::TextConflict);
        assert_eq!(std::fs::read(dir.path().join("src/sdk/a.txt")).unwrap(), b"mine\n");
    }

    #[test]
    fn test_delete_edit_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "src/sdk/edited.txt", b"changed in target\n");
        let m = mapping();
        let applier = PatchApplier::new(dir.path(), &m, Direction::Forward);
        let p = patch(vec![
            file("edited.txt", ChangeKind::Delete, Some(b"original\n"), None),
            file("gone.txt", ChangeKind::Modify, Some(b"x\n"), Some(b"y\n")),
        ]);

        let result = applier
            .apply(&p, &BTreeSet::new(), &CancellationToken::new())
            .unwrap();
        assert_eq!(result.conflicts.len(), 2);
        assert_eq!(result.conflicts[0].kind, ConflictKind::DeleteEdit);
        assert_eq!(result.conflicts[0].deleted_in, Some(Side::Source));
        assert_eq!(result.conflicts[1].deleted_in, Some(Side::Target));
        assert!(dir.path().join("src/sdk/edited.txt").exists());
    }

    #[test]
    fn test_matching_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "src/sdk/old.txt", b"old\n");
        let m = mapping();
        let applier = PatchApplier::new(dir.path(), &m, Direction::Forward);
        let p = patch(vec![file("old.txt", ChangeKind::Delete, Some(b"old\n"), None)]);
        let result = applier
            .apply(&p, &BTreeSet::new(), &CancellationToken::new())
            .unwrap();
        assert!(!result.has_conflicts());
        assert!(!dir.path().join("src/sdk/old.txt").exists());
    }

    #[test]
    fn test_out_of_scope_paths_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let m = mapping();
        let applier = PatchApplier::new(dir.path(), &m, Direction::Forward);
        let mut escaping = file("x.txt", ChangeKind::Add, None, Some(b"x\n"));
        escaping.path = "src/sdk/../../etc/x.txt".into();
        let mut outside = file("y.txt", ChangeKind::Add, None, Some(b"y\n"));
        outside.path = "src/other/y.txt".into();
        let excluded = file("docs/z.md", ChangeKind::Add, None, Some(b"z\n"));

        let result = applier
            .apply(&patch(vec![escaping, outside, excluded]), &BTreeSet::new(), &CancellationToken::new())
            .unwrap();
        assert_eq!(result.conflicts.len(), 3);
        assert!(result.conflicts.iter().all(|c| c.kind == ConflictKind::OutOfScope));
        assert!(!dir.path().join("src/other/y.txt").exists());
        assert!(!dir.path().join("src/sdk/docs/z.md").exists());
    }

    #[test]
    fn test_rename_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "src/sdk/old.txt", b"same\n");
        let m = mapping();
        let applier = PatchApplier::new(dir.path(), &m, Direction::Forward);
        let rename = file(
            "new.txt",
            ChangeKind::Rename {
                from: "src/sdk/old.txt".into(),
            },
            Some(b"same\n"),
            Some(b"same\n"),
        );
        let result = applier
            .apply(&patch(vec![rename]), &BTreeSet::new(), &CancellationToken::new())
            .unwrap();
        assert!(!result.has_conflicts());
        assert!(!dir.path().join("src/sdk/old.txt").exists());
        assert_eq!(std::fs::read(dir.path().join("src/sdk/new.txt")).unwrap(), b"same\n");
    }

    #[test]
    fn test_skip_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let m = mapping();
        let applier = PatchApplier::new(dir.path(), &m, Direction::Forward);
        let p = patch(vec![
            file("a.txt", ChangeKind::Add, None, Some(b"a\n")),
            file("b.txt", ChangeKind::Add, None, Some(b"b\n")),
        ]);

        let skip: BTreeSet<String> = ["src/sdk/a.txt".to_string()].into();
        let result = applier.apply(&p, &skip, &CancellationToken::new()).unwrap();
        assert_eq!(result.applied_files, vec!["src/sdk/b.txt".to_string()]);
        assert!(!dir.path().join("src/sdk/a.txt").exists());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = applier.apply(&p, &BTreeSet::new(), &cancel).unwrap_err();
        assert!(matches!(err, PatchError::Cancelled { applied: 0 }));
    }

    #[cfg(unix)]
    #[test]
    fn test_modes_applied() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "src/sdk/tool.sh", b"#!/bin/sh\n");
        let m = mapping();
        let applier = PatchApplier::new(dir.path(), &m, Direction::Forward);

        let mut script = file("run.sh", ChangeKind::Add, None, Some(b"#!/bin/sh\necho\n"));
        script.new_mode = EntryMode::Executable;
        let mut link = file("latest", ChangeKind::Add, None, Some(b"run.sh"));
        link.new_mode = EntryMode::Symlink;
        let mut chmod = file(
            "tool.sh",
            ChangeKind::Modify,
            Some(b"#!/bin/sh\n"),
            Some(b"#!/bin/sh\n"),
        );
        chmod.new_mode = EntryMode::Executable;

        let result = applier
            .apply(&patch(vec![script, link, chmod]), &BTreeSet::new(), &CancellationToken::new())
            .unwrap();
        assert!(!result.has_conflicts());
        assert_eq!(result.applied_files.len(), 3);

        let mode = |rel: &str| {
            std::fs::metadata(dir.path().join(rel)).unwrap().permissions().mode() & 0o111
        };
        assert_ne!(mode("src/sdk/run.sh"), 0);
        assert_ne!(mode("src/sdk/tool.sh"), 0);
        let latest = dir.path().join("src/sdk/latest");
        assert!(std::fs::symlink_metadata(&latest).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_link(&latest).unwrap(), Path::new("run.sh"));

        // Back to a regular file.
        let mut plain = file("tool.sh", ChangeKind::Modify, Some(b"#!/bin/sh\n"), Some(b"#!/bin/sh\n"));
        plain.old_mode = EntryMode::Executable;
        applier
            .apply(&patch(vec![plain]), &BTreeSet::new(), &CancellationToken::new())
            .unwrap();
        assert_eq!(mode("src/sdk/tool.sh"), 0);
    }
}
