//! Builds a [`Patch`] from two commits of a mapping's source repository.
//!
//! Forward patches diff the product repository from its root and land under
//! the mapping's VMR subtree. Back patches diff only the VMR subtree and land
//! at the repository root. Either way every path is evaluated against the
//! mapping's [`PathFilter`](crate::mapping::PathFilter) on its
//! repository-relative form, submodule contents are dropped, and the
//! resulting files are ordered by the first commit in the range that touched
//! them.

use std::collections::HashMap;

use tracing::{debug, info, instrument};

use crate::errors::PatchError;
use crate::git::{ChangeStatus, EntryMode, GitClient, TreeChange};
use crate::mapping::Mapping;
use crate::models::Direction;

use super::{ChangeKind, FilePatch, Patch, SubmodulePointer};

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_LEN: usize = 8000;

/// Builds patches for one mapping from a source repository.
pub struct PatchBuilder<'a> {
    git: &'a GitClient,
    mapping: &'a Mapping,
    direction: Direction,
}

impl<'a> PatchBuilder<'a> {
    /// `git` must hold the *source* repository of the flow: the product
    /// repository for forward flow, the VMR for back flow.
    pub fn new(git: &'a GitClient, mapping: &'a Mapping, direction: Direction) -> Self {
        Self {
            git,
            mapping,
            direction,
        }
    }

    /// Diff `from..to`. `from = None` builds a full import of the tree at `to`.
    #[instrument(skip(self), fields(mapping = %self.mapping.name, direction = %self.direction))]
    pub fn build(&self, from: Option<&str>, to: &str) -> Result<Patch, PatchError> {
        let to_sha = self.git.resolve_commit(to)?.to_string();
        let from_sha = match from {
            Some(f) => Some(self.git.resolve_commit(f)?.to_string()),
            None => None,
        };

        let changes = self
            .git
            .diff_tree(from_sha.as_deref(), &to_sha, self.pathspec())?;

        let mut files = Vec::new();
        let mut submodules = Vec::new();
        for change in changes {
            self.collect(change, &mut files, &mut submodules)?;
        }

        if let Some(ref base) = from_sha {
            let order = self.first_touch_order(base, &to_sha)?;
            files.sort_by(|a, b| {
                let ka = order.get(&a.repo_path).copied().unwrap_or(usize::MAX);
                let kb = order.get(&b.repo_path).copied().unwrap_or(usize::MAX);
                ka.cmp(&kb).then_with(|| a.path.cmp(&b.path))
            });
        }
        submodules.sort_by(|a: &SubmodulePointer, b| a.path.cmp(&b.path));

        info!(
            base = from_sha.as_deref().unwrap_or("<none>"),
            source = %to_sha,
            files = files.len(),
            submodules = submodules.len(),
            "patch built"
        );

        Ok(Patch {
            mapping: self.mapping.name.clone(),
            direction: self.direction,
            base_sha: from_sha,
            source_sha: to_sha,
            files,
            submodules,
        })
    }

    fn pathspec(&self) -> Option<&str> {
        match self.direction {
            Direction::Forward => None,
            Direction::Backward => Some(self.mapping.vmr_path.as_str()),
        }
    }

    /// Source-repository path -> repository-relative path, or `None` when the
    /// path is outside the mapping.
    fn repo_path<'p>(&self, source_path: &'p str) -> Option<&'p str> {
        match self.direction {
            Direction::Forward => Some(source_path),
            Direction::Backward => self.mapping.from_vmr_path(source_path),
        }
    }

    /// Repository-relative path -> target working copy path.
    fn target_path(&self, repo_path: &str) -> String {
        match self.direction {
            Direction::Forward => self.mapping.to_vmr_path(repo_path),
            Direction::Backward => repo_path.to_string(),
        }
    }

    fn in_scope(&self, repo_path: &str) -> bool {
        let decision = self.mapping.filter().evaluate(repo_path);
        if !decision.in_scope() {
            debug!(path = repo_path, decision = decision.label(), "path left out of patch");
        }
        decision.in_scope()
    }

    fn collect(
        &self,
        change: TreeChange,
        files: &mut Vec<FilePatch>,
        submodules: &mut Vec<SubmodulePointer>,
    ) -> Result<(), PatchError> {
        let old = change.old_path.as_deref().and_then(|p| self.repo_path(p));
        let new = change.new_path.as_deref().and_then(|p| self.repo_path(p));

        if change.gitlink {
            if self.mapping.submodule_pointers {
                if let Some(path) = new.or(old) {
                    let sha = if change.status == ChangeStatus::Deleted {
                        None
                    } else {
                        change.new_id.clone()
                    };
                    debug!(path, ?sha, "submodule pointer change");
                    submodules.push(SubmodulePointer {
                        path: path.to_string(),
                        sha,
                    });
                }
            }
            return Ok(());
        }

        let old = old.filter(|p| self.in_scope(p));
        let new = new.filter(|p| self.in_scope(p));
        let old_side = (change.old_id.as_deref(), change.old_mode);
        let new_side = (change.new_id.as_deref(), change.new_mode);
        let absent = (None, EntryMode::Regular);

        let file = match (change.status, old, new) {
            (ChangeStatus::Added, _, Some(path)) => {
                self.file_patch(path, ChangeKind::Add, absent, new_side)?
            }
            (ChangeStatus::Modified, _, Some(path)) => {
                self.file_patch(path, ChangeKind::Modify, old_side, new_side)?
            }
            (ChangeStatus::Deleted, Some(path), _) => {
                self.file_patch(path, ChangeKind::Delete, old_side, absent)?
            }
            (ChangeStatus::Renamed, Some(from), Some(to)) => self.file_patch(
                to,
                ChangeKind::Rename {
                    from: self.target_path(from),
                },
                old_side,
                new_side,
            )?,
            // A rename across the filter boundary degrades to the half that
            // is in scope.
            (ChangeStatus::Renamed, None, Some(to)) => {
                self.file_patch(to, ChangeKind::Add, absent, new_side)?
            }
            (ChangeStatus::Renamed, Some(from), None) => {
                self.file_patch(from, ChangeKind::Delete, old_side, absent)?
            }
            _ => return Ok(()),
        };
        files.push(file);
        Ok(())
    }

    /// `old` and `new` are the blob id and mode on each side.
    fn file_patch(
        &self,
        repo_path: &str,
        change: ChangeKind,
        (old_id, old_mode): (Option<&str>, EntryMode),
        (new_id, new_mode): (Option<&str>, EntryMode),
    ) -> Result<FilePatch, PatchError> {
        let old_content = match old_id {
            Some(id) => Some(self.git.read_blob(id)?),
            None => None,
        };
        let new_content = match new_id {
            Some(id) => Some(self.git.read_blob(id)?),
            None => None,
        };

        let binary = old_content.as_deref().is_some_and(is_binary)
            || new_content.as_deref().is_some_and(is_binary);

        let diff = match (&change, binary, &new_content) {
            (ChangeKind::Delete, _, _) | (_, true, _) | (_, _, None) => None,
            (_, false, Some(new)) => {
                let old = old_content.as_deref().unwrap_or_default();
                Some(
                    diffy::create_patch(&String::from_utf8_lossy(old), &String::from_utf8_lossy(new))
                        .to_string(),
                )
            }
        };

        Ok(FilePatch {
            path: self.target_path(repo_path),
            repo_path: repo_path.to_string(),
            change,
            old_id: old_id.map(String::from),
            new_id: new_id.map(String::from),
            binary,
            old_mode,
            new_mode,
            diff,
            content: new_content,
        })
    }

    /// Index of the first commit in `base..to` touching each
    /// repository-relative path.
    fn first_touch_order(&self, base: &str, to: &str) -> Result<HashMap<String, usize>, PatchError> {
        let mut order = HashMap::new();
        for (i, commit) in self.git.commits_between(Some(base), to)?.iter().enumerate() {
            for path in self.git.changed_paths(&commit.sha, self.pathspec())? {
                if let Some(repo_path) = self.repo_path(&path) {
                    order.entry(repo_path.to_string()).or_insert(i);
                }
            }
        }
        Ok(order)
    }
}

/// Content is treated as binary if it has a NUL byte near the start or is
/// not valid UTF-8.
pub fn is_binary(content: &[u8]) -> bool {
    let head = &content[..content.len().min(BINARY_SNIFF_LEN)];
    head.contains(&0) || std::str::from_utf8(content).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MappingConfig;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn mapping(exclude: &[&str], submodules: &[&str], pointers: bool) -> Mapping {
        Mapping::from_config(&MappingConfig {
            name: "sdk".into(),
            vmr_path: Some("src/sdk".into()),
            default_remote: "/srv/sdk".into(),
            default_ref: "main".into(),
            include: vec![],
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            submodules: submodules.iter().map(|s| s.to_string()).collect(),
            submodule_pointers: pointers,
            delete_wins: false,
            generated_files: vec![],
            version_floors: BTreeMap::new(),
        })
        .unwrap()
    }

    fn write(dir: &Path, rel: &str, content: &[u8]) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn repo() -> (tempfile::TempDir, GitClient) {
        let dir = tempfile::tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let client = GitClient::new(dir.path()).unwrap();
        (dir, client)
    }

    #[test]
    fn test_forward_full_import_respects_exclude() {
        let (dir, git) = repo();
        write(dir.path(), "src/a.txt", b"hello\n");
        write(dir.path(), "docs/readme.md", b"docs\n");
        let c1 = git.commit_all("c1", "T", "t@t.com").unwrap().unwrap();

        let m = mapping(&["docs/**"], &[], false);
        let patch = PatchBuilder::new(&git, &m, Direction::Forward).build(None, &c1).unwrap();
        assert!(patch.base_sha.is_none());
        assert_eq!(patch.files.len(), 1);
        assert_eq!(patch.files[0].path, "src/sdk/src/a.txt");
        assert_eq!(patch.files[0].repo_path, "src/a.txt");
        assert_eq!(patch.files[0].change, ChangeKind::Add);
        assert_eq!(patch.files[0].content.as_deref(), Some(&b"hello\n"[..]));
    }

    #[test]
    fn test_build_is_deterministic() {
        let (dir, git) = repo();
        write(dir.path(), "a.txt", b"1\n");
        let c1 = git.commit_all("c1", "T", "t@t.com").unwrap().unwrap();
        write(dir.path(), "a.txt", b"2\n");
        write(dir.path(), "b.bin", &[0, 1, 2]);
        let c2 = git.commit_all("c2", "T", "t@t.com").unwrap().unwrap();

        let m = mapping(&[], &[], false);
        let builder = PatchBuilder::new(&git, &m, Direction::Forward);
        let p1 = builder.build(Some(&c1), &c2).unwrap();
        let p2 = builder.build(Some(&c1), &c2).unwrap();
        assert_eq!(p1.fingerprint().unwrap(), p2.fingerprint().unwrap());
        assert!(p1.files.iter().any(|f| f.binary && f.diff.is_none()));
    }

    #[test]
    fn test_files_ordered_by_first_touch() {
        let (dir, git) = repo();
        write(dir.path(), "seed.txt", b"seed\n");
        let base = git.commit_all("base", "T", "t@t.com").unwrap().unwrap();
        write(dir.path(), "z.txt", b"z\n");
        git.commit_all("z first", "T", "t@t.com").unwrap();
        write(dir.path(), "a.txt", b"a\n");
        let tip = git.commit_all("a second", "T", "t@t.com").unwrap().unwrap();

        let m = mapping(&[], &[], false);
        let patch = PatchBuilder::new(&git, &m, Direction::Forward)
            .build(Some(&base), &tip)
            .unwrap();
        let paths: Vec<&str> = patch.files.iter().map(|f| f.repo_path.as_str()).collect();
        assert_eq!(paths, vec!["z.txt", "a.txt"]);
    }

    #[test]
    fn test_backward_strips_subtree_and_ignores_outside() {
        let (dir, vmr) = repo();
        write(dir.path(), "src/sdk/lib.rs", b"fn a() {}\n");
        write(dir.path(), "src/runtime/x.rs", b"x\n");
        write(dir.path(), "src/source-manifest.json", b"{}\n");
        let v1 = vmr.commit_all("v1", "T", "t@t.com").unwrap().unwrap();

        let m = mapping(&[], &[], false);
        let patch = PatchBuilder::new(&vmr, &m, Direction::Backward).build(None, &v1).unwrap();
        assert_eq!(patch.files.len(), 1);
        assert_eq!(patch.files[0].path, "lib.rs");
        assert_eq!(patch.files[0].repo_path, "lib.rs");
    }

    #[test]
    fn test_rename_out_of_scope_becomes_delete() {
        let (dir, git) = repo();
        let body = b"one\ntwo\nthree\nfour\nfive\n";
        write(dir.path(), "src/keep.txt", body);
        let c1 = git.commit_all("c1", "T", "t@t.com").unwrap().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::rename(dir.path().join("src/keep.txt"), dir.path().join("docs/keep.txt")).unwrap();
        let c2 = git.commit_all("c2", "T", "t@t.com").unwrap().unwrap();

        let m = mapping(&["docs/**"], &[], false);
        let patch = PatchBuilder::new(&git, &m, Direction::Forward)
            .build(Some(&c1), &c2)
            .unwrap();
        assert_eq!(patch.files.len(), 1);
        assert_eq!(patch.files[0].change, ChangeKind::Delete);
        assert_eq!(patch.files[0].repo_path, "src/keep.txt");
    }

    #[test]
    fn test_submodule_content_never_flowed() {
        let (dir, git) = repo();
        write(dir.path(), "external/zlib/inflate.c", b"int x;\n");
        write(dir.path(), "src/a.c", b"int y;\n");
        let c1 = git.commit_all("c1", "T", "t@t.com").unwrap().unwrap();

        let m = mapping(&[], &["external/zlib"], true);
        let patch = PatchBuilder::new(&git, &m, Direction::Forward).build(None, &c1).unwrap();
        assert_eq!(patch.files.len(), 1);
        assert_eq!(patch.files[0].repo_path, "src/a.c");
        // Plain files below a submodule path are not pointers.
        assert!(patch.submodules.is_empty());
    }

    #[cfg(unix)]
    fn set_executable(dir: &Path, rel: &str, executable: bool) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(rel);
        let mode = if executable { 0o755 } else { 0o644 };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_file_modes_recorded() {
        let (dir, git) = repo();
        write(dir.path(), "build.sh", b"#!/bin/sh\necho hi\n");
        set_executable(dir.path(), "build.sh", true);
        std::os::unix::fs::symlink("build.sh", dir.path().join("run.sh")).unwrap();
        let c1 = git.commit_all("c1", "T", "t@t.com").unwrap().unwrap();

        let m = mapping(&[], &[], false);
        let builder = PatchBuilder::new(&git, &m, Direction::Forward);
        let import = builder.build(None, &c1).unwrap();
        let script = import.files.iter().find(|f| f.repo_path == "build.sh").unwrap();
        assert_eq!(script.new_mode, EntryMode::Executable);
        let link = import.files.iter().find(|f| f.repo_path == "run.sh").unwrap();
        assert_eq!(link.new_mode, EntryMode::Symlink);
        assert_eq!(link.content.as_deref(), Some(&b"build.sh"[..]));

        // Dropping the executable bit alone is still a change.
        set_executable(dir.path(), "build.sh", false);
        let c2 = git.commit_all("c2", "T", "t@t.com").unwrap().unwrap();
        let patch = builder.build(Some(&c1), &c2).unwrap();
        assert_eq!(patch.files.len(), 1);
        assert_eq!(patch.files[0].change, ChangeKind::Modify);
        assert_eq!(patch.files[0].old_mode, EntryMode::Executable);
        assert_eq!(patch.files[0].new_mode, EntryMode::Regular);
        assert_eq!(patch.files[0].old_id, patch.files[0].new_id);
    }

    #[test]
    fn test_is_binary() {
        assert!(is_binary(&[0x00, 0x01]));
        assert!(is_binary(&[0xff, 0xfe, 0xfd]));
        assert!(!is_binary("plain text\n".as_bytes()));
    }
}
