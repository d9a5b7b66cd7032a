//! Local Git repository operations via `git2`.
//!
//! This is the plumbing the flowers depend on: clone/fetch into caches and
//! scratch working copies, tree diffs between two commits, history walks,
//! branch checkout, commit, reset, and push.

use std::path::{Path, PathBuf};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Cred, Delta, DiffFindOptions, DiffOptions, FetchOptions, FileMode, IndexAddOption, ObjectType,
    Oid, PushOptions, RemoteCallbacks, Repository, ResetType, Signature, Sort, Status,
    StatusOptions,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::GitError;

/// Fetch every branch and tag so any reachable source commit resolves.
const FETCH_REFSPECS: [&str; 2] = [
    "+refs/heads/*:refs/remotes/origin/*",
    "+refs/tags/*:refs/tags/*",
];

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

/// Information about a single Git commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitInfo {
    pub sha: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub parents: Vec<String>,
}

/// How a path changed between two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// Kind of a blob entry in a tree.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    #[default]
    Regular,
    Executable,
    Symlink,
}

impl EntryMode {
    pub fn from_git(mode: FileMode) -> Self {
        match mode {
            FileMode::BlobExecutable => Self::Executable,
            FileMode::Link => Self::Symlink,
            _ => Self::Regular,
        }
    }

    /// Octal mode as git prints it.
    pub fn octal(&self) -> &'static str {
        match self {
            Self::Regular => "100644",
            Self::Executable => "100755",
            Self::Symlink => "120000",
        }
    }
}

/// One entry of a tree-to-tree diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub status: ChangeStatus,
    /// Path before the change (`None` for additions).
    pub old_path: Option<String>,
    /// Path after the change (`None` for deletions).
    pub new_path: Option<String>,
    pub old_id: Option<String>,
    pub new_id: Option<String>,
    /// Either side is a submodule pointer (gitlink).
    pub gitlink: bool,
    pub old_mode: EntryMode,
    pub new_mode: EntryMode,
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        debug!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Clone a remote repository with a working tree to `path`.
    #[instrument(skip(token), fields(url = %url, path = %path.display()))]
    pub fn clone_repo(url: &str, path: &Path, token: Option<&str>) -> Result<Self, GitError> {
        info!("cloning git repository");
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_options(token));
        let repo = builder.clone(url, path).map_err(|e| unavailable(url, e))?;
        info!("clone completed");
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Open a bare cache of `url` at `path`, cloning it first if needed,
    /// and bring it up to date.
    #[instrument(skip(token), fields(url = %url, path = %path.display()))]
    pub fn open_or_clone_cache(
        url: &str,
        path: &Path,
        token: Option<&str>,
    ) -> Result<Self, GitError> {
        if path.exists() {
            let client = Self::new(path)?;
            client.fetch("origin", token)?;
            return Ok(client);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("creating repository cache");
        let mut builder = RepoBuilder::new();
        builder.bare(true);
        builder.fetch_options(fetch_options(token));
        let repo = builder.clone(url, path).map_err(|e| unavailable(url, e))?;
        let client = Self {
            repo,
            repo_path: path.to_path_buf(),
        };
        client.fetch("origin", token)?;
        Ok(client)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Fetch all branches and tags from a named remote.
    #[instrument(skip(self, token))]
    pub fn fetch(&self, remote_name: &str, token: Option<&str>) -> Result<(), GitError> {
        let mut remote = self.repo.find_remote(remote_name)?;
        let url = remote.url().unwrap_or(remote_name).to_string();
        let mut opts = fetch_options(token);
        remote
            .fetch(&FETCH_REFSPECS, Some(&mut opts), None)
            .map_err(|e| unavailable(&url, e))?;
        debug!(remote = remote_name, "fetch completed");
        Ok(())
    }

    /// Resolve a SHA, branch, or other revision to a commit id.
    pub fn resolve_commit(&self, rev: &str) -> Result<Oid, GitError> {
        self.repo
            .revparse_single(rev)
            .and_then(|obj| obj.peel_to_commit())
            .map(|c| c.id())
            .map_err(|_| GitError::RefNotFound(rev.to_string()))
    }

    /// `true` if `ancestor` is `descendant` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let a = self.resolve_commit(ancestor)?;
        let d = self.resolve_commit(descendant)?;
        if a == d {
            return Ok(true);
        }
        Ok(self.repo.graph_descendant_of(d, a)?)
    }

    /// Return the SHA of HEAD.
    pub fn get_head_sha(&self) -> Result<String, GitError> {
        let head = self.repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// `true` if `origin/<branch>` exists locally.
    pub fn has_remote_branch(&self, branch: &str) -> bool {
        self.repo
            .find_reference(&format!("refs/remotes/origin/{}", branch))
            .is_ok()
    }

    /// Create (or reset) local branch `name` at `start` and check it out.
    #[instrument(skip(self))]
    pub fn checkout_new_branch(&self, name: &str, start: &str) -> Result<String, GitError> {
        let oid = self.resolve_commit(start)?;
        let commit = self.repo.find_commit(oid)?;
        self.repo.branch(name, &commit, true)?;
        self.repo
            .checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
        self.repo.set_head(&format!("refs/heads/{}", name))?;
        info!(name, start, sha = %oid, "checked out working branch");
        Ok(oid.to_string())
    }

    /// Stage every change in the working tree (including deletions) and
    /// commit it on HEAD. Returns `None` when the tree is unchanged.
    #[instrument(skip(self, message))]
    pub fn commit_all(
        &self,
        message: &str,
        committer_name: &str,
        committer_email: &str,
    ) -> Result<Option<String>, GitError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_oid = index.write_tree()?;

        let parent_commit = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        if let Some(ref parent) = parent_commit {
            if parent.tree_id() == tree_oid {
                debug!("nothing to commit");
                return Ok(None);
            }
        }

        let tree = self.repo.find_tree(tree_oid)?;
        let signature = Signature::now(committer_name, committer_email)?;
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(Some(oid.to_string()))
    }

    /// `true` if the working tree differs from HEAD (untracked files count).
    pub fn has_changes(&self) -> Result<bool, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Discard every working tree change: hard reset to HEAD and remove
    /// untracked files.
    #[instrument(skip(self))]
    pub fn reset_hard(&self) -> Result<(), GitError> {
        let head = self.repo.head()?.peel_to_commit()?;
        self.repo.reset(
            head.as_object(),
            ResetType::Hard,
            Some(CheckoutBuilder::new().force()),
        )?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        let workdir = self
            .repo
            .workdir()
            .ok_or_else(|| GitError::RepositoryNotFound(self.repo_path.display().to_string()))?;
        for entry in statuses.iter() {
            if entry.status().contains(Status::WT_NEW) {
                if let Some(path) = entry.path() {
                    let full = workdir.join(path);
                    if full.is_dir() {
                        std::fs::remove_dir_all(&full)?;
                    } else {
                        std::fs::remove_file(&full)?;
                    }
                }
            }
        }
        info!("working copy rolled back");
        Ok(())
    }

    /// Push a local branch to a remote.
    #[instrument(skip(self, token))]
    pub fn push(
        &self,
        remote_name: &str,
        branch: &str,
        token: Option<&str>,
        force: bool,
    ) -> Result<(), GitError> {
        info!(remote = remote_name, branch, force, "pushing");
        let mut remote = self.repo.find_remote(remote_name)?;
        let url = remote.url().unwrap_or(remote_name).to_string();
        let mut callbacks = remote_callbacks(token);

        let push_error = std::sync::Arc::new(std::sync::Mutex::new(None::<String>));
        let push_error_clone = push_error.clone();
        callbacks.push_update_reference(move |refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                if let Ok(mut slot) = push_error_clone.lock() {
                    *slot = Some(msg.to_string());
                }
            }
            Ok(())
        });

        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);
        let refspec = format!(
            "{}refs/heads/{}:refs/heads/{}",
            if force { "+" } else { "" },
            branch,
            branch
        );
        remote
            .push(&[&refspec], Some(&mut push_opts))
            .map_err(|e| unavailable(&url, e))?;

        let rejected = push_error.lock().ok().and_then(|mut slot| slot.take());
        if let Some(detail) = rejected {
            return Err(GitError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }
        info!("push completed");
        Ok(())
    }

    /// Commits reachable from `to` but not from `from`, oldest first.
    pub fn commits_between(
        &self,
        from: Option<&str>,
        to: &str,
    ) -> Result<Vec<GitCommitInfo>, GitError> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(self.resolve_commit(to)?)?;
        if let Some(from) = from {
            revwalk.hide(self.resolve_commit(from)?)?;
        }
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;

        let mut commits = Vec::new();
        for oid_result in revwalk {
            let oid = oid_result?;
            let commit = self.repo.find_commit(oid)?;
            commits.push(GitCommitInfo {
                sha: oid.to_string(),
                message: commit.message().unwrap_or("").to_string(),
                author_name: commit.author().name().unwrap_or("").to_string(),
                author_email: commit.author().email().unwrap_or("").to_string(),
                parents: commit.parent_ids().map(|p| p.to_string()).collect(),
            });
        }
        debug!(count = commits.len(), "collected commits");
        Ok(commits)
    }

    /// Paths a commit changed relative to its first parent, optionally
    /// limited to `prefix`.
    pub fn changed_paths(&self, sha: &str, prefix: Option<&str>) -> Result<Vec<String>, GitError> {
        let commit = self.repo.find_commit(self.resolve_commit(sha)?)?;
        let parent = match commit.parent_count() {
            0 => None,
            _ => Some(commit.parent(0)?.id().to_string()),
        };
        let mut paths = Vec::new();
        for change in self.diff_tree(parent.as_deref(), sha, prefix)? {
            for path in [change.old_path, change.new_path].into_iter().flatten() {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    /// Diff the trees of two commits. `from = None` diffs against the empty
    /// tree. Renames are detected; results are ordered by path.
    #[instrument(skip(self))]
    pub fn diff_tree(
        &self,
        from: Option<&str>,
        to: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<TreeChange>, GitError> {
        let new_tree = self.repo.find_commit(self.resolve_commit(to)?)?.tree()?;
        let old_tree = match from {
            Some(f) => Some(self.repo.find_commit(self.resolve_commit(f)?)?.tree()?),
            None => None,
        };

        let mut opts = DiffOptions::new();
        opts.include_typechange(true);
        if let Some(p) = prefix {
            opts.pathspec(p);
        }
        let mut diff =
            self.repo
                .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))?;
        let mut find = DiffFindOptions::new();
        find.renames(true);
        diff.find_similar(Some(&mut find))?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            let status = match delta.status() {
                Delta::Added | Delta::Copied => ChangeStatus::Added,
                Delta::Deleted => ChangeStatus::Deleted,
                Delta::Renamed => ChangeStatus::Renamed,
                Delta::Modified | Delta::Typechange => ChangeStatus::Modified,
                _ => continue,
            };
            let old = delta.old_file();
            let new = delta.new_file();
            let path_of = |f: &git2::DiffFile<'_>| {
                f.path().map(|p| p.to_string_lossy().replace('\\', "/"))
            };
            let id_of = |f: &git2::DiffFile<'_>| (!f.id().is_zero()).then(|| f.id().to_string());

            changes.push(TreeChange {
                status,
                old_path: if status == ChangeStatus::Added { None } else { path_of(&old) },
                new_path: if status == ChangeStatus::Deleted { None } else { path_of(&new) },
                old_id: id_of(&old),
                new_id: id_of(&new),
                gitlink: old.mode() == FileMode::Commit || new.mode() == FileMode::Commit,
                old_mode: EntryMode::from_git(old.mode()),
                new_mode: EntryMode::from_git(new.mode()),
            });
        }
        debug!(count = changes.len(), "tree diff computed");
        Ok(changes)
    }

    /// Raw content of a blob.
    pub fn read_blob(&self, id: &str) -> Result<Vec<u8>, GitError> {
        let oid = Oid::from_str(id)?;
        let blob = self.repo.find_blob(oid)?;
        Ok(blob.content().to_vec())
    }
}

/// Git blob id of `content`, as `git hash-object` would compute it.
pub fn blob_id(content: &[u8]) -> Result<String, GitError> {
    Ok(Oid::hash_object(ObjectType::Blob, content)?.to_string())
}

fn remote_callbacks(token: Option<&str>) -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(tok) = token {
        let tok = tok.to_string();
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext("x-access-token", &tok)
        });
    }
    callbacks
}

fn fetch_options(token: Option<&str>) -> FetchOptions<'static> {
    let mut fetch_opts = FetchOptions::new();
    fetch_opts.remote_callbacks(remote_callbacks(token));
    fetch_opts
}

fn unavailable(remote: &str, e: git2::Error) -> GitError {
    warn!(remote, error = %e, "remote unavailable");
    GitError::RemoteUnavailable {
        remote: remote.to_string(),
        detail: e.message().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) -> GitClient {
        Repository::init(dir).unwrap();
        GitClient::new(dir).unwrap()
    }

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_commit_all_stages_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let client = init_repo(dir.path());
        write(dir.path(), "a.txt", "a");
        write(dir.path(), "b.txt", "b");
        let first = client.commit_all("init", "T", "t@t.com").unwrap().unwrap();

        std::fs::remove_file(dir.path().join("b.txt")).unwrap();
        assert!(client.has_changes().unwrap());
        let second = client.commit_all("delete b", "T", "t@t.com").unwrap().unwrap();

        let changes = client.diff_tree(Some(&first), &second, None).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].status, ChangeStatus::Deleted);
        assert_eq!(changes[0].old_path.as_deref(), Some("b.txt"));
        assert!(client.commit_all("empty", "T", "t@t.com").unwrap().is_none());
    }

    #[test]
    fn test_diff_tree_detects_rename_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let client = init_repo(dir.path());
        let body = "line one\nline two\nline three\nline four\n";
        write(dir.path(), "src/sdk/old.txt", body);
        write(dir.path(), "src/other/x.txt", "x");
        let first = client.commit_all("init", "T", "t@t.com").unwrap().unwrap();

        std::fs::rename(dir.path().join("src/sdk/old.txt"), dir.path().join("src/sdk/new.txt"))
            .unwrap();
        write(dir.path(), "src/other/x.txt", "y");
        let second = client.commit_all("rename", "T", "t@t.com").unwrap().unwrap();

        let changes = client.diff_tree(Some(&first), &second, Some("src/sdk")).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].status, ChangeStatus::Renamed);
        assert_eq!(changes[0].old_path.as_deref(), Some("src/sdk/old.txt"));
        assert_eq!(changes[0].new_path.as_deref(), Some("src/sdk/new.txt"));

        let full = client.diff_tree(None, &second, None).unwrap();
        assert!(full.iter().all(|c| c.status == ChangeStatus::Added));
        assert_eq!(full.len(), 2);
    }

    #[test]
    fn test_history_queries() {
        let dir = tempfile::tempdir().unwrap();
        let client = init_repo(dir.path());
        write(dir.path(), "a.txt", "1");
        let c1 = client.commit_all("one", "T", "t@t.com").unwrap().unwrap();
        write(dir.path(), "b.txt", "2");
        let c2 = client.commit_all("two", "T", "t@t.com").unwrap().unwrap();
        write(dir.path(), "a.txt", "3");
        let c3 = client.commit_all("three", "T", "t@t.com").unwrap().unwrap();

        assert!(client.is_ancestor(&c1, &c3).unwrap());
        assert!(!client.is_ancestor(&c3, &c1).unwrap());
        assert!(client.is_ancestor(&c2, &c2).unwrap());

        let range = client.commits_between(Some(&c1), &c3).unwrap();
        let shas: Vec<&str> = range.iter().map(|c| c.sha.as_str()).collect();
        assert_eq!(shas, vec![c2.as_str(), c3.as_str()]);
        assert_eq!(client.changed_paths(&c3, None).unwrap(), vec!["a.txt"]);
        assert!(matches!(
            client.resolve_commit("0000000000000000000000000000000000000001"),
            Err(GitError::RefNotFound(_))
        ));
    }

    #[test]
    fn test_reset_hard_removes_untracked() {
        let dir = tempfile::tempdir().unwrap();
        let client = init_repo(dir.path());
        write(dir.path(), "a.txt", "1");
        client.commit_all("one", "T", "t@t.com").unwrap();
        write(dir.path(), "a.txt", "changed");
        write(dir.path(), "new/b.txt", "untracked");

        client.reset_hard().unwrap();
        assert!(!client.has_changes().unwrap());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "1");
        assert!(!dir.path().join("new/b.txt").exists());
    }

    #[test]
    fn test_clone_branch_and_push() {
        let seed_dir = tempfile::tempdir().unwrap();
        let seed = init_repo(seed_dir.path());
        write(seed_dir.path(), "a.txt", "1");
        let base = seed.commit_all("one", "T", "t@t.com").unwrap().unwrap();

        // Pushes only land in bare repositories.
        let origin_dir = tempfile::tempdir().unwrap();
        let origin_path = origin_dir.path().join("origin.git");
        RepoBuilder::new()
            .bare(true)
            .clone(seed_dir.path().to_str().unwrap(), &origin_path)
            .unwrap();
        let origin = GitClient::new(&origin_path).unwrap();

        let wc_dir = tempfile::tempdir().unwrap();
        let url = origin_path.to_str().unwrap();
        let wc = GitClient::clone_repo(url, &wc_dir.path().join("wc"), None).unwrap();
        wc.checkout_new_branch("codeflow/forward/m/1", &base).unwrap();
        write(wc.repo_path(), "b.txt", "2");
        let sha = wc.commit_all("work", "T", "t@t.com").unwrap().unwrap();
        wc.push("origin", "codeflow/forward/m/1", None, true).unwrap();

        let pushed = origin.resolve_commit("refs/heads/codeflow/forward/m/1").unwrap();
        assert_eq!(pushed.to_string(), sha);

        let cache_dir = tempfile::tempdir().unwrap();
        let cache =
            GitClient::open_or_clone_cache(url, &cache_dir.path().join("cache.git"), None).unwrap();
        assert!(cache.has_remote_branch("codeflow/forward/m/1"));
        assert_eq!(cache.read_blob(&blob_id(b"2").unwrap()).unwrap(), b"2");
    }

    #[test]
    fn test_clone_unreachable_remote() {
        let dir = tempfile::tempdir().unwrap();
        let result = GitClient::clone_repo("/nonexistent/remote/repo", &dir.path().join("x"), None);
        assert!(matches!(result, Err(GitError::RemoteUnavailable { .. })));
    }

    #[test]
    fn test_repo_not_found() {
        assert!(matches!(
            GitClient::new("/nonexistent"),
            Err(GitError::RepositoryNotFound(_))
        ));
    }
}
