//! Forward and back flow.
//!
//! A flow moves the changes of one mapping across the repository/VMR
//! boundary:
//!
//! 1. Read the sync point for the mapping and direction.
//! 2. Build the patch from the sync point's source commit to the requested
//!    source commit.
//! 3. Apply it to a scratch clone of the target on a working branch and run
//!    the conflict policies.
//! 4. (Forward only) update the dependency manifest.
//! 5. Commit, push the working branch, and commit the new sync point.
//!
//! [`forward`] and [`backward`] drive these steps; the shared step helpers
//! live on [`FlowContext`]. [`engine::CodeFlowEngine`] is the caller-facing
//! entry point that adds locking, persistence, and error classification.

pub mod backward;
pub mod engine;
pub mod forward;
pub mod lock;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use regex_lite::Regex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::assets::BuildAssetSource;
use crate::config::AppConfig;
use crate::conflict::{ConflictRecord, ConflictResolver};
use crate::db::Database;
use crate::errors::{FlowError, GitError, PatchError};
use crate::git::GitClient;
use crate::mapping::Mapping;
use crate::models::{
    DependencyManifestEntry, Direction, FlowRequest, FlowResult, FlowRun, FlowStatus, SyncPoint,
};
use crate::patch::{ApplyResult, Patch, PatchApplier, PatchBuilder};
use crate::tracker::Tracker;

pub use engine::CodeFlowEngine;
pub use lock::{CacheLocks, MappingLockGuard, MappingLocks};

/// Marker at the start of every flow commit subject.
pub const COMMIT_MARKER: &str = "[codeflow]";

/// Trailer key identifying the flow that produced a commit.
pub const FLOW_TRAILER: &str = "Codeflow-Flow";

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared between a caller and a flow.
///
/// The flow checks it between steps and between files of a patch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(FlowError::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<(), FlowError> {
        if self.is_cancelled() {
            Err(FlowError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Flow state machine
// ---------------------------------------------------------------------------

/// States recorded on a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    ReadSyncPoint,
    BuildPatch,
    ApplyToVmr,
    ApplyToRepo,
    UpdateDependencyManifest,
    CommitSyncPoint,
    Done,
    Conflict,
    Failed,
    Cancelled,
}

impl FlowState {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "read_sync_point" => Self::ReadSyncPoint,
            "build_patch" => Self::BuildPatch,
            "apply_to_vmr" => Self::ApplyToVmr,
            "apply_to_repo" => Self::ApplyToRepo,
            "update_dependency_manifest" => Self::UpdateDependencyManifest,
            "commit_sync_point" => Self::CommitSyncPoint,
            "done" => Self::Done,
            "conflict" => Self::Conflict,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// The terminal state a run ends in for a given result status.
    pub fn terminal_for(status: FlowStatus) -> Self {
        match status {
            FlowStatus::Success | FlowStatus::NoOp => Self::Done,
            FlowStatus::Conflict => Self::Conflict,
            FlowStatus::Cancelled => Self::Cancelled,
            FlowStatus::Failed => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Conflict | Self::Failed | Self::Cancelled
        )
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadSyncPoint => write!(f, "read_sync_point"),
            Self::BuildPatch => write!(f, "build_patch"),
            Self::ApplyToVmr => write!(f, "apply_to_vmr"),
            Self::ApplyToRepo => write!(f, "apply_to_repo"),
            Self::UpdateDependencyManifest => write!(f, "update_dependency_manifest"),
            Self::CommitSyncPoint => write!(f, "commit_sync_point"),
            Self::Done => write!(f, "done"),
            Self::Conflict => write!(f, "conflict"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Commit messages
// ---------------------------------------------------------------------------

/// The trailer line for a flow commit.
pub fn flow_trailer(direction: Direction, mapping: &str, source_sha: &str) -> String {
    format!("{}: {} {} {}", FLOW_TRAILER, direction, mapping, source_sha)
}

/// Parse the flow trailer of a commit message, if it has one.
pub fn parse_flow_trailer(message: &str) -> Option<(Direction, String, String)> {
    let prefix = format!("{}:", FLOW_TRAILER);
    message.lines().rev().find_map(|line| {
        let rest = line.trim().strip_prefix(prefix.as_str())?;
        let mut parts = rest.split_whitespace();
        let direction = Direction::from_str_val(parts.next()?)?;
        let mapping = parts.next()?.to_string();
        let sha = parts.next()?.to_string();
        Some((direction, mapping, sha))
    })
}

/// Runs of characters not allowed in a working branch component.
static UNSAFE_REF_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("branch sanitizer pattern is valid"));

/// Deterministic working branch for a request.
pub fn working_branch_name(direction: Direction, mapping: &str, build_id: &str) -> String {
    let clean = |s: &str| {
        UNSAFE_REF_CHARS
            .replace_all(s, "-")
            .trim_matches('-')
            .to_string()
    };
    format!("codeflow/{}/{}/{}", direction, clean(mapping), clean(build_id))
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(12)]
}

// ---------------------------------------------------------------------------
// Shared step helpers
// ---------------------------------------------------------------------------

/// Everything one flow invocation needs.
pub(crate) struct FlowContext<'a> {
    pub config: &'a AppConfig,
    pub mapping: &'a Mapping,
    pub request: &'a FlowRequest,
    pub tracker: &'a Tracker,
    pub assets: &'a dyn BuildAssetSource,
    pub cancel: &'a CancellationToken,
    /// Serializes fetches into each repository cache.
    pub cache_locks: &'a CacheLocks,
    pub run_id: &'a str,
    /// The latest earlier run of the same request, if any.
    pub previous: Option<&'a FlowRun>,
}

/// A scratch clone of the target checked out on the working branch.
pub(crate) struct WorkingCopy {
    // Removed from disk when the flow ends, whatever the outcome.
    _dir: TempDir,
    pub git: GitClient,
    pub branch: String,
    /// Commit the working branch started from.
    pub start_sha: String,
}

impl WorkingCopy {
    pub fn path(&self) -> PathBuf {
        self.git.repo_path().to_path_buf()
    }
}

/// Outcome of comparing the request with the sync point.
pub(crate) enum HistoryCheck {
    Proceed,
    AlreadyFlowed,
}

impl<'a> FlowContext<'a> {
    pub fn direction(&self) -> Direction {
        self.request.direction
    }

    pub fn db(&self) -> &Database {
        self.tracker.database()
    }

    pub fn token(&self) -> Option<&str> {
        self.config.vmr.token.as_deref()
    }

    /// Record a state transition on the run.
    pub fn enter(&self, state: FlowState) -> Result<(), FlowError> {
        self.cancel.check()?;
        info!(
            run = self.run_id,
            mapping = %self.mapping.name,
            direction = %self.direction(),
            %state,
            "flow state"
        );
        self.db().update_flow_run_state(self.run_id, &state.to_string())?;
        Ok(())
    }

    fn source_remote(&self) -> &str {
        match self.direction() {
            Direction::Forward => &self.mapping.default_remote,
            Direction::Backward => &self.config.vmr.remote,
        }
    }

    fn target_remote(&self) -> &str {
        match self.direction() {
            Direction::Forward => &self.config.vmr.remote,
            Direction::Backward => &self.mapping.default_remote,
        }
    }

    fn cache_path(&self, remote_is_vmr: bool) -> PathBuf {
        let name = if remote_is_vmr {
            "vmr".to_string()
        } else {
            self.mapping.name.clone()
        };
        self.config
            .engine
            .data_dir
            .join("repos")
            .join(format!("{}.git", name))
    }

    fn open_cache(&self, url: &str, remote_is_vmr: bool) -> Result<GitClient, FlowError> {
        let path = self.cache_path(remote_is_vmr);
        let lock = self.cache_locks.lock_for(&path);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(GitClient::open_or_clone_cache(url, &path, self.token())?)
    }

    /// Up-to-date bare cache of the repository the flow reads from.
    pub fn open_source(&self) -> Result<GitClient, FlowError> {
        let is_vmr = self.direction() == Direction::Backward;
        self.open_cache(self.source_remote(), is_vmr)
    }

    /// Up-to-date bare cache of the repository the flow writes to.
    pub fn open_target_cache(&self) -> Result<GitClient, FlowError> {
        let is_vmr = self.direction() == Direction::Forward;
        self.open_cache(self.target_remote(), is_vmr)
    }

    /// Branch of the target the working branch starts from.
    pub fn base_branch(&self) -> &str {
        if !self.request.base_branch.is_empty() {
            return &self.request.base_branch;
        }
        match self.direction() {
            Direction::Forward => &self.config.vmr.default_branch,
            Direction::Backward => &self.mapping.default_ref,
        }
    }

    /// Full SHA of the requested source commit. Branch names resolve to the
    /// freshly fetched remote branch, not the cache's own (stale) branch.
    pub fn resolve_source(&self, source: &GitClient) -> Result<String, FlowError> {
        let rev = &self.request.source_commit;
        let oid = if source.has_remote_branch(rev) {
            source.resolve_commit(&format!("origin/{}", rev))?
        } else {
            source.resolve_commit(rev)?
        };
        Ok(oid.to_string())
    }

    /// Refuse requests that do not descend from the sync point.
    pub fn check_history(
        &self,
        source: &GitClient,
        sp: Option<&SyncPoint>,
        source_sha: &str,
    ) -> Result<HistoryCheck, FlowError> {
        let Some(sp) = sp else {
            return Ok(HistoryCheck::Proceed);
        };
        if sp.source_sha == source_sha {
            return Ok(HistoryCheck::AlreadyFlowed);
        }
        let rewritten = || FlowError::HistoryRewritten {
            mapping: self.mapping.name.clone(),
            sync_point_sha: sp.source_sha.clone(),
            source_commit: source_sha.to_string(),
        };
        if source.resolve_commit(&sp.source_sha).is_err() {
            return Err(rewritten());
        }
        if source.is_ancestor(source_sha, &sp.source_sha)? {
            return Ok(HistoryCheck::AlreadyFlowed);
        }
        if !source.is_ancestor(&sp.source_sha, source_sha)? {
            return Err(rewritten());
        }
        Ok(HistoryCheck::Proceed)
    }

    /// `true` if every commit in range touching the mapping was itself
    /// produced by a flow of this mapping in the other direction.
    pub fn is_echo(
        &self,
        source: &GitClient,
        sp: Option<&SyncPoint>,
        source_sha: &str,
    ) -> Result<bool, FlowError> {
        let Some(sp) = sp else {
            return Ok(false);
        };
        let pathspec = match self.direction() {
            Direction::Forward => None,
            Direction::Backward => Some(self.mapping.vmr_path.as_str()),
        };

        let mut touching = 0;
        for commit in source.commits_between(Some(&sp.source_sha), source_sha)? {
            let paths = source.changed_paths(&commit.sha, pathspec)?;
            let in_mapping = paths.iter().any(|p| match self.direction() {
                Direction::Forward => true,
                Direction::Backward => self.mapping.from_vmr_path(p).is_some(),
            });
            if !in_mapping {
                continue;
            }
            touching += 1;
            match parse_flow_trailer(&commit.message) {
                Some((dir, mapping, _))
                    if dir == self.direction().opposite() && mapping == self.mapping.name => {}
                _ => return Ok(false),
            }
        }
        Ok(touching > 0)
    }

    /// Advance the sync point to `source_sha` without producing a commit.
    /// The target side of the new sync point is the head of the base branch.
    pub fn advance_without_commit(
        &self,
        sp: Option<&SyncPoint>,
        source_sha: &str,
        reason: &str,
    ) -> Result<FlowResult, FlowError> {
        let target = self.open_target_cache()?;
        let target_sha = target
            .resolve_commit(&format!("origin/{}", self.base_branch()))?
            .to_string();
        self.enter(FlowState::CommitSyncPoint)?;
        self.tracker.commit_sync_point(
            &self.mapping.name,
            self.direction(),
            sp.map(|s| s.generation),
            source_sha,
            &target_sha,
        )?;
        info!(mapping = %self.mapping.name, direction = %self.direction(), reason, "flow is a no-op");
        Ok(FlowResult::new(self.run_id, FlowStatus::NoOp))
    }

    /// The stored patch and branch of a run this request can resume.
    pub fn resumable(&self) -> Option<(Patch, String)> {
        let prev = self.previous?;
        if FlowState::from_str_val(&prev.state) != FlowState::Conflict {
            return None;
        }
        let patch = Patch::from_json(prev.patch_json.as_deref()?)
            .map_err(|e| warn!(run = %prev.id, error = %e, "stored patch unreadable"))
            .ok()?;
        let branch = prev.branch.clone()?;
        info!(run = self.run_id, previous = %prev.id, %branch, "resuming parked flow");
        Some((patch, branch))
    }

    /// Build the patch (or reuse a resumed one) and check it against the
    /// sync point and earlier builds.
    pub fn build_patch(
        &self,
        source: &GitClient,
        sp: Option<&SyncPoint>,
        source_sha: &str,
        resumed: Option<Patch>,
    ) -> Result<Patch, FlowError> {
        let patch = match resumed {
            Some(p) => p,
            None => PatchBuilder::new(source, self.mapping, self.direction())
                .build(sp.map(|s| s.source_sha.as_str()), source_sha)?,
        };

        let expected_base = sp.map(|s| s.source_sha.clone());
        if patch.base_sha != expected_base || patch.source_sha != source_sha {
            return Err(FlowError::GapDetected {
                mapping: self.mapping.name.clone(),
                patch_base: patch.base_sha.clone(),
                sync_point: expected_base,
            });
        }

        let fingerprint = patch.fingerprint()?;
        let base = patch.base_sha.as_deref().unwrap_or("");
        let scope = self.mapping.scope_hash();
        if let Some(recorded) = self.db().get_patch_fingerprint(
            &self.mapping.name,
            self.direction(),
            base,
            source_sha,
            &scope,
        )? {
            if recorded != fingerprint {
                return Err(FlowError::DeterminismViolation {
                    mapping: self.mapping.name.clone(),
                    base: base.to_string(),
                    source_commit: source_sha.to_string(),
                    expected: recorded,
                    actual: fingerprint,
                });
            }
        } else {
            self.db().insert_patch_fingerprint(
                &self.mapping.name,
                self.direction(),
                base,
                source_sha,
                &scope,
                &fingerprint,
            )?;
        }

        self.db()
            .set_flow_run_patch(self.run_id, &patch.to_json().map_err(PatchError::from)?)?;

        if self.config.engine.archive_patches {
            let dir = self
                .config
                .engine
                .scratch_root()
                .join("patches")
                .join(self.run_id);
            patch.materialize(&dir)?;
            debug!(dir = %dir.display(), "patch archived");
        }
        Ok(patch)
    }

    /// Clone the target into a fresh scratch directory and check out the
    /// working branch. A resumed run continues from its pushed branch.
    pub fn prepare_working_copy(&self, resume: bool) -> Result<WorkingCopy, FlowError> {
        let root = self.config.engine.scratch_root();
        std::fs::create_dir_all(&root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("codeflow-{}-", self.mapping.name))
            .tempdir_in(&root)?;
        let git = GitClient::clone_repo(self.target_remote(), &dir.path().join("wc"), self.token())?;

        let branch =
            working_branch_name(self.direction(), &self.mapping.name, &self.request.build_id);
        let start = if resume && git.has_remote_branch(&branch) {
            format!("origin/{}", branch)
        } else {
            let base = self.base_branch();
            if !git.has_remote_branch(base) {
                return Err(GitError::RefNotFound(format!("{} in {}", base, self.target_remote())).into());
            }
            format!("origin/{}", base)
        };
        let start_sha = git.checkout_new_branch(&branch, &start)?;
        self.db().set_flow_run_branch(self.run_id, &branch)?;

        Ok(WorkingCopy {
            _dir: dir,
            git,
            branch,
            start_sha,
        })
    }

    /// Paths an operator already resolved for this request.
    pub fn skip_paths(&self) -> Result<BTreeSet<String>, FlowError> {
        let paths = self.db().resolved_conflict_paths(
            &self.mapping.name,
            self.direction(),
            &self.request.build_id,
            &self.request.source_commit,
        )?;
        Ok(paths.into_iter().collect())
    }

    /// Apply the patch and run the conflict policies.
    pub fn apply(
        &self,
        wc: &WorkingCopy,
        patch: &Patch,
        entries: &[DependencyManifestEntry],
    ) -> Result<ApplyResult, FlowError> {
        let skip = self.skip_paths()?;
        let applier = PatchApplier::new(wc.path(), self.mapping, self.direction());
        let mut result = applier.apply(patch, &skip, self.cancel).map_err(|e| match e {
            PatchError::Cancelled { .. } => FlowError::Cancelled,
            other => other.into(),
        })?;

        let resolver = ConflictResolver::new(wc.path(), self.mapping, entries);
        result.conflicts = resolver.resolve(patch, std::mem::take(&mut result.conflicts))?;
        Ok(result)
    }

    /// Stop on escalated conflicts: keep the partial work on the pushed
    /// working branch, or throw it away when the request asks to discard.
    pub fn park_conflict(
        &self,
        wc: &WorkingCopy,
        source_sha: &str,
        result: ApplyResult,
    ) -> Result<FlowResult, FlowError> {
        self.cancel.check()?;
        let escalated: Vec<&ConflictRecord> =
            result.conflicts.iter().filter(|c| c.is_escalated()).collect();
        warn!(
            mapping = %self.mapping.name,
            direction = %self.direction(),
            escalated = escalated.len(),
            discard = self.request.discard_patches,
            "flow stopped on conflicts"
        );

        let mut flow_result = FlowResult::new(self.run_id, FlowStatus::Conflict);
        if self.request.discard_patches {
            wc.git.reset_hard()?;
        } else {
            let message = self.commit_message(
                source_sha,
                &format!(
                    "Partial flow: {} file(s) need an operator",
                    escalated.len()
                ),
            );
            wc.git.commit_all(
                &message,
                &self.config.committer.name,
                &self.config.committer.email,
            )?;
            wc.git.push("origin", &wc.branch, self.token(), true)?;
            flow_result.branch = Some(wc.branch.clone());
        }

        self.db().insert_flow_conflicts(self.run_id, &result.conflicts)?;
        flow_result.applied_files = result.applied_files;
        flow_result.conflicts = result.conflicts;
        Ok(flow_result)
    }

    /// Commit message for a flow commit, ending in the flow trailer.
    pub fn commit_message(&self, source_sha: &str, body: &str) -> String {
        let what = match self.direction() {
            Direction::Forward => "Forward flow",
            Direction::Backward => "Back flow",
        };
        format!(
            "{} {} of {} @ {}\n\n{}\n\nBuild: {}\nTarget branch: {}\n\n{}\n",
            COMMIT_MARKER,
            what,
            self.mapping.name,
            short(source_sha),
            body,
            self.request.build_id,
            self.request.target_branch,
            flow_trailer(self.direction(), &self.mapping.name, source_sha)
        )
    }

    /// Commit the working copy, push the working branch, and commit the
    /// sync point. Returns `None` when there was nothing to commit.
    pub fn commit_and_push(
        &self,
        wc: &WorkingCopy,
        sp: Option<&SyncPoint>,
        source_sha: &str,
        body: &str,
        entries: &[DependencyManifestEntry],
        resumed: bool,
    ) -> Result<Option<String>, FlowError> {
        self.cancel.check()?;
        let committed = wc.git.commit_all(
            &self.commit_message(source_sha, body),
            &self.config.committer.name,
            &self.config.committer.email,
        )?;
        let new_sha = match committed {
            Some(sha) => sha,
            // A resumed branch may already hold all of the work.
            None if resumed && wc.start_sha != self.base_head(wc)? => wc.git.get_head_sha()?,
            None => return Ok(None),
        };

        self.cancel.check()?;
        wc.git.push("origin", &wc.branch, self.token(), true)?;

        self.enter(FlowState::CommitSyncPoint)?;
        self.tracker.commit_sync_point_with_entries(
            &self.mapping.name,
            self.direction(),
            sp.map(|s| s.generation),
            source_sha,
            &new_sha,
            entries,
        )?;
        Ok(Some(new_sha))
    }

    fn base_head(&self, wc: &WorkingCopy) -> Result<String, FlowError> {
        Ok(wc
            .git
            .resolve_commit(&format!("origin/{}", self.base_branch()))?
            .to_string())
    }

    /// Empty effective change: advance the sync point to the base head.
    pub fn finish_unchanged(
        &self,
        wc: &WorkingCopy,
        sp: Option<&SyncPoint>,
        source_sha: &str,
        applied: ApplyResult,
    ) -> Result<FlowResult, FlowError> {
        self.enter(FlowState::CommitSyncPoint)?;
        self.tracker.commit_sync_point(
            &self.mapping.name,
            self.direction(),
            sp.map(|s| s.generation),
            source_sha,
            &wc.start_sha,
        )?;
        info!(mapping = %self.mapping.name, direction = %self.direction(), "no effective change");
        let mut result = FlowResult::new(self.run_id, FlowStatus::NoOp);
        result.applied_files = applied.applied_files;
        result.conflicts = applied.conflicts;
        Ok(result)
    }
}
