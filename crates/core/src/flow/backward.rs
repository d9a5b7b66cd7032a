//! Back flow: VMR subtree -> product repository.
//!
//! Mirrors the forward flow with source and target swapped. Version
//! metadata only flows forward, so there is no manifest step; generated
//! files that conflict are rendered from the tracker's recorded entries.

use tracing::{debug, info, instrument};

use crate::errors::FlowError;
use crate::models::{Direction, FlowResult, FlowStatus};

use super::{FlowContext, FlowState, HistoryCheck};

#[instrument(skip_all, fields(mapping = %ctx.mapping.name, build = %ctx.request.build_id))]
pub(crate) fn run(ctx: &FlowContext<'_>) -> Result<FlowResult, FlowError> {
    // -- ReadSyncPoint ------------------------------------------------------
    ctx.enter(FlowState::ReadSyncPoint)?;
    let sp = ctx
        .tracker
        .get_sync_point(&ctx.mapping.name, ctx.direction())?;
    let source = ctx.open_source()?;
    let source_sha = ctx.resolve_source(&source)?;

    if let HistoryCheck::AlreadyFlowed = ctx.check_history(&source, sp.as_ref(), &source_sha)? {
        info!(%source_sha, "source commit already flowed");
        return Ok(FlowResult::new(ctx.run_id, FlowStatus::NoOp));
    }

    // The VMR commit being flowed back is the output of the latest forward
    // flow (or only forward flows touched the subtree since the last back
    // flow): there is nothing to carry back.
    let forward_sp = ctx
        .tracker
        .get_sync_point(&ctx.mapping.name, Direction::Forward)?;
    if forward_sp.as_ref().is_some_and(|f| f.target_sha == source_sha) {
        return ctx.advance_without_commit(sp.as_ref(), &source_sha, "source is the latest forward flow");
    }
    if ctx.is_echo(&source, sp.as_ref(), &source_sha)? {
        return ctx.advance_without_commit(sp.as_ref(), &source_sha, "only forward-flowed commits in range");
    }

    // -- BuildPatch ---------------------------------------------------------
    ctx.enter(FlowState::BuildPatch)?;
    let resumed = ctx.resumable();
    let is_resume = resumed.is_some();
    let patch = ctx.build_patch(&source, sp.as_ref(), &source_sha, resumed.map(|(p, _)| p))?;
    if !patch.submodules.is_empty() {
        debug!(count = patch.submodules.len(), "submodule pointers are not flowed back");
    }
    if patch.files.is_empty() && !is_resume {
        return ctx.advance_without_commit(sp.as_ref(), &source_sha, "nothing in scope changed");
    }

    // -- ApplyToRepo --------------------------------------------------------
    ctx.enter(FlowState::ApplyToRepo)?;
    let entries = ctx.tracker.manifest_entries(&ctx.mapping.name)?;
    let wc = ctx.prepare_working_copy(is_resume)?;
    let applied = ctx.apply(&wc, &patch, &entries)?;
    if applied.conflicts.iter().any(|c| c.is_escalated()) {
        return ctx.park_conflict(&wc, &source_sha, applied);
    }

    // -- CommitSyncPoint ----------------------------------------------------
    let body = format!(
        "Files: {}\nConflicts resolved by policy: {}",
        applied.applied_files.len(),
        applied.conflicts.len()
    );
    let committed = ctx.commit_and_push(&wc, sp.as_ref(), &source_sha, &body, &[], is_resume)?;
    let Some(new_sha) = committed else {
        return ctx.finish_unchanged(&wc, sp.as_ref(), &source_sha, applied);
    };

    info!(%new_sha, branch = %wc.branch, "back flow committed");
    let mut result = FlowResult::new(ctx.run_id, FlowStatus::Success);
    result.new_sha = Some(new_sha);
    result.branch = Some(wc.branch.clone());
    result.applied_files = applied.applied_files;
    result.conflicts = applied.conflicts;
    Ok(result)
}
