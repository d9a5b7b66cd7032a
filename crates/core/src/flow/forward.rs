//! Forward flow: product repository -> VMR subtree.
//!
//! `ReadSyncPoint -> BuildPatch -> ApplyToVmr -> UpdateDependencyManifest
//! -> CommitSyncPoint -> Done`, leaving through `Conflict` when the patch
//! does not apply and the policies cannot settle it.

use tracing::{info, instrument};

use crate::errors::FlowError;
use crate::manifest::{self, SourceManifest};
use crate::models::{FlowResult, FlowStatus};
use crate::patch::SubmodulePointer;

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
    if ctx.is_echo(&source, sp.as_ref(), &source_sha)? {
        return ctx.advance_without_commit(sp.as_ref(), &source_sha, "only back-flowed commits in range");
    }

    // -- BuildPatch ---------------------------------------------------------
    ctx.enter(FlowState::BuildPatch)?;
    let assets = ctx
        .assets
        .assets_for_build(&ctx.request.build_id)
        .map_err(|e| FlowError::AssetsUnavailable {
            build_id: ctx.request.build_id.clone(),
            detail: e.to_string(),
        })?;
    let current = ctx.tracker.manifest_entries(&ctx.mapping.name)?;
    let plan = manifest::plan_updates(
        ctx.mapping,
        &current,
        &assets,
        &ctx.request.excluded_assets,
        &ctx.mapping.default_remote,
    )?;
    let merged_entries = plan.merged(&current);

    let resumed = ctx.resumable();
    let is_resume = resumed.is_some();
    let patch = ctx.build_patch(&source, sp.as_ref(), &source_sha, resumed.map(|(p, _)| p))?;
    let pointers: Vec<SubmodulePointer> = if ctx.mapping.submodule_pointers {
        patch.submodules.clone()
    } else {
        Vec::new()
    };

    if patch.files.is_empty() && pointers.is_empty() && plan.is_empty() && !is_resume {
        return ctx.advance_without_commit(sp.as_ref(), &source_sha, "nothing in scope changed");
    }

    // -- ApplyToVmr ---------------------------------------------------------
    ctx.enter(FlowState::ApplyToVmr)?;
    let wc = ctx.prepare_working_copy(is_resume)?;
    let applied = ctx.apply(&wc, &patch, &merged_entries)?;
    if applied.conflicts.iter().any(|c| c.is_escalated()) {
        return ctx.park_conflict(&wc, &source_sha, applied);
    }

    // -- UpdateDependencyManifest -------------------------------------------
    ctx.enter(FlowState::UpdateDependencyManifest)?;
    if !wc.git.has_changes()? && pointers.is_empty() && plan.is_empty() && !is_resume {
        return ctx.finish_unchanged(&wc, sp.as_ref(), &source_sha, applied);
    }
    let manifest_path = wc.path().join(&ctx.config.vmr.manifest_path);
    let mut source_manifest = SourceManifest::load(&manifest_path)?;
    source_manifest.update(ctx.mapping, &source_sha, merged_entries, &pointers);
    source_manifest.write(&manifest_path)?;

    // -- CommitSyncPoint ----------------------------------------------------
    let body = format!(
        "Files: {}\nDependency updates: {}\nConflicts resolved by policy: {}",
        applied.applied_files.len(),
        plan.updated.len(),
        applied.conflicts.len()
    );
    let committed = ctx.commit_and_push(
        &wc,
        sp.as_ref(),
        &source_sha,
        &body,
        &plan.entries(),
        is_resume,
    )?;
    let Some(new_sha) = committed else {
        return ctx.finish_unchanged(&wc, sp.as_ref(), &source_sha, applied);
    };

    info!(%new_sha, branch = %wc.branch, "forward flow committed");
    let mut result = FlowResult::new(ctx.run_id, FlowStatus::Success);
    result.new_sha = Some(new_sha);
    result.branch = Some(wc.branch.clone());
    result.applied_files = applied.applied_files;
    result.conflicts = applied.conflicts;
    result.dependency_updates = plan.updated;
    result.rejected_updates = plan.rejected;
    Ok(result)
}
