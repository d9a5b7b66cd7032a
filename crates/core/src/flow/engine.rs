//! The caller-facing code flow engine.
//!
//! [`CodeFlowEngine::flow`] takes a [`FlowRequest`], serializes it against
//! other flows of the same mapping, runs the forward or back flower on a
//! blocking thread, and always returns a [`FlowResult`]: errors are
//! classified and reported in the result rather than returned.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::assets::BuildAssetSource;
use crate::config::AppConfig;
use crate::db::Database;
use crate::errors::{ConfigError, ErrorClass, FlowError};
use crate::mapping::{Mapping, MappingRegistry};
use crate::models::{AuditEntry, Direction, FlowRequest, FlowResult, FlowRun, FlowStatus};
use crate::tracker::Tracker;

use super::lock::{CacheLocks, MappingLocks};
use super::{backward, forward, CancellationToken, FlowContext, FlowState};

/// Entry point for forward and back flows.
#[derive(Clone)]
pub struct CodeFlowEngine {
    config: Arc<AppConfig>,
    registry: Arc<MappingRegistry>,
    tracker: Tracker,
    assets: Arc<dyn BuildAssetSource>,
    locks: MappingLocks,
    cache_locks: CacheLocks,
}

impl CodeFlowEngine {
    /// Validate the mappings and build an engine over an initialized
    /// database.
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        assets: Arc<dyn BuildAssetSource>,
    ) -> Result<Self, ConfigError> {
        let registry = MappingRegistry::from_app_config(&config)?;
        info!(mappings = registry.len(), "code flow engine ready");
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            tracker: Tracker::new(db),
            assets,
            locks: MappingLocks::new(),
            cache_locks: CacheLocks::new(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn locks(&self) -> &MappingLocks {
        &self.locks
    }

    /// Run one flow to a terminal state.
    ///
    /// The mapping stays locked until the blocking run finishes, even if the
    /// returned future is dropped first.
    pub async fn flow(&self, request: FlowRequest, cancel: CancellationToken) -> FlowResult {
        let run_id = Uuid::new_v4().to_string();

        let mapping = match self.registry.resolve(&request.mapping) {
            Ok(m) => m,
            Err(e) => return failed(&run_id, &FlowError::from(e)),
        };

        let guard = match self
            .locks
            .acquire(&mapping.name, request.direction, &cancel)
            .await
        {
            Ok(g) => g,
            Err(e) => {
                info!(mapping = %mapping.name, "flow cancelled while waiting for mapping lock");
                return failed(&run_id, &e);
            }
        };

        let engine = self.clone();
        let task_run_id = run_id.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            engine.run_locked(&task_run_id, &mapping, &request, &cancel)
        });
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(run = %run_id, error = %e, "flow task panicked");
                let mut result = FlowResult::new(&run_id, FlowStatus::Failed);
                result.error_class = Some(ErrorClass::Internal);
                result.error = Some(format!("flow task failed: {}", e));
                result
            }
        }
    }

    /// Persist the run, execute it (retrying once on a concurrent sync point
    /// change if configured), and record the outcome.
    fn run_locked(
        &self,
        run_id: &str,
        mapping: &Mapping,
        request: &FlowRequest,
        cancel: &CancellationToken,
    ) -> FlowResult {
        let db = self.tracker.database();
        let previous = match db.latest_flow_run_for_request(
            &mapping.name,
            request.direction,
            &request.build_id,
            &request.source_commit,
        ) {
            Ok(p) => p,
            Err(e) => return failed(run_id, &FlowError::from(e)),
        };

        let run = FlowRun {
            id: run_id.to_string(),
            mapping: mapping.name.clone(),
            direction: request.direction,
            build_id: request.build_id.clone(),
            source_commit: request.source_commit.clone(),
            state: FlowState::ReadSyncPoint.to_string(),
            branch: None,
            target_branch: request.target_branch.clone(),
            patch_json: None,
            details: None,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
        };
        if let Err(e) = db.insert_flow_run(&run) {
            return failed(run_id, &FlowError::from(e));
        }
        info!(
            run = run_id,
            mapping = %mapping.name,
            direction = %request.direction,
            build = %request.build_id,
            source = %request.source_commit,
            "flow started"
        );

        let ctx = FlowContext {
            config: &self.config,
            mapping,
            request,
            tracker: &self.tracker,
            assets: self.assets.as_ref(),
            cancel,
            cache_locks: &self.cache_locks,
            run_id,
            previous: previous.as_ref(),
        };

        let mut outcome = execute(&ctx);
        if let Err(ref e) = outcome {
            if e.class() == ErrorClass::ConcurrentModification
                && self.config.engine.retry_on_concurrent_modification
            {
                warn!(run = run_id, error = %e, "sync point moved, retrying flow once");
                outcome = execute(&ctx);
            }
        }

        let result = match outcome {
            Ok(r) => r,
            Err(e) => failed(run_id, &e),
        };
        self.record_outcome(mapping, request, &result);
        result
    }

    fn record_outcome(&self, mapping: &Mapping, request: &FlowRequest, result: &FlowResult) {
        let db = self.tracker.database();
        let state = FlowState::terminal_for(result.status);
        let details = match &result.error {
            Some(err) => format!("{}: {}", result.status, err),
            None => format!(
                "{}: {} file(s), {} conflict(s), new sha {}",
                result.status,
                result.applied_files.len(),
                result.conflicts.len(),
                result.new_sha.as_deref().unwrap_or("-")
            ),
        };
        if let Err(e) = db.complete_flow_run(&result.run_id, &state.to_string(), Some(&details)) {
            error!(run = %result.run_id, error = %e, "failed to complete flow run record");
        }

        let audit = if result.is_success() {
            AuditEntry::success("flow", &details)
        } else {
            AuditEntry::failure("flow", &details)
        }
        .for_flow(&mapping.name, request.direction);
        if let Err(e) = db.insert_audit_entry(&audit) {
            error!(run = %result.run_id, error = %e, "failed to write audit entry");
        }

        info!(
            run = %result.run_id,
            mapping = %mapping.name,
            direction = %request.direction,
            status = %result.status,
            "flow finished"
        );
    }
}

fn execute(ctx: &FlowContext<'_>) -> Result<FlowResult, FlowError> {
    match ctx.direction() {
        Direction::Forward => forward::run(ctx),
        Direction::Backward => backward::run(ctx),
    }
}

/// A `Failed` (or `Cancelled`) result describing `err`.
fn failed(run_id: &str, err: &FlowError) -> FlowResult {
    let class = err.class();
    let status = if class == ErrorClass::Cancelled {
        FlowStatus::Cancelled
    } else {
        FlowStatus::Failed
    };
    match status {
        FlowStatus::Cancelled => info!(run = run_id, "flow cancelled"),
        _ => error!(run = run_id, class = %class, error = %err, "flow failed"),
    }
    let mut result = FlowResult::new(run_id, status);
    result.error_class = Some(class);
    result.error = Some(err.to_string());
    result
}
