//! Domain model types used throughout the code flow engine.
//!
//! These types bridge the flowers, the tracker, and the database layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictRecord;
use crate::errors::ErrorClass;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Direction of a code flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Product repository -> VMR.
    Forward,
    /// VMR -> product repository.
    Backward,
}

impl Direction {
    /// Parse a direction string.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "forward" => Some(Self::Forward),
            "backward" | "back" => Some(Self::Backward),
            _ => None,
        }
    }

    /// The opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backward => write!(f, "backward"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync point
// ---------------------------------------------------------------------------

/// The last commit pair known to be mutually consistent for a mapping and
/// direction.
///
/// `source_sha` is in the repository the flow reads from (product repo for
/// forward, VMR for backward); `target_sha` is the commit it produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncPoint {
    pub mapping: String,
    pub direction: Direction,
    pub source_sha: String,
    pub target_sha: String,
    /// Monotonic version of this (mapping, direction) key.
    pub generation: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Flow request / result
// ---------------------------------------------------------------------------

/// A single flow invocation, consumed exactly once by a flower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRequest {
    pub mapping: String,
    pub direction: Direction,
    pub build_id: String,
    /// Commit in the source repository to flow up to.
    pub source_commit: String,
    /// Package IDs (or globs) left out of the version update.
    #[serde(default)]
    pub excluded_assets: Vec<String>,
    /// Branch of the target repository the working branch starts from.
    pub base_branch: String,
    /// Branch the flowed change is destined for.
    pub target_branch: String,
    /// Roll back the whole working copy instead of keeping a partial apply.
    #[serde(default)]
    pub discard_patches: bool,
}

/// Terminal status of a flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Success,
    NoOp,
    Conflict,
    Cancelled,
    Failed,
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NoOp => write!(f, "no_op"),
            Self::Conflict => write!(f, "conflict"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The outcome of a flow returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub run_id: String,
    pub status: FlowStatus,
    /// Commit created in the target repository, if any.
    pub new_sha: Option<String>,
    /// Working branch the change (or partial change) was pushed to.
    pub branch: Option<String>,
    pub applied_files: Vec<String>,
    pub conflicts: Vec<ConflictRecord>,
    pub dependency_updates: Vec<DependencyUpdate>,
    pub rejected_updates: Vec<DependencyUpdate>,
    pub error_class: Option<ErrorClass>,
    pub error: Option<String>,
}

impl FlowResult {
    /// An empty result with the given status.
    pub fn new(run_id: &str, status: FlowStatus) -> Self {
        Self {
            run_id: run_id.to_string(),
            status,
            new_sha: None,
            branch: None,
            applied_files: Vec::new(),
            conflicts: Vec::new(),
            dependency_updates: Vec::new(),
            rejected_updates: Vec::new(),
            error_class: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, FlowStatus::Success | FlowStatus::NoOp)
    }
}

// ---------------------------------------------------------------------------
// Build assets and dependency manifest
// ---------------------------------------------------------------------------

/// An asset produced by a build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildAsset {
    pub package_id: String,
    pub version: String,
    pub sha: String,
    #[serde(default)]
    pub non_shipping: bool,
}

/// A dependency recorded by the VMR for a mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyManifestEntry {
    pub package_id: String,
    pub version: String,
    pub sha: String,
    pub repository_url: String,
}

/// A change to a dependency entry, from the current to the updated value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyUpdate {
    pub package_id: String,
    pub from: Option<DependencyManifestEntry>,
    pub to: DependencyManifestEntry,
}

// ---------------------------------------------------------------------------
// Flow run record
// ---------------------------------------------------------------------------

/// A persisted flow run (one row of `flow_runs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: String,
    pub mapping: String,
    pub direction: Direction,
    pub build_id: String,
    pub source_commit: String,
    pub state: String,
    pub branch: Option<String>,
    pub target_branch: String,
    pub patch_json: Option<String>,
    pub details: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// An audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub mapping: Option<String>,
    pub direction: Option<Direction>,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            mapping: None,
            direction: None,
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            mapping: None,
            direction: None,
            details: details.to_string(),
            success: false,
            timestamp: Utc::now(),
        }
    }

    /// Attach the mapping and direction the entry concerns.
    pub fn for_flow(mut self, mapping: &str, direction: Direction) -> Self {
        self.mapping = Some(mapping.to_string());
        self.direction = Some(direction);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_round_trip_strings() {
        assert_eq!(Direction::from_str_val("forward"), Some(Direction::Forward));
        assert_eq!(Direction::from_str_val("back"), Some(Direction::Backward));
        assert_eq!(Direction::from_str_val("sideways"), None);
        assert_eq!(Direction::Forward.opposite(), Direction::Backward);
        assert_eq!(Direction::Backward.to_string(), "backward");
    }

    #[test]
    fn test_flow_result_success() {
        assert!(FlowResult::new("r", FlowStatus::NoOp).is_success());
        assert!(!FlowResult::new("r", FlowStatus::Conflict).is_success());
    }

    #[test]
    fn test_audit_entry_for_flow() {
        let entry = AuditEntry::failure("flow", "boom").for_flow("sdk", Direction::Forward);
        assert!(!entry.success);
        assert_eq!(entry.mapping.as_deref(), Some("sdk"));
    }
}
