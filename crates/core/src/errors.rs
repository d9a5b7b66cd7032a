//! Error types for the code flow core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type. [`FlowError::class`] maps flow failures onto the
//! operator-facing taxonomy reported in a flow result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// A remote could not be cloned or fetched.
    #[error("git remote '{remote}' unavailable: {detail}")]
    RemoteUnavailable {
        remote: String,
        detail: String,
    },

    /// Push was rejected (e.g. non-fast-forward).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected {
        branch: String,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and mapping registry validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Two mappings populate overlapping VMR subtrees.
    #[error("mappings '{first}' ({first_path}) and '{second}' ({second_path}) have overlapping vmr paths")]
    OverlappingMappings {
        first: String,
        first_path: String,
        second: String,
        second_path: String,
    },

    /// An include/exclude/submodule pattern is malformed.
    #[error("mapping '{mapping}' has malformed pattern '{pattern}': {detail}")]
    InvalidPattern {
        mapping: String,
        pattern: String,
        detail: String,
    },

    /// No mapping is registered under the requested name.
    #[error("mapping not found: {0}")]
    MappingNotFound(String),

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// A stored JSON column could not be (de)serialized.
    #[error("database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tracker errors
// ---------------------------------------------------------------------------

/// Errors from the dependency/manifest tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The stored sync point changed since this flow read it.
    #[error(
        "sync point for '{mapping}' ({direction}) was modified concurrently \
         (expected generation {expected:?}, found {found:?})"
    )]
    ConcurrentModification {
        mapping: String,
        direction: String,
        expected: Option<i64>,
        found: Option<i64>,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Patch errors
// ---------------------------------------------------------------------------

/// Errors from building, materializing, or applying a patch.
#[derive(Debug, Error)]
pub enum PatchError {
    /// Underlying Git error while reading trees or blobs.
    #[error("patch git error: {0}")]
    Git(#[from] GitError),

    /// A stored unified diff could not be parsed.
    #[error("malformed diff for '{path}': {detail}")]
    MalformedDiff {
        path: String,
        detail: String,
    },

    /// A patch could not be (de)serialized.
    #[error("patch serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Application was cancelled between two files.
    #[error("patch application cancelled after {applied} file(s)")]
    Cancelled {
        applied: usize,
    },

    /// Generic I/O error writing to the working copy.
    #[error("patch I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<git2::Error> for PatchError {
    fn from(e: git2::Error) -> Self {
        PatchError::Git(GitError::Git2Error(e))
    }
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from operator conflict resolution.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The conflict ID does not exist.
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// The conflict has already been resolved.
    #[error("conflict already resolved: {0}")]
    AlreadyResolved(String),

    /// Database error while updating conflict state.
    #[error("conflict database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Manifest errors
// ---------------------------------------------------------------------------

/// Errors from the version update step and the VMR source manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// A version string is not valid semver.
    #[error("invalid version '{version}' for package '{package}': {detail}")]
    InvalidVersion {
        package: String,
        version: String,
        detail: String,
    },

    /// The source manifest could not be (de)serialized.
    #[error("source manifest parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("source manifest I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Asset source errors
// ---------------------------------------------------------------------------

/// Errors from a build asset source.
#[derive(Debug, Error)]
pub enum AssetError {
    /// The source knows nothing about the build.
    #[error("build not found: {0}")]
    BuildNotFound(String),

    /// The asset listing could not be parsed.
    #[error("asset listing parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("asset source I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Flow errors
// ---------------------------------------------------------------------------

/// Failure classes reported to flow callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad configuration or a request that can never succeed as issued.
    Configuration,
    /// The sync point moved under the flow.
    ConcurrentModification,
    /// A repository could not be reached; retry belongs to the caller.
    SourceUnavailable,
    /// The flow was cancelled and abandoned its working copy.
    Cancelled,
    /// Anything else (database, local I/O).
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::ConcurrentModification => write!(f, "concurrent_modification"),
            Self::SourceUnavailable => write!(f, "source_unavailable"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Errors from the forward and back flowers.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The request's source commit does not descend from the sync point.
    #[error(
        "history of '{mapping}' was rewritten: {source_commit} does not descend \
         from sync point {sync_point_sha}"
    )]
    HistoryRewritten {
        mapping: String,
        sync_point_sha: String,
        source_commit: String,
    },

    /// A patch's base does not match the mapping's current sync point.
    #[error("patch for '{mapping}' starts at {patch_base:?} but the sync point is at {sync_point:?}")]
    GapDetected {
        mapping: String,
        patch_base: Option<String>,
        sync_point: Option<String>,
    },

    /// A rebuilt patch differs from one built earlier for the same inputs.
    #[error("patch for '{mapping}' {base}..{source_commit} is not deterministic (expected {expected}, got {actual})")]
    DeterminismViolation {
        mapping: String,
        base: String,
        source_commit: String,
        expected: String,
        actual: String,
    },

    /// The build asset source failed.
    #[error("build assets for build {build_id} unavailable: {detail}")]
    AssetsUnavailable {
        build_id: String,
        detail: String,
    },

    /// The flow was cancelled.
    #[error("flow cancelled")]
    Cancelled,

    #[error("flow configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("flow git error: {0}")]
    Git(#[from] GitError),

    #[error("flow patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("flow tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("flow manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("flow database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("flow I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl FlowError {
    /// Classify this error for the caller.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::HistoryRewritten { .. }
            | Self::GapDetected { .. }
            | Self::DeterminismViolation { .. }
            | Self::Config(_)
            | Self::Git(GitError::RefNotFound(_)) => ErrorClass::Configuration,
            Self::Tracker(TrackerError::ConcurrentModification { .. }) => {
                ErrorClass::ConcurrentModification
            }
            Self::Git(GitError::RemoteUnavailable { .. })
            | Self::Git(GitError::PushRejected { .. })
            | Self::Patch(PatchError::Git(GitError::RemoteUnavailable { .. }))
            | Self::AssetsUnavailable { .. } => ErrorClass::SourceUnavailable,
            Self::Cancelled | Self::Patch(PatchError::Cancelled { .. }) => ErrorClass::Cancelled,
            _ => ErrorClass::Internal,
        }
    }
}

impl From<git2::Error> for FlowError {
    fn from(e: git2::Error) -> Self {
        FlowError::Git(GitError::Git2Error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = GitError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = ConfigError::OverlappingMappings {
            first: "runtime".into(),
            first_path: "src/runtime".into(),
            second: "runtime-extra".into(),
            second_path: "src/runtime/extra".into(),
        };
        assert!(err.to_string().contains("overlapping"));

        let err = TrackerError::ConcurrentModification {
            mapping: "sdk".into(),
            direction: "forward".into(),
            expected: Some(1),
            found: Some(2),
        };
        assert!(err.to_string().contains("concurrently"));
    }

    #[test]
    fn test_flow_error_classes() {
        let err = FlowError::HistoryRewritten {
            mapping: "m".into(),
            sync_point_sha: "a".into(),
            source_commit: "b".into(),
        };
        assert_eq!(err.class(), ErrorClass::Configuration);

        let err: FlowError = GitError::RefNotFound("deadbeef".into()).into();
        assert_eq!(err.class(), ErrorClass::Configuration);

        let err: FlowError = TrackerError::ConcurrentModification {
            mapping: "m".into(),
            direction: "backward".into(),
            expected: None,
            found: Some(1),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::ConcurrentModification);

        let err: FlowError = GitError::RemoteUnavailable {
            remote: "origin".into(),
            detail: "timed out".into(),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::SourceUnavailable);

        let err: FlowError = PatchError::Cancelled { applied: 3 }.into();
        assert_eq!(err.class(), ErrorClass::Cancelled);

        let err: FlowError = DatabaseError::NotFound {
            entity: "flow_run".into(),
            id: "x".into(),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::Internal);
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let core_err: CoreError = ConfigError::MappingNotFound("x".into()).into();
        assert!(matches!(core_err, CoreError::Config(_)));

        let core_err: CoreError = FlowError::Cancelled.into();
        assert!(matches!(core_err, CoreError::Flow(_)));
    }
}
