//! Conflict records and resolution policies.
//!
//! The conflict subsystem is responsible for:
//! 1. **Recording** -- the patch applier emits a [`ConflictRecord`] for every
//!    file it could not apply cleanly.
//! 2. **Resolution** -- the [`ConflictResolver`] applies the deterministic
//!    policies (regenerate derived files, edit wins over delete) and
//!    escalates everything else to an operator.

pub mod resolver;

use serde::{Deserialize, Serialize};

pub use resolver::ConflictResolver;

/// Categorisation of a file-level application failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Hunks did not apply against the target's content.
    TextConflict,
    /// Deleted on one side, edited on the other.
    DeleteEdit,
    /// Binary content diverged.
    Binary,
    /// The path lies outside the mapping's declared scope.
    OutOfScope,
}

impl ConflictKind {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "delete_edit" => Self::DeleteEdit,
            "binary" => Self::Binary,
            "out_of_scope" => Self::OutOfScope,
            _ => Self::TextConflict,
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TextConflict => write!(f, "text_conflict"),
            Self::DeleteEdit => write!(f, "delete_edit"),
            Self::Binary => write!(f, "binary"),
            Self::OutOfScope => write!(f, "out_of_scope"),
        }
    }
}

/// What happened to a conflicting file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// A deterministic policy resolved the file.
    Applied,
    /// The file was left untouched on purpose.
    Skipped,
    /// Needs an operator.
    Escalated,
}

impl Resolution {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "applied" => Self::Applied,
            "skipped" => Self::Skipped,
            _ => Self::Escalated,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Skipped => write!(f, "skipped"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

/// Which side of a flow removed a file in a delete/edit conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The repository the flow reads from.
    Source,
    /// The working copy the flow writes to.
    Target,
}

/// A file-level conflict produced while applying a patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictRecord {
    /// Target-relative path of the file.
    pub file_path: String,
    pub kind: ConflictKind,
    pub resolution: Resolution,
    /// For `DeleteEdit`, the side that deleted the file.
    #[serde(default)]
    pub deleted_in: Option<Side>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ConflictRecord {
    /// A new, not yet resolved conflict.
    pub fn new(file_path: impl Into<String>, kind: ConflictKind) -> Self {
        Self {
            file_path: file_path.into(),
            kind,
            resolution: Resolution::Escalated,
            deleted_in: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn deleted_in(mut self, side: Side) -> Self {
        self.deleted_in = Some(side);
        self
    }

    pub fn is_escalated(&self) -> bool {
        self.resolution == Resolution::Escalated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        for kind in [
            ConflictKind::TextConflict,
            ConflictKind::DeleteEdit,
            ConflictKind::Binary,
            ConflictKind::OutOfScope,
        ] {
            assert_eq!(ConflictKind::from_str_val(&kind.to_string()), kind);
        }
    }

    #[test]
    fn test_new_record_is_escalated() {
        let rec = ConflictRecord::new("src/a.txt", ConflictKind::DeleteEdit)
            .deleted_in(Side::Source)
            .with_detail("edited in target");
        assert!(rec.is_escalated());
        assert_eq!(rec.deleted_in, Some(Side::Source));
        assert_eq!(Resolution::from_str_val("skipped"), Resolution::Skipped);
    }
}
