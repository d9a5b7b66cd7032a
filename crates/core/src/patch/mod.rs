//! Patches: the scoped, ordered diff carried across a mapping boundary.
//!
//! A [`Patch`] is built by [`builder::PatchBuilder`] from two commits of the
//! source repository and applied by [`applier::PatchApplier`] to a target
//! working copy. Patches serialize to JSON so a run that stopped on a
//! conflict can resume without rebuilding, and so the fingerprint of a
//! rebuilt patch can be compared against an earlier one.

pub mod applier;
pub mod builder;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::PatchError;
use crate::git::EntryMode;
use crate::models::Direction;

pub use applier::{ApplyResult, PatchApplier};
pub use builder::PatchBuilder;

/// How a file changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    /// Moved from `from` (target-relative), possibly with edits.
    Rename { from: String },
}

impl ChangeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Rename { .. } => "rename",
        }
    }
}

/// One file of a patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilePatch {
    /// Path in the target working copy.
    pub path: String,
    /// Path relative to the product repository root.
    pub repo_path: String,
    pub change: ChangeKind,
    /// Blob id of the base content (`None` for additions).
    pub old_id: Option<String>,
    /// Blob id of the new content (`None` for deletions).
    pub new_id: Option<String>,
    pub binary: bool,
    #[serde(default)]
    pub old_mode: EntryMode,
    #[serde(default)]
    pub new_mode: EntryMode,
    /// Unified diff from the base to the new content, for text files.
    #[serde(default)]
    pub diff: Option<String>,
    /// Full new content.
    #[serde(default, with = "hex_bytes")]
    pub content: Option<Vec<u8>>,
}

/// A submodule pointer change. Content below a submodule is never flowed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmodulePointer {
    /// Repository-relative submodule path.
    pub path: String,
    /// Commit the pointer now references; `None` if the submodule was removed.
    pub sha: Option<String>,
}

/// The diff between two commits of a mapping, in application order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Patch {
    pub mapping: String,
    pub direction: Direction,
    /// Source commit the diff starts from; `None` for a full import.
    pub base_sha: Option<String>,
    pub source_sha: String,
    pub files: Vec<FilePatch>,
    #[serde(default)]
    pub submodules: Vec<SubmodulePointer>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.submodules.is_empty()
    }

    /// SHA-256 of the serialized patch. Identical inputs give identical
    /// fingerprints.
    pub fn fingerprint(&self) -> Result<String, PatchError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write the patch as numbered `.patch` files (one per file, in
    /// application order) plus `patch.json` into `dir`.
    pub fn materialize(&self, dir: &Path) -> Result<Vec<PathBuf>, PatchError> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(self.files.len() + 1);

        for (i, file) in self.files.iter().enumerate() {
            let name = format!("{:04}-{}.patch", i + 1, file.path.replace('/', "_"));
            let path = dir.join(name);
            std::fs::write(&path, render_file_patch(file))?;
            written.push(path);
        }

        let json = serde_json::to_string_pretty(self)?;
        let json_path = dir.join("patch.json");
        std::fs::write(&json_path, json)?;
        written.push(json_path);

        debug!(dir = %dir.display(), files = self.files.len(), "patch materialized");
        Ok(written)
    }
}

/// Git-style text for one file of a patch.
fn render_file_patch(file: &FilePatch) -> String {
    let from = match &file.change {
        ChangeKind::Rename { from } => from.as_str(),
        _ => file.path.as_str(),
    };
    let mut out = format!("diff --git a/{} b/{}\n", from, file.path);
    match &file.change {
        ChangeKind::Add => out.push_str(&format!("new file mode {}\n", file.new_mode.octal())),
        ChangeKind::Delete => {
            out.push_str(&format!("deleted file mode {}\n", file.old_mode.octal()))
        }
        ChangeKind::Rename { from } => {
            out.push_str(&format!("rename from {}\nrename to {}\n", from, file.path))
        }
        ChangeKind::Modify => {}
    }
    let mode_changed = matches!(file.change, ChangeKind::Modify | ChangeKind::Rename { .. })
        && file.old_mode != file.new_mode;
    if mode_changed {
        out.push_str(&format!(
            "old mode {}\nnew mode {}\n",
            file.old_mode.octal(),
            file.new_mode.octal()
        ));
    }
    out.push_str(&format!(
        "index {}..{}\n",
        file.old_id.as_deref().unwrap_or("0000000"),
        file.new_id.as_deref().unwrap_or("0000000")
    ));
    if file.binary {
        out.push_str("Binary files differ\n");
    } else if let Some(diff) = &file.diff {
        out.push_str(diff);
    }
    out
}

/// Serialize optional bytes as a hex string.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(d)?;
        value
            .map(|h| hex::decode(h).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Patch {
        Patch {
            mapping: "sdk".into(),
            direction: Direction::Forward,
            base_sha: Some("aaa".into()),
            source_sha: "bbb".into(),
            files: vec![
                FilePatch {
                    path: "src/sdk/a.txt".into(),
                    repo_path: "a.txt".into(),
                    change: ChangeKind::Modify,
                    old_id: Some("1".into()),
                    new_id: Some("2".into()),
                    binary: false,
                    old_mode: EntryMode::Regular,
                    new_mode: EntryMode::Executable,
                    diff: Some("--- original\n+++ modified\n@@ -1 +1 @@\n-x\n+y\n".into()),
                    content: Some(b"y\n".to_vec()),
                },
                FilePatch {
                    path: "src/sdk/img.png".into(),
                    repo_path: "img.png".into(),
                    change: ChangeKind::Rename {
                        from: "src/sdk/old.png".into(),
                    },
                    old_id: Some("3".into()),
                    new_id: Some("3".into()),
                    binary: true,
                    old_mode: EntryMode::Regular,
                    new_mode: EntryMode::Regular,
                    diff: None,
                    content: Some(vec![0, 159, 146, 150]),
                },
            ],
            submodules: vec![],
        }
    }

    #[test]
    fn test_json_preserves_binary_content() {
        let patch = sample();
        let back = Patch::from_json(&patch.to_json().unwrap()).unwrap();
        assert_eq!(back, patch);
        assert_eq!(back.fingerprint().unwrap(), patch.fingerprint().unwrap());
    }

    #[test]
    fn test_fingerprint_sensitive_to_content() {
        let a = sample();
        let mut b = sample();
        b.files[0].content = Some(b"z\n".to_vec());
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_materialize_numbers_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let written = sample().materialize(dir.path()).unwrap();
        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["0001-src_sdk_a.txt.patch", "0002-src_sdk_img.png.patch", "patch.json"]
        );
        let second = std::fs::read_to_string(&written[1]).unwrap();
        let first = std::fs::read_to_string(&written[0]).unwrap();
        assert!(first.contains("old mode 100644\nnew mode 100755\n"));
        assert!(second.contains("rename from src/sdk/old.png"));
        assert!(!second.contains("mode"));
        assert!(second.contains("Binary files differ"));
    }
}
