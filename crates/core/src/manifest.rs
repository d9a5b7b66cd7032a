//! Version update step and the VMR source manifest.
//!
//! [`plan_updates`] reconciles a build's assets with a mapping's recorded
//! dependency entries. [`SourceManifest`] is the JSON file at the root of the
//! VMR that records, per mapping, which source commit was flowed, the
//! dependency entries, and submodule pointers.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ManifestError;
use crate::mapping::Mapping;
use crate::models::{BuildAsset, DependencyManifestEntry, DependencyUpdate};
use crate::patch::SubmodulePointer;

// ---------------------------------------------------------------------------
// Version update step
// ---------------------------------------------------------------------------

/// Result of reconciling a build against the recorded entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionUpdate {
    /// Entries that change, with their previous value.
    pub updated: Vec<DependencyUpdate>,
    /// Updates refused because they fall below the mapping's version floor.
    pub rejected: Vec<DependencyUpdate>,
}

impl VersionUpdate {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
    }

    /// New values to record.
    pub fn entries(&self) -> Vec<DependencyManifestEntry> {
        self.updated.iter().map(|u| u.to.clone()).collect()
    }

    /// `current` with every update applied, ordered by package ID.
    pub fn merged(&self, current: &[DependencyManifestEntry]) -> Vec<DependencyManifestEntry> {
        let mut by_id: BTreeMap<&str, &DependencyManifestEntry> =
            current.iter().map(|e| (e.package_id.as_str(), e)).collect();
        for update in &self.updated {
            by_id.insert(update.package_id.as_str(), &update.to);
        }
        by_id.into_values().cloned().collect()
    }
}

/// `true` if `package_id` matches one of the excluded IDs or globs.
pub fn is_excluded(package_id: &str, excluded: &[String]) -> bool {
    excluded
        .iter()
        .any(|p| p == package_id || glob_match::glob_match(p, package_id))
}

/// Work out which dependency entries a build changes.
///
/// Assets in `excluded` are ignored. When a build lists the same package
/// twice the later asset wins. A version below the current one is accepted
/// with a warning unless the mapping pins a floor it would fall under.
pub fn plan_updates(
    mapping: &Mapping,
    current: &[DependencyManifestEntry],
    assets: &[BuildAsset],
    excluded: &[String],
    repository_url: &str,
) -> Result<VersionUpdate, ManifestError> {
    let current: BTreeMap<&str, &DependencyManifestEntry> =
        current.iter().map(|e| (e.package_id.as_str(), e)).collect();

    let mut latest: BTreeMap<&str, &BuildAsset> = BTreeMap::new();
    for asset in assets {
        if is_excluded(&asset.package_id, excluded) {
            debug!(package = %asset.package_id, "asset excluded from version update");
            continue;
        }
        latest.insert(asset.package_id.as_str(), asset);
    }

    let mut plan = VersionUpdate::default();
    for (package_id, asset) in latest {
        let to = DependencyManifestEntry {
            package_id: package_id.to_string(),
            version: asset.version.clone(),
            sha: asset.sha.clone(),
            repository_url: repository_url.to_string(),
        };
        let from = current.get(package_id).map(|e| (*e).clone());
        if from.as_ref() == Some(&to) {
            continue;
        }
        let update = DependencyUpdate {
            package_id: package_id.to_string(),
            from,
            to,
        };

        if let Some(floor) = mapping.version_floors.get(package_id) {
            if below_floor(package_id, &asset.version, floor)? {
                warn!(
                    mapping = %mapping.name,
                    package = package_id,
                    version = %asset.version,
                    floor = %floor,
                    "update rejected by version floor"
                );
                plan.rejected.push(update);
                continue;
            }
        }

        if let Some(prev) = &update.from {
            if is_downgrade(&prev.version, &update.to.version) {
                warn!(
                    mapping = %mapping.name,
                    package = package_id,
                    from = %prev.version,
                    to = %update.to.version,
                    "dependency version decreases"
                );
            }
        }
        plan.updated.push(update);
    }

    info!(
        mapping = %mapping.name,
        updated = plan.updated.len(),
        rejected = plan.rejected.len(),
        "version update planned"
    );
    Ok(plan)
}

fn below_floor(package: &str, version: &str, floor: &str) -> Result<bool, ManifestError> {
    let parse = |v: &str| {
        semver::Version::parse(v).map_err(|e| ManifestError::InvalidVersion {
            package: package.to_string(),
            version: v.to_string(),
            detail: e.to_string(),
        })
    };
    Ok(parse(version)? < parse(floor)?)
}

fn is_downgrade(from: &str, to: &str) -> bool {
    match (semver::Version::parse(from), semver::Version::parse(to)) {
        (Ok(f), Ok(t)) => t < f,
        _ => false,
    }
}

/// Content of a generated dependency file: the entries as pretty JSON,
/// ordered by package ID.
pub fn render_dependency_file(entries: &[DependencyManifestEntry]) -> String {
    #[derive(Serialize)]
    struct DependencyFile<'a> {
        dependencies: Vec<&'a DependencyManifestEntry>,
    }

    let mut sorted: Vec<&DependencyManifestEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.package_id.cmp(&b.package_id));
    let mut out = serde_json::to_string_pretty(&DependencyFile {
        dependencies: sorted,
    })
    .unwrap_or_default();
    out.push('\n');
    out
}

// ---------------------------------------------------------------------------
// Source manifest
// ---------------------------------------------------------------------------

/// One mapping's record in the source manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub path: String,
    pub remote_uri: String,
    pub commit_sha: String,
    #[serde(default)]
    pub dependencies: Vec<DependencyManifestEntry>,
    /// Submodule path -> pinned commit.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub submodules: BTreeMap<String, String>,
}

/// The VMR's record of what every mapping last flowed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceManifest {
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryRecord>,
}

impl SourceManifest {
    /// Read the manifest, or an empty one if the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no source manifest yet");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a forward flow of `mapping` at `commit_sha`.
    pub fn update(
        &mut self,
        mapping: &Mapping,
        commit_sha: &str,
        dependencies: Vec<DependencyManifestEntry>,
        submodules: &[SubmodulePointer],
    ) {
        let record = self
            .repositories
            .entry(mapping.name.clone())
            .or_default();
        record.path = mapping.vmr_path.clone();
        record.remote_uri = mapping.default_remote.clone();
        record.commit_sha = commit_sha.to_string();
        record.dependencies = dependencies;
        for pointer in submodules {
            match &pointer.sha {
                Some(sha) => {
                    record.submodules.insert(pointer.path.clone(), sha.clone());
                }
                None => {
                    record.submodules.remove(&pointer.path);
                }
            }
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MappingConfig;

    fn mapping(floors: &[(&str, &str)]) -> Mapping {
        Mapping::from_config(&MappingConfig {
            name: "sdk".into(),
            vmr_path: None,
            default_remote: "https://example.com/sdk".into(),
            default_ref: "main".into(),
            include: vec![],
            exclude: vec![],
            submodules: vec![],
            submodule_pointers: false,
            delete_wins: false,
            generated_files: vec![],
            version_floors: floors
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
        .unwrap()
    }

    fn asset(id: &str, version: &str) -> BuildAsset {
        BuildAsset {
            package_id: id.into(),
            version: version.into(),
            sha: format!("sha-{}", version),
            non_shipping: false,
        }
    }

    fn entry(id: &str, version: &str) -> DependencyManifestEntry {
        DependencyManifestEntry {
            package_id: id.into(),
            version: version.into(),
            sha: format!("sha-{}", version),
            repository_url: "https://example.com/sdk".into(),
        }
    }

    #[test]
    fn test_new_and_changed_entries() {
        let m = mapping(&[]);
        let current = vec![entry("A", "1.0.0"), entry("B", "2.0.0")];
        let assets = vec![asset("A", "1.1.0"), asset("B", "2.0.0"), asset("C", "0.1.0")];
        let plan = plan_updates(&m, &current, &assets, &[], "https://example.com/sdk").unwrap();

        let ids: Vec<&str> = plan.updated.iter().map(|u| u.package_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
        assert_eq!(plan.updated[0].from, Some(entry("A", "1.0.0")));
        assert!(plan.updated[1].from.is_none());

        let merged = plan.merged(&current);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].version, "1.1.0");
    }

    #[test]
    fn test_excluded_assets_skipped() {
        let m = mapping(&[]);
        let assets = vec![asset("Acme.Internal.X", "1.0.0"), asset("Acme.Public", "1.0.0")];
        let plan = plan_updates(&m, &[], &assets, &["Acme.Internal.*".into()], "u").unwrap();
        assert_eq!(plan.updated.len(), 1);
        assert_eq!(plan.updated[0].package_id, "Acme.Public");
    }

    #[test]
    fn test_downgrade_accepted_without_floor() {
        let m = mapping(&[]);
        let plan = plan_updates(&m, &[entry("A", "2.0.0")], &[asset("A", "1.5.0")], &[], "u").unwrap();
        assert_eq!(plan.updated.len(), 1);
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn test_floor_rejects_lower_version() {
        let m = mapping(&[("A", "2.0.0")]);
        let plan = plan_updates(&m, &[entry("A", "2.1.0")], &[asset("A", "1.9.0")], &[], "u").unwrap();
        assert!(plan.updated.is_empty());
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].to.version, "1.9.0");
    }

    #[test]
    fn test_floor_with_unparsable_version_errors() {
        let m = mapping(&[("A", "2.0.0")]);
        let result = plan_updates(&m, &[], &[asset("A", "latest")], &[], "u");
        assert!(matches!(result, Err(ManifestError::InvalidVersion { .. })));
    }

    #[test]
    fn test_render_dependency_file_sorted() {
        let text = render_dependency_file(&[entry("B", "1.0.0"), entry("A", "1.0.0")]);
        let a = text.find("\"A\"").unwrap();
        let b = text.find("\"B\"").unwrap();
        assert!(a < b);
        assert!(text.ends_with('\n'));
        assert_eq!(text, render_dependency_file(&[entry("A", "1.0.0"), entry("B", "1.0.0")]));
    }

    #[test]
    fn test_source_manifest_load_update_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src/source-manifest.json");
        let mut manifest = SourceManifest::load(&path).unwrap();
        assert!(manifest.repositories.is_empty());

        let m = mapping(&[]);
        manifest.update(
            &m,
            "abc",
            vec![entry("A", "1.0.0")],
            &[SubmodulePointer {
                path: "external/zlib".into(),
                sha: Some("f00".into()),
            }],
        );
        manifest.write(&path).unwrap();

        let back = SourceManifest::load(&path).unwrap();
        let record = &back.repositories["sdk"];
        assert_eq!(record.commit_sha, "abc");
        assert_eq!(record.path, "src/sdk");
        assert_eq!(record.submodules["external/zlib"], "f00");

        let mut again = back.clone();
        again.update(
            &m,
            "def",
            vec![],
            &[SubmodulePointer {
                path: "external/zlib".into(),
                sha: None,
            }],
        );
        assert!(again.repositories["sdk"].submodules.is_empty());
    }
}
