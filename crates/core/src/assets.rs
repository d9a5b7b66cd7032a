//! Build asset sources.
//!
//! The engine asks a [`BuildAssetSource`] for the assets a build produced.
//! Production deployments plug in their build registry; the in-memory and
//! JSON file sources here cover the CLI and tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use crate::errors::AssetError;
use crate::models::BuildAsset;

/// Looks up the ordered list of assets produced by a build.
pub trait BuildAssetSource: Send + Sync {
    fn assets_for_build(&self, build_id: &str) -> Result<Vec<BuildAsset>, AssetError>;
}

/// Assets held in memory, keyed by build ID.
#[derive(Debug, Default)]
pub struct StaticAssetSource {
    builds: RwLock<HashMap<String, Vec<BuildAsset>>>,
}

impl StaticAssetSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the assets of a build.
    pub fn insert(&self, build_id: &str, assets: Vec<BuildAsset>) {
        let mut builds = self.builds.write().unwrap_or_else(|e| e.into_inner());
        builds.insert(build_id.to_string(), assets);
    }
}

impl BuildAssetSource for StaticAssetSource {
    fn assets_for_build(&self, build_id: &str) -> Result<Vec<BuildAsset>, AssetError> {
        let builds = self.builds.read().unwrap_or_else(|e| e.into_inner());
        builds
            .get(build_id)
            .cloned()
            .ok_or_else(|| AssetError::BuildNotFound(build_id.to_string()))
    }
}

/// A JSON file mapping build IDs to asset lists:
///
/// ```json
/// { "20260101.1": [ { "package_id": "Acme.Tools", "version": "1.2.3", "sha": "abc" } ] }
/// ```
///
/// The file is re-read on every lookup.
#[derive(Debug, Clone)]
pub struct JsonFileAssetSource {
    path: PathBuf,
}

impl JsonFileAssetSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl BuildAssetSource for JsonFileAssetSource {
    fn assets_for_build(&self, build_id: &str) -> Result<Vec<BuildAsset>, AssetError> {
        let text = std::fs::read_to_string(&self.path)?;
        let mut builds: HashMap<String, Vec<BuildAsset>> = serde_json::from_str(&text)?;
        debug!(path = %self.path.display(), builds = builds.len(), "loaded asset file");
        builds
            .remove(build_id)
            .ok_or_else(|| AssetError::BuildNotFound(build_id.to_string()))
    }
}

/// A source for builds that publish nothing. Every build has no assets.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyAssetSource;

impl BuildAssetSource for EmptyAssetSource {
    fn assets_for_build(&self, _build_id: &str) -> Result<Vec<BuildAsset>, AssetError> {
        Ok(Vec::new())
    }
}
