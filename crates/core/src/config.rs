//! TOML-based configuration for the code flow engine.
//!
//! Sensitive values (remote tokens) are stored as `_env` fields that
//! reference environment variable names. The actual secrets are resolved at
//! runtime via [`AppConfig::resolve_env_vars`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine / storage settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// The virtual monorepo.
    pub vmr: VmrConfig,

    /// Identity used on flow commits.
    #[serde(default)]
    pub committer: CommitterConfig,

    /// Repository <-> VMR subtree mappings.
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for persistent data (database, repository caches).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for scratch working copies and archived patches.
    /// Defaults to the system temp directory.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Retry a flow once with a fresh read when its sync point moved.
    #[serde(default = "default_true")]
    pub retry_on_concurrent_modification: bool,

    /// Keep materialized patch files for diagnostics.
    #[serde(default)]
    pub archive_patches: bool,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("codeflow"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/codeflow"))
}
fn default_log_level() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tmp_dir: None,
            log_level: default_log_level(),
            retry_on_concurrent_modification: true,
            archive_patches: false,
        }
    }
}

impl EngineConfig {
    /// Scratch root for working copies.
    pub fn scratch_root(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

// ---------------------------------------------------------------------------
// VMR
// ---------------------------------------------------------------------------

/// Virtual monorepo settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmrConfig {
    /// Clone URL or local path of the VMR.
    pub remote: String,

    /// Path of the generated source manifest inside the VMR.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,

    /// Default branch name (e.g. `main`).
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Environment variable holding an access token for HTTPS remotes.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_manifest_path() -> String {
    "src/source-manifest.json".into()
}
fn default_branch() -> String {
    "main".into()
}

// ---------------------------------------------------------------------------
// Committer
// ---------------------------------------------------------------------------

/// Identity recorded on flow commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitterConfig {
    #[serde(default = "default_committer_name")]
    pub name: String,
    #[serde(default = "default_committer_email")]
    pub email: String,
}

fn default_committer_name() -> String {
    "codeflow".into()
}
fn default_committer_email() -> String {
    "codeflow@localhost".into()
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            name: default_committer_name(),
            email: default_committer_email(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mappings
// ---------------------------------------------------------------------------

/// One product repository <-> VMR subtree correspondence, as written in the
/// config file. Validated into a [`crate::mapping::Mapping`] by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingConfig {
    /// Unique mapping name.
    pub name: String,

    /// VMR subdirectory populated by this repository (default `src/<name>`).
    #[serde(default)]
    pub vmr_path: Option<String>,

    /// Clone URL or local path of the product repository.
    pub default_remote: String,

    /// Default branch of the product repository.
    #[serde(default = "default_branch")]
    pub default_ref: String,

    /// Glob patterns (repo-relative) that are flowed. Empty = everything.
    #[serde(default)]
    pub include: Vec<String>,

    /// Glob patterns (repo-relative) that are never flowed.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Repo-relative submodule paths; their content is never flowed.
    #[serde(default)]
    pub submodules: Vec<String>,

    /// Record submodule pointer updates in the source manifest.
    #[serde(default)]
    pub submodule_pointers: bool,

    /// Resolve delete/edit conflicts in favour of the deletion.
    #[serde(default)]
    pub delete_wins: bool,

    /// Globs of derived files regenerated instead of merged on conflict.
    #[serde(default)]
    pub generated_files: Vec<String>,

    /// Minimum accepted version per package ID.
    #[serde(default)]
    pub version_floors: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(mappings = config.mappings.len(), "configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// Missing variables log a warning but do not fail; local-path remotes
    /// need no token.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.vmr.token_env {
            self.vmr.token = resolve_optional_env(env_name, "vmr.token_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate engine-level fields. Mapping validation (overlap, patterns)
    /// is done by [`crate::mapping::MappingRegistry::from_config`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vmr.remote.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "vmr.remote".into(),
                detail: "VMR remote must not be empty".into(),
            });
        }
        if self.vmr.manifest_path.trim().is_empty() || self.vmr.manifest_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "vmr.manifest_path".into(),
                detail: "manifest path must be a non-empty relative path".into(),
            });
        }
        if self.committer.email.is_empty() || !self.committer.email.contains('@') {
            return Err(ConfigError::InvalidValue {
                field: "committer.email".into(),
                detail: "committer email must look like an address".into(),
            });
        }
        if self.mappings.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "mappings".into(),
                detail: "at least one mapping is required".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the SQLite database under the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.engine.data_dir.join("codeflow.db")
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[engine]
data_dir = "/tmp/codeflow"
tmp_dir = "/tmp/codeflow-scratch"
log_level = "debug"
archive_patches = true

[vmr]
remote = "https://github.com/acme/vmr"
manifest_path = "src/source-manifest.json"
token_env = "VMR_TOKEN"

[committer]
name = "Flow Bot"
email = "flow@example.com"

[[mappings]]
name = "runtime"
default_remote = "https://github.com/acme/runtime"
include = ["src/**", "eng/**"]
exclude = ["docs/**"]
submodules = ["external/zlib"]
generated_files = ["eng/Version.Details.xml"]

[mappings.version_floors]
"Acme.Runtime" = "8.0.0"

[[mappings]]
name = "sdk"
vmr_path = "src/sdk"
default_remote = "https://github.com/acme/sdk"
delete_wins = true
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.engine.log_level, "debug");
        assert!(config.engine.archive_patches);
        assert!(config.engine.retry_on_concurrent_modification);
        assert_eq!(config.vmr.default_branch, "main");
        assert_eq!(config.mappings.len(), 2);
        assert_eq!(config.mappings[0].vmr_path, None);
        assert_eq!(config.mappings[0].exclude, vec!["docs/**"]);
        assert_eq!(
            config.mappings[0].version_floors.get("Acme.Runtime").map(String::as_str),
            Some("8.0.0")
        );
        assert!(config.mappings[1].delete_wins);
        assert_eq!(config.mappings[1].default_ref, "main");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codeflow.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.committer.name, "Flow Bot");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/codeflow/codeflow.db"));
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/codeflow.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_empty_remote() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.vmr.remote = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "vmr.remote"
        ));
    }

    #[test]
    fn test_validate_rejects_no_mappings() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.mappings.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "mappings"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_CODEFLOW_VMR_TOKEN", "ghp_abc");
        let toml_str = r#"
[vmr]
remote = "https://github.com/acme/vmr"
token_env = "TEST_CODEFLOW_VMR_TOKEN"

[[mappings]]
name = "m"
default_remote = "/tmp/m"
"#;
        let mut config: AppConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.vmr.token.as_deref(), Some("ghp_abc"));
        std::env::remove_var("TEST_CODEFLOW_VMR_TOKEN");
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[vmr]
remote = "/srv/vmr"

[[mappings]]
name = "m"
default_remote = "/srv/m"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.engine.log_level, "info");
        assert_eq!(config.vmr.manifest_path, "src/source-manifest.json");
        assert_eq!(config.committer.name, "codeflow");
        assert!(!config.mappings[0].submodule_pointers);
        assert!(config.mappings[0].include.is_empty());
        assert!(config.validate().is_ok());
    }
}
