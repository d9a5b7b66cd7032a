//! Mapping registry.
//!
//! A [`Mapping`] ties a product repository to the VMR subdirectory it
//! populates. The [`MappingRegistry`] is built once at startup from the
//! configuration, validated (unique names, well-formed patterns,
//! non-overlapping VMR paths), and then shared read-only by every flow.

pub mod filter;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{AppConfig, MappingConfig};
use crate::errors::ConfigError;

pub use filter::{PathDecision, PathFilter};

/// A validated repository <-> VMR correspondence.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Mapping {
    pub name: String,
    /// VMR-relative subtree, without leading or trailing slashes.
    pub vmr_path: String,
    pub default_remote: String,
    pub default_ref: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub submodules: Vec<String>,
    pub submodule_pointers: bool,
    pub delete_wins: bool,
    pub generated_files: Vec<String>,
    pub version_floors: BTreeMap<String, String>,
    #[serde(skip)]
    filter: PathFilter,
}

impl Mapping {
    /// Validate a single mapping config.
    pub fn from_config(cfg: &MappingConfig) -> Result<Self, ConfigError> {
        if cfg.name.trim().is_empty() || cfg.name.contains(['/', '\\', ' ']) {
            return Err(ConfigError::InvalidValue {
                field: "mappings.name".into(),
                detail: format!("'{}' is not a valid mapping name", cfg.name),
            });
        }
        if cfg.default_remote.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("mappings.{}.default_remote", cfg.name),
                detail: "remote must not be empty".into(),
            });
        }

        let vmr_path = cfg
            .vmr_path
            .clone()
            .unwrap_or_else(|| format!("src/{}", cfg.name))
            .replace('\\', "/")
            .trim_matches('/')
            .to_string();
        if vmr_path.is_empty() || vmr_path.split('/').any(|s| s.is_empty() || s == "." || s == "..")
        {
            return Err(ConfigError::InvalidValue {
                field: format!("mappings.{}.vmr_path", cfg.name),
                detail: format!("'{}' is not a valid relative path", vmr_path),
            });
        }

        for pattern in cfg
            .include
            .iter()
            .chain(&cfg.exclude)
            .chain(&cfg.submodules)
            .chain(&cfg.generated_files)
        {
            filter::validate_pattern(pattern).map_err(|detail| ConfigError::InvalidPattern {
                mapping: cfg.name.clone(),
                pattern: pattern.clone(),
                detail,
            })?;
        }

        for (package, floor) in &cfg.version_floors {
            semver::Version::parse(floor).map_err(|e| ConfigError::InvalidValue {
                field: format!("mappings.{}.version_floors.{}", cfg.name, package),
                detail: e.to_string(),
            })?;
        }

        Ok(Self {
            name: cfg.name.clone(),
            vmr_path,
            default_remote: cfg.default_remote.clone(),
            default_ref: cfg.default_ref.clone(),
            include: cfg.include.clone(),
            exclude: cfg.exclude.clone(),
            submodules: cfg.submodules.clone(),
            submodule_pointers: cfg.submodule_pointers,
            delete_wins: cfg.delete_wins,
            generated_files: cfg.generated_files.clone(),
            version_floors: cfg.version_floors.clone(),
            filter: PathFilter::new(
                cfg.include.clone(),
                cfg.exclude.clone(),
                cfg.submodules.clone(),
            ),
        })
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    /// Map a repository-relative path into the VMR.
    pub fn to_vmr_path(&self, repo_path: &str) -> String {
        format!("{}/{}", self.vmr_path, repo_path.trim_start_matches('/'))
    }

    /// Map a VMR-relative path back into the repository, or `None` if it lies
    /// outside this mapping's subtree.
    pub fn from_vmr_path<'a>(&self, vmr_path: &'a str) -> Option<&'a str> {
        vmr_path
            .strip_prefix(self.vmr_path.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }

    /// `true` if the repository-relative path is a derived file.
    pub fn is_generated(&self, repo_path: &str) -> bool {
        self.generated_files
            .iter()
            .any(|p| glob_match::glob_match(p, repo_path))
    }

    /// Stable hash of everything that influences patch content.
    pub fn scope_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Process-wide, read-only set of mappings.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    mappings: BTreeMap<String, Arc<Mapping>>,
}

impl MappingRegistry {
    /// Build and validate a registry from mapping configs.
    pub fn from_config(configs: &[MappingConfig]) -> Result<Self, ConfigError> {
        let mut mappings: BTreeMap<String, Arc<Mapping>> = BTreeMap::new();

        for cfg in configs {
            let mapping = Mapping::from_config(cfg)?;
            if mappings.contains_key(&mapping.name) {
                return Err(ConfigError::InvalidValue {
                    field: "mappings.name".into(),
                    detail: format!("duplicate mapping name '{}'", mapping.name),
                });
            }
            mappings.insert(mapping.name.clone(), Arc::new(mapping));
        }

        let all: Vec<&Arc<Mapping>> = mappings.values().collect();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                if filter::is_within(&a.vmr_path, &b.vmr_path)
                    || filter::is_within(&b.vmr_path, &a.vmr_path)
                {
                    return Err(ConfigError::OverlappingMappings {
                        first: a.name.clone(),
                        first_path: a.vmr_path.clone(),
                        second: b.name.clone(),
                        second_path: b.vmr_path.clone(),
                    });
                }
            }
        }

        info!(count = mappings.len(), "mapping registry loaded");
        Ok(Self { mappings })
    }

    /// Build from a full config, also checking that the source manifest does
    /// not live inside a mapped subtree.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let registry = Self::from_config(&config.mappings)?;
        let manifest = config.vmr.manifest_path.trim_matches('/');
        if let Some(m) = registry
            .mappings
            .values()
            .find(|m| filter::is_within(manifest, &m.vmr_path))
        {
            return Err(ConfigError::InvalidValue {
                field: "vmr.manifest_path".into(),
                detail: format!("'{}' lies inside mapping '{}'", manifest, m.name),
            });
        }
        Ok(registry)
    }

    /// Look up a mapping by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<Mapping>, ConfigError> {
        debug!(name, "resolving mapping");
        self.mappings
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::MappingNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mapping>> {
        self.mappings.values()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str, vmr_path: Option<&str>) -> MappingConfig {
        MappingConfig {
            name: name.into(),
            vmr_path: vmr_path.map(String::from),
            default_remote: format!("https://example.com/{}", name),
            default_ref: "main".into(),
            include: vec![],
            exclude: vec![],
            submodules: vec![],
            submodule_pointers: false,
            delete_wins: false,
            generated_files: vec![],
            version_floors: BTreeMap::new(),
        }
    }

    #[test]
    fn test_resolve_and_not_found() {
        let reg = MappingRegistry::from_config(&[cfg("runtime", None), cfg("sdk", None)]).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.resolve("runtime").unwrap().vmr_path, "src/runtime");
        assert!(matches!(
            reg.resolve("missing"),
            Err(ConfigError::MappingNotFound(ref n)) if n == "missing"
        ));
    }

    #[test]
    fn test_overlapping_paths_rejected() {
        let result = MappingRegistry::from_config(&[
            cfg("runtime", Some("src/runtime")),
            cfg("extra", Some("src/runtime/extra/")),
        ]);
        assert!(matches!(result, Err(ConfigError::OverlappingMappings { .. })));
    }

    #[test]
    fn test_sibling_prefix_is_not_overlap() {
        let reg = MappingRegistry::from_config(&[
            cfg("runtime", Some("src/runtime")),
            cfg("runtime2", Some("src/runtime2")),
        ]);
        assert!(reg.is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = MappingRegistry::from_config(&[cfg("a", Some("x")), cfg("a", Some("y"))]);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_malformed_pattern_rejected() {
        let mut c = cfg("a", None);
        c.exclude = vec!["docs/[".into()];
        assert!(matches!(
            MappingRegistry::from_config(&[c]),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_bad_version_floor_rejected() {
        let mut c = cfg("a", None);
        c.version_floors.insert("Pkg".into(), "not-a-version".into());
        assert!(Mapping::from_config(&c).is_err());
    }

    #[test]
    fn test_bad_vmr_path_rejected() {
        assert!(Mapping::from_config(&cfg("a", Some("src/../etc"))).is_err());
        assert!(Mapping::from_config(&cfg("a", Some("/"))).is_err());
    }

    #[test]
    fn test_path_translation() {
        let m = Mapping::from_config(&cfg("sdk", Some("/src/sdk/"))).unwrap();
        assert_eq!(m.to_vmr_path("a/b.txt"), "src/sdk/a/b.txt");
        assert_eq!(m.from_vmr_path("src/sdk/a/b.txt"), Some("a/b.txt"));
        assert_eq!(m.from_vmr_path("src/sdk2/a.txt"), None);
        assert_eq!(m.from_vmr_path("src/sdk"), None);
    }

    #[test]
    fn test_scope_hash_changes_with_filter() {
        let a = Mapping::from_config(&cfg("a", None)).unwrap();
        let mut c = cfg("a", None);
        c.exclude = vec!["docs/**".into()];
        let b = Mapping::from_config(&c).unwrap();
        assert_eq!(a.scope_hash(), a.clone().scope_hash());
        assert_ne!(a.scope_hash(), b.scope_hash());
    }

    #[test]
    fn test_manifest_inside_mapping_rejected() {
        let toml_str = r#"
[vmr]
remote = "/srv/vmr"
manifest_path = "src/sdk/manifest.json"

[[mappings]]
name = "sdk"
default_remote = "/srv/sdk"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(MappingRegistry::from_app_config(&config).is_err());
    }
}
