//! Path scoping for a mapping.
//!
//! Provides [`PathFilter`] which encapsulates a mapping's `include`,
//! `exclude`, and `submodules` settings and evaluates repository-relative
//! paths before they are put into a patch.
//!
//! # Decision model
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | Path is a submodule or lies inside one | `Submodule` |
//! | Path matches an exclude pattern | `Excluded` |
//! | Include list non-empty and no include pattern matches | `NotIncluded` |
//! | None of the above | `Allow` |

use tracing::debug;

// ---------------------------------------------------------------------------
// Decision enum
// ---------------------------------------------------------------------------

/// The outcome of evaluating a path against the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    /// Path is in scope -- flow it.
    Allow,
    /// Path matches an exclude pattern.
    Excluded { pattern: String },
    /// Path matches none of the include patterns.
    NotIncluded,
    /// Path is a submodule boundary or lies inside one.
    Submodule { path: String },
}

impl PathDecision {
    /// `true` if the path's content should be flowed.
    pub fn in_scope(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Short human-readable label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Excluded { .. } => "excluded",
            Self::NotIncluded => "not-included",
            Self::Submodule { .. } => "submodule",
        }
    }
}

// ---------------------------------------------------------------------------
// PathFilter
// ---------------------------------------------------------------------------

/// Evaluates repository-relative paths against include/exclude globs and
/// submodule boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    submodules: Vec<String>,
}

impl PathFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>, submodules: Vec<String>) -> Self {
        Self {
            include,
            exclude,
            submodules: submodules
                .into_iter()
                .map(|s| s.trim_matches('/').to_string())
                .collect(),
        }
    }

    /// Evaluate a path.
    pub fn evaluate(&self, rel_path: &str) -> PathDecision {
        let path = normalize(rel_path);

        if let Some(sub) = self.submodule_for(&path) {
            return PathDecision::Submodule {
                path: sub.to_string(),
            };
        }

        for pattern in &self.exclude {
            if matches_pattern(&path, pattern) {
                debug!(path = %path, pattern = pattern.as_str(), "path matches exclude pattern");
                return PathDecision::Excluded {
                    pattern: pattern.clone(),
                };
            }
        }

        if !self.include.is_empty() && !self.include.iter().any(|p| matches_pattern(&path, p)) {
            return PathDecision::NotIncluded;
        }

        PathDecision::Allow
    }

    /// The configured submodule containing `rel_path`, if any.
    pub fn submodule_for(&self, rel_path: &str) -> Option<&str> {
        self.submodules
            .iter()
            .find(|sub| is_within(rel_path, sub))
            .map(String::as_str)
    }

    /// Whether the filter restricts anything.
    pub fn has_constraints(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty() || !self.submodules.is_empty()
    }
}

/// `true` if `path` equals `dir` or lies below it.
pub fn is_within(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        return true;
    }
    path == dir || (path.starts_with(dir) && path.as_bytes().get(dir.len()) == Some(&b'/'))
}

/// Check a glob pattern for obvious malformations.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if pattern.trim().is_empty() {
        return Err("pattern is empty".into());
    }
    if pattern.starts_with('/') {
        return Err("pattern must be relative to the repository root".into());
    }
    if pattern.split('/').any(|seg| seg == "..") {
        return Err("pattern must not contain '..'".into());
    }

    let mut brackets = 0i32;
    let mut braces = 0i32;
    for c in pattern.chars() {
        match c {
            '[' => brackets += 1,
            ']' => brackets -= 1,
            '{' => braces += 1,
            '}' => braces -= 1,
            _ => {}
        }
        if brackets < 0 || braces < 0 {
            return Err("unbalanced closing bracket".into());
        }
    }
    if brackets != 0 {
        return Err("unbalanced '['".into());
    }
    if braces != 0 {
        return Err("unbalanced '{'".into());
    }
    Ok(())
}

fn normalize(rel_path: &str) -> String {
    rel_path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Test whether `path` matches a glob `pattern`.
///
/// A pattern naming a directory (`docs` or `docs/`) also matches everything
/// below it.
fn matches_pattern(path: &str, pattern: &str) -> bool {
    let pat = pattern.replace('\\', "/");
    if glob_match::glob_match(&pat, path) {
        return true;
    }
    let dir = pat.trim_end_matches('/');
    !dir.contains(['*', '?', '[', '{']) && is_within(path, dir)
}
