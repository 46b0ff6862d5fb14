//! Resolution of module specifiers to projects.
//!
//! Given a specifier and the file it appeared in, the locator decides
//! which workspace project (or installed package) it points at. The
//! lookup order mirrors how the TypeScript compiler would resolve the
//! same specifier: compiler path mappings first, then installed packages,
//! then plain relative resolution.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::strip_json_comments;

/// Outcome of resolving one specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A first-party project, by name.
    Project(String),
    /// An installed package, as the external node id (`npm:<name>`).
    External(String),
    /// Nothing matched; the caller may drop the edge.
    Unresolved,
}

/// One compiler path mapping, e.g. `@proj/lib` or `@proj/*`.
#[derive(Debug, Clone)]
struct PathMapping {
    /// Pattern with at most one `*` wildcard.
    pattern: String,
    /// Replacement file paths, workspace-relative.
    targets: Vec<Utf8PathBuf>,
}

pub struct TargetProjectLocator {
    /// Project roots sorted longest-first so the longest prefix wins ties.
    roots: Vec<(Utf8PathBuf, String)>,
    mappings: Vec<PathMapping>,
    /// Package name -> external node id.
    packages: BTreeMap<String, String>,
}

impl TargetProjectLocator {
    pub fn new(
        workspace_root: &Utf8Path,
        projects: impl IntoIterator<Item = (String, Utf8PathBuf)>,
        packages: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut roots: Vec<(Utf8PathBuf, String)> = projects
            .into_iter()
            .map(|(name, root)| (root, name))
            .collect();
        roots.sort_by(|a, b| b.0.as_str().len().cmp(&a.0.as_str().len()));

        let packages = packages
            .into_iter()
            .map(|name| (name.clone(), format!("npm:{name}")))
            .collect();

        Self {
            roots,
            mappings: load_path_mappings(workspace_root),
            packages,
        }
    }

    /// Resolve `specifier` as seen from `source_file` (workspace-relative).
    pub fn resolve(&self, specifier: &str, source_file: &Utf8Path) -> Resolution {
        // 1. Compiler path mappings.
        for mapping in &self.mappings {
            if let Some(target) = mapping.apply(specifier) {
                if let Some(project) = self.project_for_path(&target) {
                    return Resolution::Project(project.to_string());
                }
            }
        }

        // 2. Installed packages.
        if !specifier.starts_with('.') {
            if let Some(external) = self.lookup_package(specifier) {
                return Resolution::External(external.to_string());
            }
            return Resolution::Unresolved;
        }

        // 3. Relative specifier.
        let base = source_file.parent().unwrap_or(Utf8Path::new(""));
        let joined = normalize(&base.join(specifier));
        match self.project_for_path(&joined) {
            Some(project) => Resolution::Project(project.to_string()),
            None => Resolution::Unresolved,
        }
    }

    /// The project whose root is the longest ancestor of `path`.
    pub fn project_for_path(&self, path: &Utf8Path) -> Option<&str> {
        self.roots
            .iter()
            .find(|(root, _)| path.starts_with(root) || path == root)
            .map(|(_, name)| name.as_str())
    }

    /// Match `pkg` and `pkg/subpath`, handling `@scope/pkg` names.
    fn lookup_package(&self, specifier: &str) -> Option<&str> {
        if let Some(external) = self.packages.get(specifier) {
            return Some(external);
        }

        let segments: Vec<&str> = specifier.split('/').collect();
        let head = if specifier.starts_with('@') && segments.len() >= 2 {
            segments[..2].join("/")
        } else {
            segments[0].to_string()
        };

        self.packages.get(head.as_str()).map(String::as_str)
    }
}

impl PathMapping {
    fn apply(&self, specifier: &str) -> Option<Utf8PathBuf> {
        match self.pattern.split_once('*') {
            None => {
                if specifier == self.pattern {
                    self.targets.first().cloned()
                } else {
                    None
                }
            }
            Some((prefix, suffix)) => {
                let middle = specifier
                    .strip_prefix(prefix)?
                    .strip_suffix(suffix)?;

                let target = self.targets.first()?;
                Some(Utf8PathBuf::from(
                    target.as_str().replacen('*', middle, 1),
                ))
            }
        }
    }
}

/// Read `compilerOptions.paths` from the workspace base tsconfig.
fn load_path_mappings(workspace_root: &Utf8Path) -> Vec<PathMapping> {
    for file in ["tsconfig.base.json", "tsconfig.json"] {
        let Ok(text) = fs::read_to_string(workspace_root.join(file)) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&strip_json_comments(&text))
        else {
            continue;
        };

        let Some(paths) = value
            .get("compilerOptions")
            .and_then(|opts| opts.get("paths"))
            .and_then(|paths| paths.as_object())
        else {
            continue;
        };

        return paths
            .iter()
            .map(|(pattern, targets)| PathMapping {
                pattern: pattern.clone(),
                targets: targets
                    .as_array()
                    .map(|array| {
                        array
                            .iter()
                            .filter_map(|t| t.as_str())
                            .map(Utf8PathBuf::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();
    }

    Vec::new()
}

/// Collapse `.` and `..` segments without touching the filesystem.
fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out: Vec<&str> = Vec::new();

    for segment in path.as_str().split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            segment => out.push(segment),
        }
    }

    Utf8PathBuf::from(out.join("/"))
}
