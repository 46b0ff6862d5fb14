//! Plugins contributing to the project graph.
//!
//! A plugin is a value implementing [`Plugin`]: it may claim files by
//! glob and propose project deltas for them (`create_nodes`), and it may
//! propose extra edges once the graph is otherwise assembled
//! (`create_dependencies`). Plugins are pure with respect to the graph;
//! deltas are handed to the registry by value, so a plugin has no way to
//! mutate what it already returned.
//!
//! Results of `create_nodes` are memoized on disk, keyed by the plugin's
//! input fingerprint (name, options, matched file hashes, lockfile hash).
//! A plugin whose inputs did not change is not re-invoked.

pub mod package_json;
pub mod tsconfig;

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::{TargetConfig, WorkspaceConfig};
use crate::core::{Blake3Hasher, Hash32};
use crate::error::{ConfigError, TsumugiError};
use crate::files::FileHasher;
use crate::graph::{Edge, ProjectGraph, ProjectType};

/// A project contribution proposed by a plugin, keyed by project root.
/// Deltas for the same root merge; descriptor-declared configuration wins
/// over plugin-proposed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDelta {
    pub root: Utf8PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_type: Option<ProjectType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub targets: BTreeMap<String, TargetConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub struct CreateNodesContext<'a> {
    pub workspace_root: &'a Utf8Path,
    pub config: &'a WorkspaceConfig,
    pub options: &'a Value,
    /// Input fingerprint; also the memoization key.
    pub fingerprint: Hash32,
}

pub struct CreateDependenciesContext<'a> {
    pub workspace_root: &'a Utf8Path,
    pub config: &'a WorkspaceConfig,
    pub options: &'a Value,
    /// The graph assembled so far (projects, externals, explicit edges).
    pub graph: &'a ProjectGraph,
}

/// Capability surface of a graph plugin. Both entry points are optional.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Glob for the files this plugin wants to see in `create_nodes`.
    fn create_nodes_glob(&self) -> Option<&'static str> {
        None
    }

    fn create_nodes(
        &self,
        _files: &[Utf8PathBuf],
        _ctx: &CreateNodesContext,
    ) -> anyhow::Result<Vec<ProjectDelta>> {
        Ok(Vec::new())
    }

    fn create_dependencies(
        &self,
        _ctx: &CreateDependenciesContext,
    ) -> anyhow::Result<Vec<Edge>> {
        Ok(Vec::new())
    }
}

struct RegisteredPlugin {
    plugin: Box<dyn Plugin>,
    options: Value,
    optional: bool,
}

pub struct PluginRegistry {
    plugins: Vec<RegisteredPlugin>,
    memo_dir: Utf8PathBuf,
}

impl PluginRegistry {
    /// Build the registry from the workspace configuration. When the
    /// configuration names no plugins, the package manifest plugin is
    /// registered so plain `package.json` workspaces work out of the box.
    pub fn from_config(
        config: &WorkspaceConfig,
        state_dir: &Utf8Path,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self {
            plugins: Vec::new(),
            memo_dir: state_dir.join("plugins"),
        };

        if config.plugins.is_empty() {
            registry.add(
                Box::new(package_json::PackageJsonPlugin),
                Value::Null,
                false,
            )?;
            return Ok(registry);
        }

        for registration in &config.plugins {
            let plugin: Box<dyn Plugin> = match registration.name() {
                package_json::NAME => Box::new(package_json::PackageJsonPlugin),
                tsconfig::NAME => Box::new(tsconfig::TsconfigPlugin),
                unknown => return Err(ConfigError::UnknownPlugin(unknown.to_string())),
            };

            registry.add(plugin, registration.options(), registration.optional())?;
        }

        Ok(registry)
    }

    /// Register a plugin value directly (for embedders and tests).
    pub fn add(
        &mut self,
        plugin: Box<dyn Plugin>,
        options: Value,
        optional: bool,
    ) -> Result<(), ConfigError> {
        if self.plugins.iter().any(|p| p.plugin.name() == plugin.name()) {
            return Err(ConfigError::DuplicatePlugin(plugin.name().to_string()));
        }

        self.plugins.push(RegisteredPlugin {
            plugin,
            options,
            optional,
        });
        Ok(())
    }

    /// Run every plugin's `create_nodes` over the files matching its
    /// glob. Memoized results are returned without invoking the plugin.
    pub fn create_nodes(
        &self,
        workspace_root: &Utf8Path,
        config: &WorkspaceConfig,
        files: &FileHasher,
        lockfile_hash: Hash32,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<ProjectDelta>, TsumugiError> {
        let mut deltas = Vec::new();

        for registered in &self.plugins {
            let Some(glob) = registered.plugin.create_nodes_glob() else {
                continue;
            };
            let Ok(pattern) = Pattern::new(glob) else {
                continue;
            };

            let matched: Vec<Utf8PathBuf> = files
                .all_file_data()
                .filter(|record| pattern.matches(record.path.as_str()))
                .map(|record| record.path.clone())
                .collect();

            if matched.is_empty() {
                continue;
            }

            let fingerprint = fingerprint(registered, &matched, files, lockfile_hash);

            if let Some(cached) = self.load_memo(registered.plugin.name(), fingerprint) {
                debug!(plugin = registered.plugin.name(), "plugin result memoized");
                deltas.extend(cached);
                continue;
            }

            let ctx = CreateNodesContext {
                workspace_root,
                config,
                options: &registered.options,
                fingerprint,
            };

            match registered.plugin.create_nodes(&matched, &ctx) {
                Ok(contributed) => {
                    self.store_memo(registered.plugin.name(), fingerprint, &contributed);
                    deltas.extend(contributed);
                }
                Err(source) if registered.optional => {
                    warnings.push(format!(
                        "Optional plugin '{}' failed: {source}",
                        registered.plugin.name()
                    ));
                }
                Err(source) => {
                    return Err(TsumugiError::Plugin {
                        plugin: registered.plugin.name().to_string(),
                        source,
                    });
                }
            }
        }

        Ok(deltas)
    }

    /// Run every plugin's `create_dependencies` against the assembled
    /// graph.
    pub fn create_dependencies(
        &self,
        workspace_root: &Utf8Path,
        config: &WorkspaceConfig,
        graph: &ProjectGraph,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<Edge>, TsumugiError> {
        let mut edges = Vec::new();

        for registered in &self.plugins {
            let ctx = CreateDependenciesContext {
                workspace_root,
                config,
                options: &registered.options,
                graph,
            };

            match registered.plugin.create_dependencies(&ctx) {
                Ok(contributed) => edges.extend(contributed),
                Err(source) if registered.optional => {
                    warnings.push(format!(
                        "Optional plugin '{}' failed: {source}",
                        registered.plugin.name()
                    ));
                }
                Err(source) => {
                    return Err(TsumugiError::Plugin {
                        plugin: registered.plugin.name().to_string(),
                        source,
                    });
                }
            }
        }

        Ok(edges)
    }

    /// Plugin names in registration order; part of the graph input hash.
    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.plugin.name()).collect()
    }

    fn memo_path(&self, plugin: &str, fingerprint: Hash32) -> Utf8PathBuf {
        let safe: String = plugin
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.memo_dir.join(format!("{safe}-{}.json", fingerprint.to_hex()))
    }

    fn load_memo(&self, plugin: &str, fingerprint: Hash32) -> Option<Vec<ProjectDelta>> {
        let data = fs::read_to_string(self.memo_path(plugin, fingerprint)).ok()?;
        serde_json::from_str(&data).ok()
    }

    fn store_memo(&self, plugin: &str, fingerprint: Hash32, deltas: &[ProjectDelta]) {
        let Ok(data) = serde_json::to_vec(deltas) else {
            return;
        };
        if fs::create_dir_all(&self.memo_dir).is_ok()
            && let Err(err) = fs::write(self.memo_path(plugin, fingerprint), data)
        {
            debug!(plugin, "couldn't persist plugin memo: {err}");
        }
    }
}

/// Fingerprint of everything that feeds a plugin invocation.
fn fingerprint(
    registered: &RegisteredPlugin,
    matched: &[Utf8PathBuf],
    files: &FileHasher,
    lockfile_hash: Hash32,
) -> Hash32 {
    let mut hasher = Blake3Hasher::default();
    hasher.update(registered.plugin.name());
    hasher.update(b"\0");
    hasher.update(registered.options.to_string());
    hasher.update(b"\0");
    hasher.update(lockfile_hash.to_hex());
    hasher.update(b"\0");

    for path in matched {
        hasher.update(path.as_str());
        hasher.update(b"\0");
        if let Some(record) = files.file(path) {
            hasher.update(record.hash.to_hex());
        }
        hasher.update(b"\n");
    }

    hasher.into()
}
