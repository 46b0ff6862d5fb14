#![deny(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;

pub mod cache;
pub mod config;
pub mod files;
pub mod graph;
pub mod plugin;
pub mod resolve;
pub mod runner;
pub mod scan;
pub mod sync;
pub mod task;
pub mod tree;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tracing::debug;

pub use crate::core::{ArcStr, Hash32};
pub use crate::error::{CacheError, ConfigError, GraphError, PlannerError, ScanError, TsumugiError};
pub use crate::runner::{
    CancellationToken, LifecycleBus, LifecycleEvent, RunSummary, RunnerOptions, TaskResult,
    TaskRunner, TaskStatus,
};

use crate::cache::TaskCache;
use crate::config::WorkspaceConfig;
use crate::core::Blake3Hasher;
use crate::files::FileHasher;
use crate::graph::cache::ProjectGraphCache;
use crate::graph::{ProjectGraph, ProjectGraphBuilder, Warning};
use crate::plugin::PluginRegistry;
use crate::task::{TargetTriple, TaskGraph, TaskHasher, TaskPlanner};
use crate::tree::VirtualTree;

/// Directory under the workspace root holding all orchestrator state:
/// the file-hash index, the persisted project graph, plugin memos, and
/// (by default) the task cache.
pub const STATE_DIR: &str = ".tsumugi";

/// The composition root: one value owning every component, constructed
/// once per invocation.
pub struct Workspace {
    root: Utf8PathBuf,
    config: WorkspaceConfig,
    files: FileHasher,
    registry: PluginRegistry,
    graph_cache: ProjectGraphCache,
    cache: TaskCache,
    bus: LifecycleBus,
    warnings: Vec<Warning>,
}

impl Workspace {
    /// Open a workspace: load configuration, register plugins, and bring
    /// the file-hash index up to date.
    pub fn open(root: impl AsRef<Utf8Path>) -> Result<Self, TsumugiError> {
        let root = root.as_ref().to_owned();
        let state_dir = root.join(STATE_DIR);

        let config = WorkspaceConfig::load(&root)?;
        let registry = PluginRegistry::from_config(&config, &state_dir)?;

        let mut files = FileHasher::new(&root, &state_dir);
        files.init()?;

        let cache_dir = config
            .cache_directory
            .clone()
            .map(|dir| root.join(dir))
            .unwrap_or_else(|| state_dir.join("cache"));

        let warnings = files
            .warnings()
            .iter()
            .map(|message| Warning {
                file: None,
                message: message.clone(),
            })
            .collect();

        Ok(Self {
            graph_cache: ProjectGraphCache::new(&state_dir),
            cache: TaskCache::new(cache_dir),
            bus: LifecycleBus::new(),
            root,
            config,
            files,
            registry,
            warnings,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Lifecycle bus; subscribe before [`Workspace::run`] to observe
    /// events.
    pub fn bus(&self) -> &LifecycleBus {
        &self.bus
    }

    /// Non-fatal problems accumulated so far (unreadable files,
    /// unscannable sources, malformed descriptors).
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// The project graph: loaded from the persisted cache when its input
    /// hash matches, rebuilt (and persisted) otherwise.
    pub fn project_graph(&mut self) -> Result<ProjectGraph, TsumugiError> {
        let input_hash = self.graph_input_hash();

        if let Some(graph) = self.graph_cache.load(input_hash) {
            debug!("project graph loaded from cache");
            return Ok(graph);
        }

        let builder =
            ProjectGraphBuilder::new(&self.root, &self.config, &self.files, &self.registry);
        let (graph, warnings) = builder.build()?;
        self.warnings.extend(warnings);

        if let Err(err) = self.graph_cache.store(input_hash, &graph) {
            debug!("couldn't persist project graph: {err}");
        }

        Ok(graph)
    }

    /// Expand initiating `(project, target, configuration?)` triples
    /// into a hashed task graph, ready for the runner.
    pub fn plan(
        &self,
        graph: &ProjectGraph,
        initiating: &[(&str, &str, Option<&str>)],
    ) -> Result<TaskGraph, TsumugiError> {
        self.plan_with_overrides(graph, initiating, &serde_json::Map::new())
    }

    pub fn plan_with_overrides(
        &self,
        graph: &ProjectGraph,
        initiating: &[(&str, &str, Option<&str>)],
        overrides: &serde_json::Map<String, Value>,
    ) -> Result<TaskGraph, TsumugiError> {
        let triples: Vec<TargetTriple> = initiating
            .iter()
            .map(|(project, target, configuration)| {
                TargetTriple::new(*project, *target, configuration.map(String::from))
            })
            .collect();

        let planner = TaskPlanner::new(graph, &self.root);
        let mut tasks = planner.plan(&triples, overrides)?;

        let hasher = TaskHasher::new(
            &self.root,
            graph,
            &self.config,
            &self.files,
            &self.registry.names(),
        );
        hasher.hash_graph(&mut tasks)?;

        Ok(tasks)
    }

    /// Execute a planned task graph.
    pub fn run(&self, tasks: &TaskGraph, options: RunnerOptions) -> RunSummary {
        TaskRunner::new(&self.root, &self.cache, &self.bus).run(tasks, &options)
    }

    /// Sync root tsconfig project references, committing through the
    /// virtual tree and invalidating the persisted graph on change.
    pub fn sync_project_references(
        &mut self,
        graph: &ProjectGraph,
    ) -> Result<bool, TsumugiError> {
        let mut tree = VirtualTree::new(&self.root);
        let changed = sync::sync_project_references(&mut tree, graph)?;

        if changed {
            tree.commit(Some(&self.graph_cache))?;
        }

        Ok(changed)
    }

    /// Aggregate hash of everything feeding graph construction: the
    /// workspace manifest, the plugin list, the lockfile, and every
    /// tracked file's content.
    fn graph_input_hash(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();

        for manifest in [config::WORKSPACE_CONFIG, "package.json", "package-lock.json"] {
            if let Some(record) = self.files.file(Utf8Path::new(manifest)) {
                hasher.update(manifest).update(record.hash.to_hex());
            }
        }

        hasher.update(self.registry.names().join(","));
        hasher.update(self.files.aggregate().to_hex());

        hasher.into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn scaffold() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();

        fs::create_dir_all(root.join("packages/a")).unwrap();
        fs::create_dir_all(root.join("packages/b")).unwrap();
        fs::write(
            root.join("packages/a/project.json"),
            r#"{ "name": "a", "targets": { "build": { "command": "echo a", "cache": true } } }"#,
        )
        .unwrap();
        fs::write(
            root.join("packages/b/project.json"),
            r#"{
                "name": "b",
                "implicitDependencies": ["a"],
                "targets": { "build": { "command": "echo b", "dependsOn": ["^build"] } }
            }"#,
        )
        .unwrap();

        (tmp, root)
    }

    #[test]
    fn open_builds_a_working_pipeline() {
        let (_tmp, root) = scaffold();
        let mut workspace = Workspace::open(&root).unwrap();

        let graph = workspace.project_graph().unwrap();
        assert!(graph.nodes.contains_key("a"));
        assert!(graph.nodes.contains_key("b"));

        let tasks = workspace.plan(&graph, &[("b", "build", None)]).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.tasks().iter().all(|t| t.hash.is_some()));

        let summary = workspace.run(&tasks, RunnerOptions::default());
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn project_graph_is_cached_across_opens() {
        let (_tmp, root) = scaffold();

        let mut first = Workspace::open(&root).unwrap();
        first.project_graph().unwrap();
        assert!(root.join(".tsumugi/graph.json").exists());

        // Unchanged workspace: the second open loads the cached graph.
        let mut second = Workspace::open(&root).unwrap();
        let graph = second.project_graph().unwrap();
        assert!(graph.nodes.contains_key("a"));

        // A source change invalidates it.
        fs::write(root.join("packages/a/index.ts"), "export {};").unwrap();
        let mut third = Workspace::open(&root).unwrap();
        let rebuilt = third.project_graph().unwrap();
        assert!(rebuilt.nodes.contains_key("a"));
    }

    #[test]
    fn reference_sync_covers_workspace_projects() {
        let (_tmp, root) = scaffold();
        fs::write(
            root.join("tsconfig.json"),
            r#"{ "references": [{ "path": "packages/c" }] }"#,
        )
        .unwrap();

        let mut workspace = Workspace::open(&root).unwrap();
        let graph = workspace.project_graph().unwrap();
        assert!(workspace.sync_project_references(&graph).unwrap());

        let text = fs::read_to_string(root.join("tsconfig.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let paths: Vec<&str> = value["references"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["path"].as_str().unwrap())
            .collect();

        // The dangling reference stays; both projects are appended.
        assert_eq!(paths, vec!["packages/c", "packages/a", "packages/b"]);

        // Committing invalidated the persisted graph.
        assert!(!root.join(".tsumugi/graph.json").exists());
    }
}
