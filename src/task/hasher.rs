//! Task hashing.
//!
//! Every task hash is accumulated from labeled sections in a fixed
//! order: filtered source-file inputs, prerequisite task hashes,
//! canonicalized options, declared environment values, declared runtime
//! command output, and the tool fingerprint. Nothing else contributes —
//! in particular no wall-clock, hostname, process id, or random state —
//! so the hash is reproducible across hosts and runs.

use std::collections::BTreeMap;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use serde::Serialize;
use tracing::debug;

use crate::config::{interpolate, InputSpec, WorkspaceConfig};
use crate::core::{Blake3Hasher, Hash32};
use crate::error::TsumugiError;
use crate::files::FileHasher;
use crate::graph::{ProjectGraph, ProjectNode};
use crate::task::{Task, TaskGraph};

/// Per-section hashes, kept on the task for diagnostics ("why did this
/// task miss the cache?").
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HashDetails {
    pub sections: BTreeMap<String, String>,
}

pub struct TaskHasher<'a> {
    workspace_root: &'a Utf8Path,
    graph: &'a ProjectGraph,
    config: &'a WorkspaceConfig,
    files: &'a FileHasher,
    /// Stable identifier of the orchestrator and the plugins that
    /// contributed to the graph.
    tool_fingerprint: String,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        workspace_root: &'a Utf8Path,
        graph: &'a ProjectGraph,
        config: &'a WorkspaceConfig,
        files: &'a FileHasher,
        plugin_names: &[&str],
    ) -> Self {
        let tool_fingerprint = format!(
            "tsumugi@{};plugins={}",
            env!("CARGO_PKG_VERSION"),
            plugin_names.join(",")
        );

        Self {
            workspace_root,
            graph,
            config,
            files,
            tool_fingerprint,
        }
    }

    /// Fill in the hash of every task. Tasks are visited in insertion
    /// order, which the planner guarantees is dependency order, so each
    /// prerequisite hash is available when needed.
    pub fn hash_graph(&self, tasks: &mut TaskGraph) -> Result<(), TsumugiError> {
        let ids: Vec<String> = tasks.tasks().iter().map(|t| t.id.clone()).collect();

        for id in ids {
            let prerequisite_hashes: Vec<(String, String)> = tasks
                .prerequisites(&id)
                .iter()
                .filter_map(|dep| {
                    tasks
                        .task(dep)
                        .and_then(|task| task.hash.clone())
                        .map(|hash| (dep.clone(), hash))
                })
                .collect();

            let task = tasks.task(&id).expect("id comes from the graph");
            let (hash, details) = self.hash_task(task, &prerequisite_hashes)?;

            let task = tasks.task_mut(&id).expect("id comes from the graph");
            task.hash = Some(hash.to_hex());
            task.hash_details = Some(details);
        }

        Ok(())
    }

    /// Hash one task given its prerequisites' hashes.
    pub fn hash_task(
        &self,
        task: &Task,
        prerequisite_hashes: &[(String, String)],
    ) -> Result<(Hash32, HashDetails), TsumugiError> {
        let mut details = HashDetails::default();

        let project = self.graph.project(&task.target.project);
        let files_hash = match project {
            Some(project) => self.hash_inputs(task, project)?,
            None => Hash32::default(),
        };
        details
            .sections
            .insert("files".to_string(), files_hash.to_hex());

        let mut deps = Blake3Hasher::default();
        let mut sorted: Vec<&(String, String)> = prerequisite_hashes.iter().collect();
        sorted.sort();
        for (id, hash) in sorted {
            deps.update(id).update(b"\0").update(hash).update(b"\n");
        }
        let deps_hash: Hash32 = deps.into();
        details
            .sections
            .insert("deps".to_string(), deps_hash.to_hex());

        // serde_json maps are ordered, so serialization is canonical
        // regardless of declaration order in configuration files.
        let options_hash = Hash32::hash(
            serde_json::to_string(&task.options).map_err(std::io::Error::other)?,
        );
        details
            .sections
            .insert("options".to_string(), options_hash.to_hex());

        let (env_hash, runtime_hash) = self.hash_declared_inputs(task, project)?;
        details.sections.insert("env".to_string(), env_hash.to_hex());
        details
            .sections
            .insert("runtime".to_string(), runtime_hash.to_hex());

        let tool_hash = Hash32::hash(&self.tool_fingerprint);
        details
            .sections
            .insert("tool".to_string(), tool_hash.to_hex());

        let mut total = Blake3Hasher::default();
        for (section, hash) in &details.sections {
            total.update(section).update(b":").update(hash).update(b"\n");
        }

        Ok((total.into(), details))
    }

    /// Source-file inputs: the target's `inputs` globs filtered against
    /// the project's files, plus `^`-prefixed named inputs applied to
    /// direct dependency projects.
    fn hash_inputs(&self, task: &Task, project: &ProjectNode) -> Result<Hash32, TsumugiError> {
        let specs = self.input_specs(task, project);

        let mut own_patterns = Vec::new();
        let mut dep_patterns = Vec::new();

        for spec in &specs {
            if let InputSpec::Source(source) = spec {
                match source.strip_prefix('^') {
                    Some(named) => self.expand_named(named, &mut dep_patterns),
                    None => own_patterns.push(source.clone()),
                }
            }
        }

        let mut selected = self.select_files(&own_patterns, project)?;

        for dependency in self.graph.direct_dependencies(&project.name) {
            if let Some(node) = self.graph.project(dependency) {
                selected.extend(self.select_files(&dep_patterns, node)?);
            }
        }

        selected.sort_unstable();
        selected.dedup();

        Ok(self
            .files
            .hash_files(selected.iter().map(Utf8PathBuf::as_path)))
    }

    /// The target's declared inputs with named references expanded; when
    /// nothing is declared the `default` named input applies.
    fn input_specs(&self, task: &Task, project: &ProjectNode) -> Vec<InputSpec> {
        let declared = project
            .targets
            .get(&task.target.target)
            .map(|target| target.inputs.clone())
            .unwrap_or_default();

        let mut worklist = if declared.is_empty() {
            vec![InputSpec::Source("default".to_string())]
        } else {
            declared
        };

        // Named inputs may reference other named inputs; expand until
        // only patterns and env/runtime specs remain. The seen-set guards
        // against reference cycles in configuration.
        let mut expanded = Vec::new();
        let mut seen = std::collections::HashSet::new();
        while let Some(spec) = worklist.pop() {
            match &spec {
                InputSpec::Source(source) if !is_pattern(source) && !source.starts_with('^') => {
                    if seen.insert(source.clone()) {
                        worklist.extend(self.config.named_input(source));
                    }
                }
                _ => expanded.push(spec),
            }
        }

        expanded
    }

    fn expand_named(&self, name: &str, patterns: &mut Vec<String>) {
        for spec in self.config.named_input(name) {
            if let InputSpec::Source(source) = spec
                && is_pattern(&source)
            {
                patterns.push(source);
            }
        }
    }

    /// Files of `project` selected by include/exclude glob patterns.
    fn select_files(
        &self,
        patterns: &[String],
        project: &ProjectNode,
    ) -> Result<Vec<Utf8PathBuf>, TsumugiError> {
        if patterns.is_empty() {
            return Ok(Vec::new());
        }

        let mut includes = Vec::new();
        let mut excludes = Vec::new();

        for pattern in patterns {
            let (negated, pattern) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern.as_str()),
            };

            let interpolated = interpolate(
                pattern,
                &project.name,
                &project.root,
                project.source_root.as_deref(),
                self.workspace_root,
            )
            .map_err(crate::error::PlannerError::from)?;

            match Pattern::new(&interpolated) {
                Ok(compiled) => {
                    if negated {
                        excludes.push(compiled);
                    } else {
                        includes.push(compiled);
                    }
                }
                Err(err) => debug!(pattern = %interpolated, "invalid input glob: {err}"),
            }
        }

        Ok(self
            .files
            .all_file_data()
            .filter(|record| record.path.starts_with(&project.root))
            .filter(|record| includes.iter().any(|p| p.matches(record.path.as_str())))
            .filter(|record| !excludes.iter().any(|p| p.matches(record.path.as_str())))
            .map(|record| record.path.clone())
            .collect())
    }

    /// Env and runtime declared inputs, each hashed into its own section.
    fn hash_declared_inputs(
        &self,
        task: &Task,
        project: Option<&ProjectNode>,
    ) -> Result<(Hash32, Hash32), TsumugiError> {
        let specs = project
            .map(|project| self.input_specs(task, project))
            .unwrap_or_default();

        let mut env = Blake3Hasher::default();
        let mut runtime = Blake3Hasher::default();

        let mut env_names: Vec<&str> = specs
            .iter()
            .filter_map(|spec| match spec {
                InputSpec::Env { env } => Some(env.as_str()),
                _ => None,
            })
            .collect();
        env_names.sort_unstable();
        env_names.dedup();

        for name in env_names {
            let value = std::env::var(name).unwrap_or_default();
            env.update(name).update(b"=").update(value).update(b"\n");
        }

        for spec in &specs {
            if let InputSpec::Runtime { runtime: command } = spec {
                let stdout = run_for_stdout(command, self.workspace_root);
                runtime
                    .update(command)
                    .update(b"\0")
                    .update(Hash32::hash(stdout).to_hex())
                    .update(b"\n");
            }
        }

        Ok((env.into(), runtime.into()))
    }
}

/// Whether an input string is a glob pattern rather than a named-input
/// reference.
fn is_pattern(source: &str) -> bool {
    source.contains('/') || source.contains('*') || source.starts_with('{') || source.starts_with('!')
}

/// Stdout of a declared runtime command. Failure hashes as empty so a
/// missing tool degrades to a cache miss, not an abort.
fn run_for_stdout(command: &str, cwd: &Utf8Path) -> Vec<u8> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output()
        .map(|output| output.stdout)
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TargetConfig;
    use crate::graph::ProjectType;
    use crate::task::{TargetTriple, TaskPlanner};
    use std::fs;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: Utf8PathBuf,
        graph: ProjectGraph,
        config: WorkspaceConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
            Self {
                _tmp: tmp,
                root,
                graph: ProjectGraph::default(),
                config: WorkspaceConfig::default(),
            }
        }

        fn file(&self, path: &str, content: &str) -> &Self {
            let full = self.root.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
            self
        }

        fn project(&mut self, name: &str, target_json: serde_json::Value) -> &mut Self {
            let target: TargetConfig = serde_json::from_value(target_json).unwrap();
            self.graph.nodes.insert(
                name.to_string(),
                ProjectNode {
                    name: name.to_string(),
                    root: Utf8PathBuf::from(format!("libs/{name}")),
                    project_type: ProjectType::Lib,
                    source_root: None,
                    targets: [("build".to_string(), target)].into_iter().collect(),
                    tags: Vec::new(),
                },
            );
            self
        }

        fn hash_of(&self, project: &str) -> String {
            let mut files = FileHasher::new(&self.root, self.root.join(".tsumugi"));
            files.init().unwrap();

            let planner = TaskPlanner::new(&self.graph, &self.root);
            let mut tasks = planner
                .plan(
                    &[TargetTriple::new(project, "build", None)],
                    &serde_json::Map::new(),
                )
                .unwrap();

            let hasher = TaskHasher::new(&self.root, &self.graph, &self.config, &files, &[]);
            hasher.hash_graph(&mut tasks).unwrap();

            tasks
                .task(&format!("{project}:build"))
                .unwrap()
                .hash
                .clone()
                .unwrap()
        }
    }

    fn simple_build() -> serde_json::Value {
        serde_json::json!({ "command": "echo build" })
    }

    #[test]
    fn hash_is_deterministic() {
        let mut fixture = Fixture::new();
        fixture.project("a", simple_build());
        fixture.file("libs/a/index.ts", "export const a = 1;");

        assert_eq!(fixture.hash_of("a"), fixture.hash_of("a"));
    }

    #[test]
    fn option_key_order_does_not_matter() {
        let mut one = Fixture::new();
        one.project(
            "a",
            serde_json::json!({ "command": "echo", "options": { "x": 1, "y": 2 } }),
        );
        one.file("libs/a/index.ts", "same");

        let mut two = Fixture::new();
        two.project(
            "a",
            serde_json::json!({ "command": "echo", "options": { "y": 2, "x": 1 } }),
        );
        two.file("libs/a/index.ts", "same");

        assert_eq!(one.hash_of("a"), two.hash_of("a"));
    }

    #[test]
    fn changed_input_file_changes_the_hash() {
        let mut fixture = Fixture::new();
        fixture.project("a", simple_build());
        fixture.file("libs/a/index.ts", "v1");
        let before = fixture.hash_of("a");

        fixture.file("libs/a/index.ts", "v2");
        assert_ne!(fixture.hash_of("a"), before);
    }

    #[test]
    fn files_outside_declared_inputs_do_not_contribute() {
        let mut fixture = Fixture::new();
        fixture.project(
            "a",
            serde_json::json!({
                "command": "echo",
                "inputs": ["{projectRoot}/src/**/*", "!{projectRoot}/src/**/*.spec.ts"],
            }),
        );
        fixture.file("libs/a/src/index.ts", "code");
        fixture.file("libs/a/README.md", "v1");
        let baseline = fixture.hash_of("a");

        // Outside the include set.
        fixture.file("libs/a/README.md", "v2");
        assert_eq!(fixture.hash_of("a"), baseline);

        // Excluded by the negated pattern.
        fixture.file("libs/a/src/index.spec.ts", "test");
        assert_eq!(fixture.hash_of("a"), baseline);

        // Inside the include set.
        fixture.file("libs/a/src/index.ts", "changed");
        assert_ne!(fixture.hash_of("a"), baseline);
    }

    #[test]
    fn different_options_produce_different_hashes() {
        let mut one = Fixture::new();
        one.project(
            "a",
            serde_json::json!({ "command": "echo", "options": { "mode": "dev" } }),
        );
        one.file("libs/a/index.ts", "same");

        let mut two = Fixture::new();
        two.project(
            "a",
            serde_json::json!({ "command": "echo", "options": { "mode": "prod" } }),
        );
        two.file("libs/a/index.ts", "same");

        assert_ne!(one.hash_of("a"), two.hash_of("a"));
    }

    #[test]
    fn prerequisite_hash_feeds_dependent_hash() {
        let make = |content: &str| {
            let mut fixture = Fixture::new();
            fixture
                .project("a", simple_build())
                .project("b", serde_json::json!({ "command": "echo", "dependsOn": ["^build"] }));
            fixture.graph.add_edge(crate::graph::Edge {
                source: "b".into(),
                target: "a".into(),
                kind: crate::graph::EdgeKind::Static,
                source_file: None,
            });
            fixture.file("libs/a/index.ts", content);
            fixture.file("libs/b/index.ts", "unchanged");
            fixture.hash_of("b")
        };

        // b's own files are identical; only a's content differs.
        assert_ne!(make("upstream v1"), make("upstream v2"));
    }

    #[test]
    #[allow(unsafe_code)]
    fn declared_env_input_contributes() {
        let mut fixture = Fixture::new();
        fixture.project(
            "a",
            serde_json::json!({
                "command": "echo",
                "inputs": ["default", { "env": "TSUMUGI_TEST_ENV_INPUT" }],
            }),
        );
        fixture.file("libs/a/index.ts", "same");

        unsafe { std::env::set_var("TSUMUGI_TEST_ENV_INPUT", "one") };
        let one = fixture.hash_of("a");
        unsafe { std::env::set_var("TSUMUGI_TEST_ENV_INPUT", "two") };
        let two = fixture.hash_of("a");
        unsafe { std::env::remove_var("TSUMUGI_TEST_ENV_INPUT") };

        assert_ne!(one, two);
    }
}
