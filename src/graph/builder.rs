//! Project graph construction.
//!
//! Building proceeds in phases: discover projects (descriptors + plugin
//! deltas), ingest the lockfile into external nodes, scan every
//! first-party source file for imports and resolve them into explicit
//! edges, add implicit edges from configuration, let plugins contribute
//! extra edges, and finally validate acyclicity. A cycle aborts the
//! build; no partial graph is ever returned.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::Deserialize;
use tracing::debug;

use crate::config::{strip_json_comments, TargetConfig, WorkspaceConfig};
use crate::core::Hash32;
use crate::error::TsumugiError;
use crate::files::FileHasher;
use crate::graph::{Edge, EdgeKind, ExternalNode, ProjectGraph, ProjectNode, ProjectType};
use crate::plugin::PluginRegistry;
use crate::resolve::{Resolution, TargetProjectLocator};
use crate::scan::{self, ImportKind};

/// Source extensions scanned for explicit edges.
const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx"];

/// A non-fatal problem encountered while building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub file: Option<Utf8PathBuf>,
    pub message: String,
}

/// Shape of a `project.json` descriptor.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProjectDescriptor {
    name: Option<String>,
    project_type: Option<ProjectType>,
    source_root: Option<Utf8PathBuf>,
    targets: BTreeMap<String, TargetConfig>,
    tags: Vec<String>,
    implicit_dependencies: Vec<String>,
}

pub struct ProjectGraphBuilder<'a> {
    workspace_root: &'a Utf8Path,
    config: &'a WorkspaceConfig,
    files: &'a FileHasher,
    registry: &'a PluginRegistry,
}

impl<'a> ProjectGraphBuilder<'a> {
    pub fn new(
        workspace_root: &'a Utf8Path,
        config: &'a WorkspaceConfig,
        files: &'a FileHasher,
        registry: &'a PluginRegistry,
    ) -> Self {
        Self {
            workspace_root,
            config,
            files,
            registry,
        }
    }

    pub fn build(&self) -> Result<(ProjectGraph, Vec<Warning>), TsumugiError> {
        let mut warnings = Vec::new();
        let mut graph = ProjectGraph::default();

        // External nodes first: the lockfile hash also feeds plugin
        // memoization.
        let lockfile_hash = self.ingest_lockfile(&mut graph);

        let descriptors = self.load_descriptors(&mut warnings)?;
        let mut plugin_warnings = Vec::new();
        let deltas = self.registry.create_nodes(
            self.workspace_root,
            self.config,
            self.files,
            lockfile_hash,
            &mut plugin_warnings,
        )?;
        warnings.extend(plugin_warnings.into_iter().map(|message| Warning {
            file: None,
            message,
        }));

        // Plugin deltas lay the base; descriptors overlay and win.
        let mut implicit_declared: Vec<(String, String)> = Vec::new();
        let mut nodes: BTreeMap<Utf8PathBuf, ProjectNode> = BTreeMap::new();

        for delta in deltas {
            let node = nodes.entry(delta.root.clone()).or_insert_with(|| ProjectNode {
                name: delta
                    .name
                    .clone()
                    .unwrap_or_else(|| default_name(&delta.root)),
                root: delta.root.clone(),
                project_type: delta.project_type.unwrap_or(ProjectType::Lib),
                source_root: None,
                targets: BTreeMap::new(),
                tags: Vec::new(),
            });

            if let Some(name) = delta.name {
                node.name = name;
            }
            if let Some(project_type) = delta.project_type {
                node.project_type = project_type;
            }
            for (target, config) in delta.targets {
                node.targets.entry(target).or_insert(config);
            }
            node.tags.extend(delta.tags);
        }

        for (root, descriptor) in descriptors {
            let node = nodes.entry(root.clone()).or_insert_with(|| ProjectNode {
                name: String::new(),
                root: root.clone(),
                project_type: ProjectType::Lib,
                source_root: None,
                targets: BTreeMap::new(),
                tags: Vec::new(),
            });

            node.name = descriptor.name.unwrap_or_else(|| default_name(&root));
            if let Some(project_type) = descriptor.project_type {
                node.project_type = project_type;
            }
            if descriptor.source_root.is_some() {
                node.source_root = descriptor.source_root;
            }
            // Descriptor targets replace plugin-proposed ones wholesale.
            for (target, config) in descriptor.targets {
                node.targets.insert(target, config);
            }
            node.tags.extend(descriptor.tags);

            for dep in descriptor.implicit_dependencies {
                implicit_declared.push((node.name.clone(), dep));
            }
        }

        // Legacy runner configuration can mark whole target names
        // cacheable.
        let cacheable_operations = self
            .config
            .runner(None)
            .map(|runner| runner.options.cacheable_operations)
            .unwrap_or_default();

        for mut node in nodes.into_values() {
            for (name, target) in &mut node.targets {
                if let Some(defaults) = self.config.target_defaults.get(name) {
                    target.merge_defaults(defaults);
                }
                if cacheable_operations.contains(name) {
                    target.cache = true;
                }
            }
            graph.nodes.insert(node.name.clone(), node);
        }

        self.add_explicit_edges(&mut graph, &mut warnings);
        self.add_implicit_edges(&mut graph, implicit_declared, &mut warnings);

        let mut plugin_warnings = Vec::new();
        let contributed = self.registry.create_dependencies(
            self.workspace_root,
            self.config,
            &graph,
            &mut plugin_warnings,
        )?;
        warnings.extend(plugin_warnings.into_iter().map(|message| Warning {
            file: None,
            message,
        }));
        for edge in contributed {
            graph.add_edge(edge);
        }

        graph.validate()?;
        Ok((graph, warnings))
    }

    /// Find and parse every `project.json` among the tracked files.
    fn load_descriptors(
        &self,
        warnings: &mut Vec<Warning>,
    ) -> Result<Vec<(Utf8PathBuf, ProjectDescriptor)>, TsumugiError> {
        let mut descriptors = Vec::new();

        for record in self.files.all_file_data() {
            if record.path.file_name() != Some(crate::config::PROJECT_CONFIG) {
                continue;
            }
            let Some(root) = record.path.parent() else {
                continue;
            };

            let text = fs::read_to_string(self.workspace_root.join(&record.path))?;
            match serde_json::from_str::<ProjectDescriptor>(&strip_json_comments(&text)) {
                Ok(descriptor) => descriptors.push((root.to_owned(), descriptor)),
                Err(err) => warnings.push(Warning {
                    file: Some(record.path.clone()),
                    message: format!("Skipping malformed project descriptor: {err}"),
                }),
            }
        }

        Ok(descriptors)
    }

    /// External nodes from the package lockfile, falling back to the
    /// root manifest's dependency tables. Returns the lockfile hash.
    fn ingest_lockfile(&self, graph: &mut ProjectGraph) -> Hash32 {
        let lock_path = Utf8Path::new("package-lock.json");

        if let Some(record) = self.files.file(lock_path)
            && let Ok(text) = fs::read_to_string(self.workspace_root.join(lock_path))
            && let Ok(lock) = serde_json::from_str::<serde_json::Value>(&text)
        {
            if let Some(packages) = lock.get("packages").and_then(|p| p.as_object()) {
                for (path, entry) in packages {
                    let Some(name) = path.strip_prefix("node_modules/") else {
                        continue;
                    };
                    // Nested installs resolve to their innermost name.
                    let name = name
                        .rsplit_once("node_modules/")
                        .map_or(name, |(_, tail)| tail);

                    graph.external_nodes.insert(
                        format!("npm:{name}"),
                        ExternalNode {
                            package_name: name.to_string(),
                            version: entry
                                .get("version")
                                .and_then(|v| v.as_str())
                                .unwrap_or("0.0.0")
                                .to_string(),
                            hash: entry
                                .get("integrity")
                                .and_then(|v| v.as_str())
                                .map(String::from),
                        },
                    );
                }
            }

            return record.hash;
        }

        // No lockfile: the root manifest's declared ranges stand in.
        let manifest_path = Utf8Path::new("package.json");
        if let Ok(text) = fs::read_to_string(self.workspace_root.join(manifest_path))
            && let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&text)
        {
            for table in ["dependencies", "devDependencies"] {
                let Some(deps) = manifest.get(table).and_then(|d| d.as_object()) else {
                    continue;
                };
                for (name, version) in deps {
                    graph.external_nodes.insert(
                        format!("npm:{name}"),
                        ExternalNode {
                            package_name: name.clone(),
                            version: version.as_str().unwrap_or("*").to_string(),
                            hash: None,
                        },
                    );
                }
            }
        }

        self.files
            .file(manifest_path)
            .map(|record| record.hash)
            .unwrap_or_default()
    }

    /// Scan every first-party source file and resolve its imports.
    fn add_explicit_edges(&self, graph: &mut ProjectGraph, warnings: &mut Vec<Warning>) {
        let locator = TargetProjectLocator::new(
            self.workspace_root,
            graph
                .nodes
                .values()
                .map(|node| (node.name.clone(), node.root.clone())),
            graph
                .external_nodes
                .values()
                .map(|node| node.package_name.clone()),
        );

        let sources: Vec<(&Utf8PathBuf, &str)> = self
            .files
            .all_file_data()
            .filter(|record| {
                record
                    .path
                    .extension()
                    .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
            })
            .filter_map(|record| {
                graph
                    .project_for_path(&record.path)
                    .map(|project| (&record.path, project.name.as_str()))
            })
            .collect();

        // Scanning and resolution are parallel; graph mutation is serial.
        let resolved: Vec<(Vec<Edge>, Option<Warning>)> = sources
            .par_iter()
            .map(|(path, project)| {
                let absolute = self.workspace_root.join(path);
                let text = match fs::read_to_string(&absolute) {
                    Ok(text) => text,
                    Err(err) => {
                        let warning = Warning {
                            file: Some((*path).clone()),
                            message: format!("Couldn't read source file: {err}"),
                        };
                        return (Vec::new(), Some(warning));
                    }
                };

                let result = match scan::scan(&text) {
                    Ok(result) => result,
                    Err(err) => {
                        let warning = Warning {
                            file: Some((*path).clone()),
                            message: format!("Skipping file: {err}"),
                        };
                        return (Vec::new(), Some(warning));
                    }
                };

                let mut edges = Vec::new();
                for import in &result.imports {
                    let kind = match import.kind {
                        ImportKind::Dynamic | ImportKind::LoadChildren => EdgeKind::Dynamic,
                        _ => EdgeKind::Static,
                    };

                    match locator.resolve(&import.specifier, path) {
                        Resolution::Project(target) if target != **project => {
                            edges.push(Edge {
                                source: (*project).to_string(),
                                target,
                                kind,
                                source_file: Some((*path).clone()),
                            });
                        }
                        Resolution::External(target) => {
                            edges.push(Edge {
                                source: (*project).to_string(),
                                target,
                                kind,
                                source_file: Some((*path).clone()),
                            });
                        }
                        // Self-imports and unresolved specifiers are
                        // dropped.
                        Resolution::Project(_) | Resolution::Unresolved => {}
                    }
                }

                (edges, None)
            })
            .collect();

        for (edges, warning) in resolved {
            if let Some(warning) = warning {
                debug!(file = ?warning.file, "{}", warning.message);
                warnings.push(warning);
            }
            for edge in edges {
                graph.add_edge(edge);
            }
        }
    }

    /// Implicit edges: descriptor-declared project links plus the
    /// workspace-level file pattern map.
    fn add_implicit_edges(
        &self,
        graph: &mut ProjectGraph,
        declared: Vec<(String, String)>,
        warnings: &mut Vec<Warning>,
    ) {
        for (source, target) in declared {
            if graph.nodes.contains_key(&target) {
                graph.add_edge(Edge {
                    source,
                    target,
                    kind: EdgeKind::Implicit,
                    source_file: None,
                });
            } else {
                warnings.push(Warning {
                    file: None,
                    message: format!(
                        "Project '{source}' declares an implicit dependency on unknown project '{target}'"
                    ),
                });
            }
        }

        for (pattern, dependents) in &self.config.implicit_dependencies {
            let Ok(pattern) = Pattern::new(pattern) else {
                continue;
            };

            let owners: Vec<String> = self
                .files
                .all_file_data()
                .filter(|record| pattern.matches(record.path.as_str()))
                .filter_map(|record| graph.project_for_path(&record.path))
                .map(|project| project.name.clone())
                .collect();

            let targets: Vec<String> = match dependents {
                crate::config::ImplicitDependents::All(_) => {
                    graph.nodes.keys().cloned().collect()
                }
                crate::config::ImplicitDependents::Projects(list) => list.clone(),
            };

            for owner in owners {
                for target in &targets {
                    if *target != owner && graph.nodes.contains_key(target) {
                        graph.add_edge(Edge {
                            source: owner.clone(),
                            target: target.clone(),
                            kind: EdgeKind::Implicit,
                            source_file: None,
                        });
                    }
                }
            }
        }
    }
}

fn default_name(root: &Utf8Path) -> String {
    root.file_name().unwrap_or("root").to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    /// Scaffold a workspace on disk and build its graph.
    struct Fixture {
        _tmp: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
            Self { _tmp: tmp, root }
        }

        fn file(&self, path: &str, content: &str) -> &Self {
            let full = self.root.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
            self
        }

        fn project(&self, root: &str, name: &str) -> &Self {
            self.file(
                &format!("{root}/project.json"),
                &format!(r#"{{ "name": "{name}" }}"#),
            )
        }

        fn build(&self) -> Result<(ProjectGraph, Vec<Warning>), TsumugiError> {
            let config = WorkspaceConfig::load(&self.root).unwrap();
            let state = self.root.join(".tsumugi");
            let mut files = FileHasher::new(&self.root, &state);
            files.init().unwrap();
            let registry = PluginRegistry::from_config(&config, &state).unwrap();

            ProjectGraphBuilder::new(&self.root, &config, &files, &registry).build()
        }
    }

    fn proj_mappings() -> &'static str {
        r#"{
            "compilerOptions": {
                "paths": {
                    "@proj/my-second-proj": ["libs/proj2/index.ts"],
                    "@proj/project-3": ["libs/proj3a/index.ts"],
                    "@proj/proj4ab": ["libs/proj4ab/index.ts"]
                }
            }
        }"#
    }

    fn edges_from<'g>(graph: &'g ProjectGraph, source: &str) -> Vec<&'g Edge> {
        graph
            .dependencies
            .get(source)
            .map(|edges| edges.iter().collect())
            .unwrap_or_default()
    }

    #[test]
    fn cross_project_imports_become_edges() {
        let fixture = Fixture::new();
        fixture
            .file("tsconfig.base.json", proj_mappings())
            .project("libs/proj", "proj")
            .project("libs/proj2", "proj2")
            .project("libs/proj3a", "proj3a")
            .project("libs/proj4ab", "proj4ab")
            .file(
                "libs/proj/index.ts",
                r#"import {a} from '@proj/my-second-proj';
await import('@proj/project-3');
require('@proj/proj4ab');
"#,
            );

        let (graph, _) = fixture.build().unwrap();
        let edges = edges_from(&graph, "proj");

        assert_eq!(edges.len(), 3);
        let targets: Vec<&str> = edges.iter().map(|e| e.target.as_str()).collect();
        assert!(targets.contains(&"proj2"));
        assert!(targets.contains(&"proj3a"));
        assert!(targets.contains(&"proj4ab"));
        for edge in &edges {
            assert_eq!(
                edge.source_file.as_deref(),
                Some(Utf8Path::new("libs/proj/index.ts"))
            );
        }
    }

    #[test]
    fn ignore_comment_suppresses_the_edge() {
        let fixture = Fixture::new();
        fixture
            .file("tsconfig.base.json", proj_mappings())
            .project("libs/proj", "proj")
            .project("libs/proj2", "proj2")
            .file(
                "libs/proj/index.ts",
                "// nx-ignore-next-line\nimport {a} from '@proj/my-second-proj';\n",
            );

        let (graph, _) = fixture.build().unwrap();
        assert!(edges_from(&graph, "proj").is_empty());
    }

    #[test]
    fn block_ignore_comment_with_whitespace_suppresses_the_edge() {
        let fixture = Fixture::new();
        fixture
            .file("tsconfig.base.json", proj_mappings())
            .project("libs/proj", "proj")
            .project("libs/proj2", "proj2")
            .file(
                "libs/proj/index.ts",
                "/* nx-ignore-next-line */\n\n   \nimport {a} from '@proj/my-second-proj';\n",
            );

        let (graph, _) = fixture.build().unwrap();
        assert!(edges_from(&graph, "proj").is_empty());
    }

    #[test]
    fn stringified_imports_do_not_count() {
        let fixture = Fixture::new();
        fixture
            .file("tsconfig.base.json", proj_mappings())
            .project("libs/proj", "proj")
            .project("libs/proj2", "proj2")
            .file(
                "libs/proj/index.ts",
                "const doc = `import {a} from '@proj/my-second-proj'`;\nimport {b} from '@proj/my-second-proj';\n",
            );

        let (graph, _) = fixture.build().unwrap();
        let edges = edges_from(&graph, "proj");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, "proj2");
    }

    #[test]
    fn load_children_contributes_a_dynamic_edge() {
        let fixture = Fixture::new();
        fixture
            .file("tsconfig.base.json", proj_mappings())
            .project("libs/proj", "proj")
            .project("libs/proj4ab", "proj4ab")
            .file(
                "libs/proj/routes.ts",
                "const routes = [{ loadChildren: '@proj/proj4ab#a' }];\n",
            );

        let (graph, _) = fixture.build().unwrap();
        let edges = edges_from(&graph, "proj");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, "proj4ab");
        assert_eq!(edges[0].kind, EdgeKind::Dynamic);
    }

    #[test]
    fn ignored_load_children_contributes_nothing() {
        let fixture = Fixture::new();
        fixture
            .file("tsconfig.base.json", proj_mappings())
            .project("libs/proj", "proj")
            .project("libs/proj4ab", "proj4ab")
            .file(
                "libs/proj/routes.ts",
                "// nx-ignore-next-line\nconst routes = [{ loadChildren: '@proj/proj4ab#a' }];\n",
            );

        let (graph, _) = fixture.build().unwrap();
        assert!(edges_from(&graph, "proj").is_empty());
    }

    #[test]
    fn import_cycle_aborts_the_build() {
        let fixture = Fixture::new();
        fixture
            .file(
                "tsconfig.base.json",
                r#"{ "compilerOptions": { "paths": {
                    "@proj/a": ["libs/a/index.ts"],
                    "@proj/b": ["libs/b/index.ts"]
                } } }"#,
            )
            .project("libs/a", "a")
            .project("libs/b", "b")
            .file("libs/a/index.ts", "import '@proj/b';\n")
            .file("libs/b/index.ts", "import '@proj/a';\n");

        let err = fixture.build().unwrap_err();
        let TsumugiError::Graph(crate::error::GraphError::Cycle { path }) = err else {
            panic!("expected a cycle, got {err:?}");
        };
        assert!(path.contains(&"a".to_string()));
        assert!(path.contains(&"b".to_string()));
    }

    #[test]
    fn unscannable_file_warns_and_builds_anyway() {
        let fixture = Fixture::new();
        fixture
            .project("libs/a", "a")
            .file("libs/a/broken.ts", "const s = `never closed\n");

        let (graph, warnings) = fixture.build().unwrap();
        assert!(graph.nodes.contains_key("a"));
        assert!(warnings.iter().any(|w| {
            w.file.as_deref() == Some(Utf8Path::new("libs/a/broken.ts"))
        }));
    }

    #[test]
    fn lockfile_packages_become_external_nodes() {
        let fixture = Fixture::new();
        fixture.project("libs/a", "a").file(
            "package-lock.json",
            r#"{
                "packages": {
                    "": {},
                    "node_modules/lodash": { "version": "4.17.21", "integrity": "sha512-abc" },
                    "node_modules/@scope/pkg": { "version": "1.0.0" }
                }
            }"#,
        );

        let (graph, _) = fixture.build().unwrap();
        assert_eq!(graph.external_nodes["npm:lodash"].version, "4.17.21");
        assert_eq!(
            graph.external_nodes["npm:lodash"].hash.as_deref(),
            Some("sha512-abc")
        );
        assert_eq!(graph.external_nodes["npm:@scope/pkg"].package_name, "@scope/pkg");
    }

    #[test]
    fn external_imports_resolve_to_external_nodes() {
        let fixture = Fixture::new();
        fixture
            .project("libs/a", "a")
            .file(
                "package-lock.json",
                r#"{ "packages": { "node_modules/lodash": { "version": "4.17.21" } } }"#,
            )
            .file("libs/a/index.ts", "import { chunk } from 'lodash';\n");

        let (graph, _) = fixture.build().unwrap();
        let edges = edges_from(&graph, "a");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, "npm:lodash");
    }

    #[test]
    fn descriptor_implicit_dependencies_add_implicit_edges() {
        let fixture = Fixture::new();
        fixture
            .project("libs/a", "a")
            .file(
                "libs/b/project.json",
                r#"{ "name": "b", "implicitDependencies": ["a"] }"#,
            );

        let (graph, _) = fixture.build().unwrap();
        let edges = edges_from(&graph, "b");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, EdgeKind::Implicit);
        assert_eq!(edges[0].target, "a");
    }

    #[test]
    fn descriptor_targets_override_inferred_ones() {
        let fixture = Fixture::new();
        fixture
            .file(
                "packages/a/package.json",
                r#"{ "name": "a", "scripts": { "build": "npm-build" } }"#,
            )
            .file(
                "packages/a/project.json",
                r#"{ "name": "a", "targets": { "build": { "command": "real-build" } } }"#,
            );

        let (graph, _) = fixture.build().unwrap();
        assert_eq!(
            graph.nodes["a"].targets["build"].command.as_deref(),
            Some("real-build")
        );
    }

    #[test]
    fn legacy_cacheable_operations_mark_targets_cacheable() {
        let fixture = Fixture::new();
        fixture
            .file(
                "tsumugi.json",
                r#"{ "tasksRunnerOptions": { "runner": "local", "options": { "cacheableOperations": ["build"] } } }"#,
            )
            .file(
                "libs/a/project.json",
                r#"{ "name": "a", "targets": {
                    "build": { "command": "tsc" },
                    "serve": { "command": "vite" }
                } }"#,
            );

        let (graph, _) = fixture.build().unwrap();
        assert!(graph.nodes["a"].targets["build"].cache);
        assert!(!graph.nodes["a"].targets["serve"].cache);
    }

    #[test]
    fn target_defaults_fill_target_gaps() {
        let fixture = Fixture::new();
        fixture
            .file(
                "tsumugi.json",
                r#"{ "targetDefaults": { "build": { "dependsOn": ["^build"], "cache": true } } }"#,
            )
            .file(
                "libs/a/project.json",
                r#"{ "name": "a", "targets": { "build": { "command": "tsc" } } }"#,
            );

        let (graph, _) = fixture.build().unwrap();
        let build = &graph.nodes["a"].targets["build"];
        assert!(build.cache);
        assert_eq!(build.depends_on.len(), 1);
    }
}
