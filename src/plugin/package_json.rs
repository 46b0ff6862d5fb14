//! Built-in plugin inferring projects and targets from `package.json`.
//!
//! Every `package.json` below the workspace root proposes a project at
//! its directory, named after the manifest's `name` field, with one
//! command target per script.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::config::TargetConfig;
use crate::graph::ProjectType;
use crate::plugin::{CreateNodesContext, Plugin, ProjectDelta};

pub const NAME: &str = "tsumugi/package-json";

#[derive(Deserialize)]
struct PackageManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

pub struct PackageJsonPlugin;

impl Plugin for PackageJsonPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create_nodes_glob(&self) -> Option<&'static str> {
        Some("**/package.json")
    }

    fn create_nodes(
        &self,
        files: &[Utf8PathBuf],
        ctx: &CreateNodesContext,
    ) -> anyhow::Result<Vec<ProjectDelta>> {
        let mut deltas = Vec::new();

        for file in files {
            let Some(root) = file.parent() else {
                continue;
            };
            // The workspace root manifest describes the workspace itself.
            if root.as_str().is_empty() {
                continue;
            }

            let text = fs::read_to_string(ctx.workspace_root.join(file))?;
            let manifest: PackageManifest = match serde_json::from_str(&text) {
                Ok(manifest) => manifest,
                // A broken manifest shouldn't sink the whole workspace.
                Err(_) => continue,
            };

            let targets = manifest
                .scripts
                .into_iter()
                .map(|(script, command)| {
                    let target = TargetConfig {
                        command: Some(command),
                        ..TargetConfig::default()
                    };
                    (script, target)
                })
                .collect();

            deltas.push(ProjectDelta {
                root: root.to_owned(),
                name: manifest.name,
                project_type: Some(project_type_for(root, ctx)),
                targets,
                tags: Vec::new(),
            });
        }

        Ok(deltas)
    }
}

fn project_type_for(root: &Utf8Path, ctx: &CreateNodesContext) -> ProjectType {
    let layout = &ctx.config.workspace_layout;

    if let Some(apps) = &layout.apps_dir
        && root.starts_with(apps)
    {
        return ProjectType::App;
    }
    if root.starts_with("apps") {
        return ProjectType::App;
    }

    ProjectType::Lib
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::core::Hash32;

    #[test]
    fn scripts_become_command_targets() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("packages/a")).unwrap();
        std::fs::write(
            tmp.path().join("packages/a/package.json"),
            r#"{ "name": "a", "scripts": { "build": "tsc -p .", "test": "vitest run" } }"#,
        )
        .unwrap();

        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let config = WorkspaceConfig::default();
        let ctx = CreateNodesContext {
            workspace_root: &root,
            config: &config,
            options: &serde_json::Value::Null,
            fingerprint: Hash32::default(),
        };

        let deltas = PackageJsonPlugin
            .create_nodes(&[Utf8PathBuf::from("packages/a/package.json")], &ctx)
            .unwrap();

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].name.as_deref(), Some("a"));
        assert_eq!(deltas[0].root, Utf8PathBuf::from("packages/a"));
        assert_eq!(
            deltas[0].targets["build"].command.as_deref(),
            Some("tsc -p .")
        );
        assert_eq!(
            deltas[0].targets["test"].command.as_deref(),
            Some("vitest run")
        );
    }

    #[test]
    fn apps_directory_marks_projects_as_apps() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("apps/web")).unwrap();
        std::fs::write(
            tmp.path().join("apps/web/package.json"),
            r#"{ "name": "web" }"#,
        )
        .unwrap();

        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let config = WorkspaceConfig::default();
        let ctx = CreateNodesContext {
            workspace_root: &root,
            config: &config,
            options: &serde_json::Value::Null,
            fingerprint: Hash32::default(),
        };

        let deltas = PackageJsonPlugin
            .create_nodes(&[Utf8PathBuf::from("apps/web/package.json")], &ctx)
            .unwrap();
        assert_eq!(deltas[0].project_type, Some(ProjectType::App));
    }
}
