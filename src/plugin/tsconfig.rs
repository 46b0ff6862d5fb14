//! Built-in plugin contributing a typecheck target to projects that own
//! a `tsconfig.json`.
//!
//! Options accept the dynamic shape `boolean | { targetName? }`; the
//! shape is normalized once, here, and the normalized value is what the
//! rest of the plugin consumes.

use camino::Utf8PathBuf;
use serde_json::Value;

use crate::config::TargetConfig;
use crate::plugin::{CreateNodesContext, Plugin, ProjectDelta};

pub const NAME: &str = "tsumugi/tsconfig";

/// Normalized plugin options.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Options {
    Disabled,
    Enabled { target_name: String },
}

fn normalize(value: &Value) -> Options {
    match value {
        Value::Bool(false) => Options::Disabled,
        Value::Object(map) => Options::Enabled {
            target_name: map
                .get("targetName")
                .and_then(Value::as_str)
                .unwrap_or("typecheck")
                .to_string(),
        },
        _ => Options::Enabled {
            target_name: "typecheck".to_string(),
        },
    }
}

pub struct TsconfigPlugin;

impl Plugin for TsconfigPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn create_nodes_glob(&self) -> Option<&'static str> {
        Some("**/tsconfig.json")
    }

    fn create_nodes(
        &self,
        files: &[Utf8PathBuf],
        ctx: &CreateNodesContext,
    ) -> anyhow::Result<Vec<ProjectDelta>> {
        let Options::Enabled { target_name } = normalize(ctx.options) else {
            return Ok(Vec::new());
        };

        let mut deltas = Vec::new();

        for file in files {
            let Some(root) = file.parent() else {
                continue;
            };
            // The root tsconfig carries workspace-wide settings, not a
            // project.
            if root.as_str().is_empty() {
                continue;
            }

            let target = TargetConfig {
                command: Some(format!("tsc -p {file} --noEmit")),
                cache: true,
                ..TargetConfig::default()
            };

            deltas.push(ProjectDelta {
                root: root.to_owned(),
                name: None,
                project_type: None,
                targets: [(target_name.clone(), target)].into_iter().collect(),
                tags: Vec::new(),
            });
        }

        Ok(deltas)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::core::Hash32;
    use camino::Utf8Path;

    fn run(options: Value) -> Vec<ProjectDelta> {
        let config = WorkspaceConfig::default();
        let ctx = CreateNodesContext {
            workspace_root: Utf8Path::new("/ws"),
            config: &config,
            options: &options,
            fingerprint: Hash32::default(),
        };

        TsconfigPlugin
            .create_nodes(
                &[
                    Utf8PathBuf::from("tsconfig.json"),
                    Utf8PathBuf::from("libs/a/tsconfig.json"),
                ],
                &ctx,
            )
            .unwrap()
    }

    #[test]
    fn contributes_typecheck_target_per_project_tsconfig() {
        let deltas = run(Value::Null);

        // The root tsconfig is skipped.
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].root, Utf8PathBuf::from("libs/a"));
        let target = &deltas[0].targets["typecheck"];
        assert!(target.cache);
        assert_eq!(
            target.command.as_deref(),
            Some("tsc -p libs/a/tsconfig.json --noEmit")
        );
    }

    #[test]
    fn target_name_is_configurable() {
        let deltas = run(serde_json::json!({ "targetName": "check-types" }));
        assert!(deltas[0].targets.contains_key("check-types"));
    }

    #[test]
    fn false_disables_the_plugin() {
        assert!(run(Value::Bool(false)).is_empty());
    }
}
