//! Root `tsconfig.json` project-reference sync.
//!
//! TypeScript project references let `tsc --build` traverse the
//! workspace; they drift as projects come and go. The sync rewrites the
//! root config's `references` list so every workspace project appears
//! exactly once: existing entries keep their positions (including
//! entries pointing at directories that no longer exist — the user may
//! know something we don't), and missing projects are appended sorted by
//! root.

use camino::Utf8Path;
use serde_json::{json, Value};

use crate::config::strip_json_comments;
use crate::error::ConfigError;
use crate::graph::ProjectGraph;
use crate::tree::VirtualTree;

const ROOT_TSCONFIG: &str = "tsconfig.json";

/// Stage an updated root tsconfig in `tree`. Returns whether anything
/// changed.
pub fn sync_project_references(
    tree: &mut VirtualTree,
    graph: &ProjectGraph,
) -> Result<bool, ConfigError> {
    let text = if tree.exists(ROOT_TSCONFIG) {
        tree.read_to_string(ROOT_TSCONFIG)
            .map_err(|source| ConfigError::Read {
                path: ROOT_TSCONFIG.into(),
                source,
            })?
    } else {
        "{}".to_string()
    };

    let mut config: Value =
        serde_json::from_str(&strip_json_comments(&text)).map_err(|source| {
            ConfigError::Parse {
                path: ROOT_TSCONFIG.into(),
                source,
            }
        })?;

    let existing = config
        .get("references")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut references = existing.clone();
    let mut known: Vec<&str> = existing
        .iter()
        .filter_map(|reference| reference.get("path").and_then(Value::as_str))
        .collect();

    let mut missing: Vec<&Utf8Path> = graph
        .nodes
        .values()
        .map(|node| node.root.as_path())
        .filter(|root| !known.contains(&root.as_str()))
        .collect();
    missing.sort_unstable();
    missing.dedup();

    for root in missing {
        references.push(json!({ "path": root.as_str() }));
        known.push(root.as_str());
    }

    let changed = references != existing;
    if changed {
        config["references"] = Value::Array(references);
        let rendered = serde_json::to_string_pretty(&config).map_err(|source| {
            ConfigError::Parse {
                path: ROOT_TSCONFIG.into(),
                source,
            }
        })?;
        tree.write(ROOT_TSCONFIG, format!("{rendered}\n"));
    }

    Ok(changed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{ProjectNode, ProjectType};
    use camino::Utf8PathBuf;

    fn graph_with_roots(roots: &[(&str, &str)]) -> ProjectGraph {
        let mut graph = ProjectGraph::default();
        for (name, root) in roots {
            graph.nodes.insert(
                (*name).to_string(),
                ProjectNode {
                    name: (*name).to_string(),
                    root: Utf8PathBuf::from(*root),
                    project_type: ProjectType::Lib,
                    source_root: None,
                    targets: Default::default(),
                    tags: Vec::new(),
                },
            );
        }
        graph
    }

    fn tree_with_tsconfig(content: &str) -> (tempfile::TempDir, VirtualTree) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        std::fs::write(root.join("tsconfig.json"), content).unwrap();
        (tmp, VirtualTree::new(root))
    }

    fn reference_paths(tree: &VirtualTree) -> Vec<String> {
        let text = tree.read_to_string("tsconfig.json").unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        value["references"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["path"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn references_cover_every_project() {
        let graph = graph_with_roots(&[("b", "packages/b"), ("a", "packages/a")]);
        let (_tmp, mut tree) = tree_with_tsconfig("{}");

        assert!(sync_project_references(&mut tree, &graph).unwrap());
        assert_eq!(reference_paths(&tree), vec!["packages/a", "packages/b"]);
    }

    #[test]
    fn existing_references_are_preserved_and_new_ones_appended() {
        let graph = graph_with_roots(&[("a", "packages/a"), ("b", "packages/b")]);
        // packages/c does not exist in the workspace; it stays anyway.
        let (_tmp, mut tree) = tree_with_tsconfig(
            r#"{ "references": [{ "path": "packages/c" }, { "path": "packages/a" }] }"#,
        );

        assert!(sync_project_references(&mut tree, &graph).unwrap());
        assert_eq!(
            reference_paths(&tree),
            vec!["packages/c", "packages/a", "packages/b"]
        );
    }

    #[test]
    fn sync_is_idempotent() {
        let graph = graph_with_roots(&[("a", "packages/a"), ("b", "packages/b")]);
        let (_tmp, mut tree) = tree_with_tsconfig("{}");

        assert!(sync_project_references(&mut tree, &graph).unwrap());
        tree.commit(None).unwrap();

        // A second sync finds nothing to do.
        assert!(!sync_project_references(&mut tree, &graph).unwrap());
        assert_eq!(reference_paths(&tree), vec!["packages/a", "packages/b"]);
    }

    #[test]
    fn other_settings_survive_the_rewrite() {
        let graph = graph_with_roots(&[("a", "packages/a")]);
        let (_tmp, mut tree) = tree_with_tsconfig(
            r#"{
                // keep the compiler strict
                "compilerOptions": { "strict": true }
            }"#,
        );

        sync_project_references(&mut tree, &graph).unwrap();

        let text = tree.read_to_string("tsconfig.json").unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["compilerOptions"]["strict"], true);
    }
}
