//! Workspace and project configuration.
//!
//! The workspace is configured by a single `tsumugi.json` at the root and
//! an optional `project.json` per project. Both files accept `//` and
//! `/* */` comments as well as trailing commas; a small deterministic
//! pre-pass strips them before handing the text to serde.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// File name of the workspace configuration.
pub const WORKSPACE_CONFIG: &str = "tsumugi.json";

/// File name of the per-project descriptor.
pub const PROJECT_CONFIG: &str = "project.json";

/// Workspace-level configuration, as loaded from `tsumugi.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceConfig {
    pub plugins: Vec<PluginRegistration>,
    pub target_defaults: BTreeMap<String, TargetConfig>,
    pub named_inputs: BTreeMap<String, Vec<InputSpec>>,
    tasks_runner_options: RunnerOptionsField,
    pub implicit_dependencies: BTreeMap<String, ImplicitDependents>,
    pub affected: AffectedConfig,
    pub workspace_layout: WorkspaceLayout,
    pub cache_directory: Option<Utf8PathBuf>,
}

impl WorkspaceConfig {
    /// Load the workspace configuration from `<root>/tsumugi.json`.
    /// A missing file yields the default configuration.
    pub fn load(workspace_root: &Utf8Path) -> Result<Self, ConfigError> {
        let path = workspace_root.join(WORKSPACE_CONFIG);

        if !path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        Self::parse(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(&strip_json_comments(text))
    }

    /// Resolve the named task runner, falling back to `default`.
    pub fn runner(&self, name: Option<&str>) -> Result<RunnerConfig, ConfigError> {
        let name = name.unwrap_or("default");
        match &self.tasks_runner_options {
            RunnerOptionsField::Runners(map) => match map.get(name) {
                Some(runner) => Ok(runner.clone()),
                None if name == "default" => Ok(RunnerConfig::default()),
                None => Err(ConfigError::UnknownRunner(name.to_string())),
            },
            // Legacy simplified form: a single implied default runner.
            RunnerOptionsField::Single(runner) => {
                if name == "default" {
                    Ok(runner.clone())
                } else {
                    Err(ConfigError::UnknownRunner(name.to_string()))
                }
            }
        }
    }

    /// Named input expansion, with the built-in `default` meaning "every
    /// file in the project".
    pub fn named_input(&self, name: &str) -> Vec<InputSpec> {
        if let Some(inputs) = self.named_inputs.get(name) {
            return inputs.clone();
        }

        match name {
            "default" => vec![InputSpec::Source("{projectRoot}/**/*".to_string())],
            _ => Vec::new(),
        }
    }
}

/// `tasksRunnerOptions` accepts either a mapping of runner names, or a
/// legacy simplified form where the object itself is the default runner.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RunnerOptionsField {
    Runners(BTreeMap<String, RunnerConfig>),
    Single(RunnerConfig),
}

impl Default for RunnerOptionsField {
    fn default() -> Self {
        RunnerOptionsField::Runners(BTreeMap::new())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    pub runner: Option<String>,
    pub options: RunnerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    pub cacheable_operations: Vec<String>,
    pub parallel: Option<usize>,
}

/// Plugin registration: either a bare identifier string or an object
/// carrying options. Normalized to the expanded form at parse time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PluginRegistration {
    Name(String),
    Expanded {
        plugin: String,
        #[serde(default)]
        options: Value,
        #[serde(default)]
        optional: bool,
    },
}

impl PluginRegistration {
    pub fn name(&self) -> &str {
        match self {
            PluginRegistration::Name(name) => name,
            PluginRegistration::Expanded { plugin, .. } => plugin,
        }
    }

    pub fn options(&self) -> Value {
        match self {
            PluginRegistration::Name(_) => Value::Null,
            PluginRegistration::Expanded { options, .. } => options.clone(),
        }
    }

    pub fn optional(&self) -> bool {
        match self {
            PluginRegistration::Name(_) => false,
            PluginRegistration::Expanded { optional, .. } => *optional,
        }
    }
}

/// Value side of `implicitDependencies`: `"*"` or an explicit list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImplicitDependents {
    All(String),
    Projects(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AffectedConfig {
    pub default_base: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceLayout {
    pub apps_dir: Option<Utf8PathBuf>,
    pub libs_dir: Option<Utf8PathBuf>,
}

/// A target as declared on a project or in `targetDefaults`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub configurations: BTreeMap<String, serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_configuration: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependsOn>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cache: bool,
}

impl TargetConfig {
    /// Layer workspace `targetDefaults` under this target. Values the
    /// target declares win; defaults fill the gaps.
    pub fn merge_defaults(&mut self, defaults: &TargetConfig) {
        if self.executor.is_none() {
            self.executor = defaults.executor.clone();
        }
        if self.command.is_none() {
            self.command = defaults.command.clone();
        }
        if self.depends_on.is_empty() {
            self.depends_on = defaults.depends_on.clone();
        }
        if self.inputs.is_empty() {
            self.inputs = defaults.inputs.clone();
        }
        if self.outputs.is_empty() {
            self.outputs = defaults.outputs.clone();
        }
        if !self.cache {
            self.cache = defaults.cache;
        }
        for (key, value) in &defaults.options {
            self.options
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// One entry of a target's `dependsOn` list.
///
/// The shorthand string form `"^build"` or `"build"` is normalized into
/// [`TargetDependencyRule`] via [`DependsOn::rule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    Shorthand(String),
    Expanded {
        target: String,
        #[serde(default)]
        projects: Option<DependencyScope>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyScope {
    #[serde(rename = "self")]
    OwnProject,
    Dependencies,
}

/// Normalized dependency rule: "before running this target, run `target`
/// on `scope`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDependencyRule {
    pub target: String,
    pub scope: DependencyScope,
}

impl DependsOn {
    pub fn rule(&self) -> TargetDependencyRule {
        match self {
            DependsOn::Shorthand(spec) => match spec.strip_prefix('^') {
                Some(target) => TargetDependencyRule {
                    target: target.to_string(),
                    scope: DependencyScope::Dependencies,
                },
                None => TargetDependencyRule {
                    target: spec.clone(),
                    scope: DependencyScope::OwnProject,
                },
            },
            DependsOn::Expanded {
                target, projects, ..
            } => TargetDependencyRule {
                target: target.clone(),
                scope: projects.unwrap_or(DependencyScope::OwnProject),
            },
        }
    }
}

/// One entry of a target's `inputs` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    /// A glob pattern, a named input reference, or either of those with a
    /// `^` prefix applying it to dependency projects.
    Source(String),
    /// The value of an environment variable.
    Env { env: String },
    /// The stdout of a command run at hash time.
    Runtime { runtime: String },
}

/// Substitute `{project.name}`-style tokens in a string.
///
/// Only top-level project properties and `{workspaceRoot}` are allowed;
/// nesting an interpolation inside another is rejected. `{{` escapes a
/// literal brace.
pub fn interpolate(
    template: &str,
    project_name: &str,
    project_root: &Utf8Path,
    source_root: Option<&Utf8Path>,
    workspace_root: &Utf8Path,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    loop {
        let Some(brace) = rest.find(['{', '}']) else {
            out.push_str(rest);
            break;
        };

        out.push_str(&rest[..brace]);
        let after = &rest[brace + 1..];

        if rest.as_bytes()[brace] == b'}' {
            // A lone `}` passes through; `}}` collapses to one.
            out.push('}');
            rest = after.strip_prefix('}').unwrap_or(after);
            continue;
        }

        if let Some(tail) = after.strip_prefix('{') {
            out.push('{');
            rest = tail;
            continue;
        }

        let Some(close) = after.find('}') else {
            // No closing brace: leave the remainder untouched.
            out.push('{');
            rest = after;
            continue;
        };

        let token = &after[..close];
        if token.contains('{') {
            return Err(ConfigError::NestedInterpolation(template.to_string()));
        }

        match token {
            "project.name" | "projectName" => out.push_str(project_name),
            "project.root" | "projectRoot" => out.push_str(project_root.as_str()),
            "project.sourceRoot" => {
                out.push_str(source_root.unwrap_or(project_root).as_str());
            }
            "workspaceRoot" => out.push_str(workspace_root.as_str()),
            _ => return Err(ConfigError::UnknownInterpolation(token.to_string())),
        }

        rest = &after[close + 1..];
    }

    Ok(out)
}

/// Strip `//` and `/* */` comments and trailing commas from JSON text.
///
/// Replaces stripped bytes with spaces (and keeps newlines) so that serde
/// error positions still point at the right place in the original file.
pub fn strip_json_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                out.push(b'"');
                i += 1;
                while i < bytes.len() {
                    out.push(bytes[i]);
                    match bytes[i] {
                        b'\\' if i + 1 < bytes.len() => {
                            out.push(bytes[i + 1]);
                            i += 2;
                        }
                        b'"' => {
                            i += 1;
                            break;
                        }
                        _ => i += 1,
                    }
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    out.push(b' ');
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                out.extend_from_slice(b"  ");
                while i < bytes.len() {
                    if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                        out.extend_from_slice(b"  ");
                        i += 2;
                        break;
                    }
                    out.push(if bytes[i] == b'\n' { b'\n' } else { b' ' });
                    i += 1;
                }
            }
            b',' => {
                // Trailing comma: a comma whose next significant byte
                // closes the container.
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                    j += 1;
                }
                if j < bytes.len() && (bytes[j] == b'}' || bytes[j] == b']') {
                    out.push(b' ');
                } else {
                    out.push(b',');
                }
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8(out).unwrap_or_else(|_| text.to_string())
}
