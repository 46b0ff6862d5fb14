//! Task graph planning.
//!
//! Each requested `(project, target, configuration?)` triple is expanded
//! depth-first through the target's `dependsOn` rules. `^target` rules
//! follow project graph edges; when a direct dependency lacks the target,
//! the search lifts transitively through that dependency's own
//! dependencies. Revisiting a task that is still being expanded means the
//! dependency rules form a cycle, which is reported with the offending
//! path and aborts planning.

use std::collections::{BTreeSet, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::config::{interpolate, DependencyScope, TargetConfig};
use crate::error::{ConfigError, PlannerError};
use crate::graph::{ProjectGraph, ProjectNode};
use crate::task::{Task, TargetTriple, TaskGraph};

pub struct TaskPlanner<'a> {
    graph: &'a ProjectGraph,
    workspace_root: &'a Utf8Path,
}

impl<'a> TaskPlanner<'a> {
    pub fn new(graph: &'a ProjectGraph, workspace_root: &'a Utf8Path) -> Self {
        Self {
            graph,
            workspace_root,
        }
    }

    /// Expand the initiating triples into a task graph. `overrides`
    /// apply to the initiating tasks only.
    pub fn plan(
        &self,
        initiating: &[TargetTriple],
        overrides: &serde_json::Map<String, Value>,
    ) -> Result<TaskGraph, PlannerError> {
        let mut graph = TaskGraph::default();
        let mut visiting = Vec::new();

        for triple in initiating {
            let project = self
                .graph
                .project(&triple.project)
                .ok_or_else(|| ConfigError::UnknownProject(triple.project.clone()))?;

            let target = project.targets.get(&triple.target).ok_or_else(|| {
                ConfigError::UnknownTarget {
                    project: triple.project.clone(),
                    target: triple.target.clone(),
                }
            })?;

            // The user asked for this configuration by name; unlike a
            // propagated rule it must exist.
            if let Some(configuration) = &triple.configuration
                && !target.configurations.contains_key(configuration)
            {
                return Err(ConfigError::UnknownConfiguration {
                    project: triple.project.clone(),
                    target: triple.target.clone(),
                    configuration: configuration.clone(),
                }
                .into());
            }

            self.visit(triple.clone(), overrides, true, &mut graph, &mut visiting)?;
        }

        Ok(graph)
    }

    fn visit(
        &self,
        triple: TargetTriple,
        overrides: &serde_json::Map<String, Value>,
        initiating: bool,
        graph: &mut TaskGraph,
        visiting: &mut Vec<String>,
    ) -> Result<(), PlannerError> {
        let id = triple.id();

        if graph.task(&id).is_some() {
            return Ok(());
        }
        if let Some(position) = visiting.iter().position(|v| v == &id) {
            let mut path = visiting[position..].to_vec();
            path.push(id);
            return Err(PlannerError::Cycle { path });
        }

        // Projects reached through graph edges always exist; only the
        // initiating triples can name an unknown project, and plan()
        // already checked those.
        let project = self
            .graph
            .project(&triple.project)
            .ok_or_else(|| ConfigError::UnknownProject(triple.project.clone()))?;
        let target = project.targets.get(&triple.target).ok_or_else(|| {
            ConfigError::UnknownTarget {
                project: triple.project.clone(),
                target: triple.target.clone(),
            }
        })?;

        visiting.push(id.clone());

        let mut prerequisites = Vec::new();
        for depends_on in &target.depends_on {
            let rule = depends_on.rule();

            match rule.scope {
                DependencyScope::OwnProject => {
                    if project.targets.contains_key(&rule.target) {
                        let prerequisite = self.propagated_triple(project, &rule.target, &triple);
                        self.visit(
                            prerequisite.clone(),
                            &serde_json::Map::new(),
                            false,
                            graph,
                            visiting,
                        )?;
                        prerequisites.push(prerequisite.id());
                    }
                }
                DependencyScope::Dependencies => {
                    for dependency in self.dependencies_with_target(&triple.project, &rule.target)
                    {
                        let node = self
                            .graph
                            .project(&dependency)
                            .ok_or_else(|| ConfigError::UnknownProject(dependency.clone()))?;
                        let prerequisite = self.propagated_triple(node, &rule.target, &triple);
                        self.visit(
                            prerequisite.clone(),
                            &serde_json::Map::new(),
                            false,
                            graph,
                            visiting,
                        )?;
                        prerequisites.push(prerequisite.id());
                    }
                }
            }
        }

        visiting.pop();

        let task = self.create_task(triple, project, target, overrides, initiating)?;
        graph.insert(task, prerequisites);
        Ok(())
    }

    /// Direct dependencies of `project` that have `target`, lifting
    /// transitively through dependencies that lack it.
    fn dependencies_with_target(&self, project: &str, target: &str) -> Vec<String> {
        let mut found = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut frontier: Vec<&str> = self.graph.direct_dependencies(project);

        while let Some(dependency) = frontier.pop() {
            if !seen.insert(dependency.to_string()) {
                continue;
            }

            match self.graph.project(dependency) {
                Some(node) if node.targets.contains_key(target) => {
                    found.insert(dependency.to_string());
                }
                Some(_) => frontier.extend(self.graph.direct_dependencies(dependency)),
                None => {}
            }
        }

        found.into_iter().collect()
    }

    /// Configuration for a prerequisite: keep the requested one when the
    /// dependency declares it, otherwise fall back to the dependency's
    /// default. A missing configuration is only an error on the
    /// initiating triple.
    fn propagated_triple(
        &self,
        project: &ProjectNode,
        target: &str,
        requested: &TargetTriple,
    ) -> TargetTriple {
        let config = project.targets.get(target);

        let configuration = requested
            .configuration
            .as_ref()
            .filter(|name| {
                config.is_some_and(|target| target.configurations.contains_key(name.as_str()))
            })
            .cloned()
            .or_else(|| config.and_then(|target| target.default_configuration.clone()));

        TargetTriple::new(project.name.clone(), target, configuration)
    }

    fn create_task(
        &self,
        triple: TargetTriple,
        project: &ProjectNode,
        target: &TargetConfig,
        overrides: &serde_json::Map<String, Value>,
        initiating: bool,
    ) -> Result<Task, PlannerError> {
        // options = target options <- configuration <- overrides
        let mut options = target.options.clone();
        if let Some(configuration) = &triple.configuration
            && let Some(layer) = target.configurations.get(configuration)
        {
            for (key, value) in layer {
                options.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in overrides {
            options.insert(key.clone(), value.clone());
        }

        let options = self.interpolate_map(options, project)?;
        let command = self.resolve_command(target, &options, project)?;

        if initiating && command.is_none() {
            return Err(ConfigError::MissingCommand {
                project: triple.project.clone(),
                target: triple.target.clone(),
            }
            .into());
        }

        let mut outputs = Vec::new();
        for output in &target.outputs {
            let interpolated = self.interpolate_str(output, project)?;
            outputs.push(Utf8PathBuf::from(interpolated));
        }

        Ok(Task {
            id: triple.id(),
            project_root: project.root.clone(),
            target: triple,
            options,
            overrides: overrides.clone(),
            outputs,
            cache: target.cache,
            command,
            hash: None,
            hash_details: None,
        })
    }

    /// A target is runnable via its `command`, or via the command-runner
    /// executor with `options.command` / `options.commands`.
    fn resolve_command(
        &self,
        target: &TargetConfig,
        options: &serde_json::Map<String, Value>,
        project: &ProjectNode,
    ) -> Result<Option<String>, PlannerError> {
        if let Some(command) = &target.command {
            return Ok(Some(self.interpolate_str(command, project)?));
        }

        match target.executor.as_deref() {
            Some("tsumugi:run-commands") => {
                if let Some(command) = options.get("command").and_then(Value::as_str) {
                    return Ok(Some(command.to_string()));
                }
                if let Some(commands) = options.get("commands").and_then(Value::as_array) {
                    let joined: Vec<&str> =
                        commands.iter().filter_map(Value::as_str).collect();
                    if !joined.is_empty() {
                        return Ok(Some(joined.join(" && ")));
                    }
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn interpolate_str(&self, text: &str, project: &ProjectNode) -> Result<String, PlannerError> {
        interpolate(
            text,
            &project.name,
            &project.root,
            project.source_root.as_deref(),
            self.workspace_root,
        )
        .map_err(PlannerError::from)
    }

    fn interpolate_map(
        &self,
        options: serde_json::Map<String, Value>,
        project: &ProjectNode,
    ) -> Result<serde_json::Map<String, Value>, PlannerError> {
        options
            .into_iter()
            .map(|(key, value)| Ok((key, self.interpolate_value(value, project)?)))
            .collect()
    }

    fn interpolate_value(
        &self,
        value: Value,
        project: &ProjectNode,
    ) -> Result<Value, PlannerError> {
        Ok(match value {
            Value::String(text) => Value::String(self.interpolate_str(&text, project)?),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.interpolate_value(item, project))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(self.interpolate_map(map, project)?),
            other => other,
        })
    }
}
