//! Tasks and the task graph.
//!
//! A task is one `(project, target, configuration?)` invocation. The
//! planner produces a [`TaskGraph`]; the hasher fills in each task's
//! hash; the runner consumes the graph read-only. Insertion order is
//! significant: the scheduler dequeues ready tasks FIFO in the order the
//! planner created them.

pub mod hasher;
pub mod planner;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::Value;

pub use hasher::{HashDetails, TaskHasher};
pub use planner::TaskPlanner;

/// `(project, target, configuration?)`, formatted `project:target[:config]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetTriple {
    pub project: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
}

impl TargetTriple {
    pub fn new(
        project: impl Into<String>,
        target: impl Into<String>,
        configuration: Option<String>,
    ) -> Self {
        Self {
            project: project.into(),
            target: target.into(),
            configuration,
        }
    }

    pub fn id(&self) -> String {
        match &self.configuration {
            Some(configuration) => {
                format!("{}:{}:{}", self.project, self.target, configuration)
            }
            None => format!("{}:{}", self.project, self.target),
        }
    }
}

impl fmt::Display for TargetTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// A planned unit of work. Immutable once its hash is filled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub target: TargetTriple,
    pub project_root: Utf8PathBuf,
    /// Options after configuration and override merging, interpolated.
    pub options: serde_json::Map<String, Value>,
    /// Caller-supplied overrides (already folded into `options`); kept
    /// for hashing and event payloads.
    pub overrides: serde_json::Map<String, Value>,
    /// Declared outputs, workspace-relative, interpolated.
    pub outputs: Vec<Utf8PathBuf>,
    pub cache: bool,
    /// The shell command to execute, when the target resolves to one.
    pub command: Option<String>,
    /// Filled by the hasher before the runner accepts the graph.
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_details: Option<HashDetails>,
}

/// The task DAG. `dependencies` maps a task to its prerequisites.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl TaskGraph {
    pub(crate) fn insert(&mut self, task: Task, prerequisites: Vec<String>) {
        self.index.insert(task.id.clone(), self.tasks.len());
        self.dependencies.insert(task.id.clone(), prerequisites);
        self.tasks.push(task);
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub(crate) fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.index.get(id).copied().map(|i| &mut self.tasks[i])
    }

    /// Tasks in planner insertion order (prerequisites always precede
    /// their dependents).
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn prerequisites(&self, id: &str) -> &[String] {
        self.dependencies
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Reverse adjacency: task id -> ids of tasks waiting on it.
    pub fn dependents(&self) -> HashMap<&str, Vec<&str>> {
        let mut map: HashMap<&str, Vec<&str>> = HashMap::new();

        for (id, prerequisites) in &self.dependencies {
            for prerequisite in prerequisites {
                map.entry(prerequisite.as_str())
                    .or_default()
                    .push(id.as_str());
            }
        }

        map
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn triple_id_formats() {
        let plain = TargetTriple::new("app", "build", None);
        assert_eq!(plain.id(), "app:build");

        let configured = TargetTriple::new("app", "build", Some("production".into()));
        assert_eq!(configured.id(), "app:build:production");
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut graph = TaskGraph::default();
        for name in ["c:build", "a:build", "b:build"] {
            let (project, target) = name.split_once(':').unwrap();
            graph.insert(
                Task {
                    id: name.to_string(),
                    target: TargetTriple::new(project, target, None),
                    project_root: Utf8PathBuf::from(format!("libs/{project}")),
                    options: Default::default(),
                    overrides: Default::default(),
                    outputs: Vec::new(),
                    cache: false,
                    command: None,
                    hash: None,
                    hash_details: None,
                },
                Vec::new(),
            );
        }

        let order: Vec<&str> = graph.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(order, vec!["c:build", "a:build", "b:build"]);
    }

    #[test]
    fn dependents_inverts_prerequisites() {
        let mut graph = TaskGraph::default();
        let task = |id: &str| Task {
            id: id.to_string(),
            target: TargetTriple::new(id.split(':').next().unwrap(), "build", None),
            project_root: Utf8PathBuf::new(),
            options: Default::default(),
            overrides: Default::default(),
            outputs: Vec::new(),
            cache: false,
            command: None,
            hash: None,
            hash_details: None,
        };

        graph.insert(task("a:build"), Vec::new());
        graph.insert(task("b:build"), vec!["a:build".to_string()]);

        let dependents = graph.dependents();
        assert_eq!(dependents["a:build"], vec!["b:build"]);
    }
}
