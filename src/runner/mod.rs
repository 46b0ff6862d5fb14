//! Task execution.
//!
//! [`TaskRunner::run`] drives a hashed task graph to completion:
//! `startCommand`, then per-task scheduling through the cooperative
//! scheduler, then `endCommand` once every task is terminal. The caller
//! observes progress through the [`LifecycleBus`] and receives a
//! [`RunSummary`] mapping onto the public exit codes.

pub mod command;
pub mod lifecycle;
mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camino::Utf8Path;

use crate::cache::TaskCache;
use crate::task::TaskGraph;

pub use command::OutputForwarder;
pub use lifecycle::{
    LifecycleBus, LifecycleEvent, RunTotals, TaskResult, TaskResultSummary, TaskStatus,
    TaskSummary,
};

/// Cooperative cancellation flag, shared between the caller (e.g. a
/// signal handler), the scheduler, and running workers.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct RunnerOptions {
    /// Parallelism budget; at least 1.
    pub parallel: usize,
    pub cache_enabled: bool,
    /// Suppress replayed terminal output on cache hits.
    pub hide_cached_output: bool,
    /// The project the user asked for, when the invocation has one.
    pub initiating_project: Option<String>,
    pub cancel: CancellationToken,
    /// Sink for live output of the initiating task in run-one
    /// invocations.
    pub live_output: Option<OutputForwarder>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            parallel: 3,
            cache_enabled: true,
            hide_cached_output: false,
            initiating_project: None,
            cancel: CancellationToken::new(),
            live_output: None,
        }
    }
}

/// Everything the scheduler needs, bundled.
pub(crate) struct RunnerContext<'a> {
    pub workspace_root: &'a Utf8Path,
    pub cache: &'a TaskCache,
    pub bus: &'a LifecycleBus,
    pub options: &'a RunnerOptions,
    /// Task id whose output is forwarded live (run-one only).
    pub initiating_task: Option<String>,
}

#[derive(Debug)]
pub struct RunSummary {
    /// Per-task results, in planner insertion order.
    pub results: Vec<TaskResult>,
    pub canceled: bool,
}

impl RunSummary {
    /// Public exit code contract: 0 all succeeded, 1 any task failed,
    /// 130 interrupted.
    pub fn exit_code(&self) -> i32 {
        if self.canceled {
            return 130;
        }
        if self.results.iter().any(|r| !r.status.is_success()) {
            return 1;
        }
        0
    }

    pub fn totals(&self) -> RunTotals {
        let mut totals = RunTotals::default();
        for result in &self.results {
            match result.status {
                TaskStatus::Success => totals.success += 1,
                TaskStatus::Failure => totals.failed += 1,
                TaskStatus::Skipped => totals.skipped += 1,
                _ => totals.cached += 1,
            }
        }
        totals
    }
}

pub struct TaskRunner<'a> {
    workspace_root: &'a Utf8Path,
    cache: &'a TaskCache,
    bus: &'a LifecycleBus,
}

impl<'a> TaskRunner<'a> {
    pub fn new(workspace_root: &'a Utf8Path, cache: &'a TaskCache, bus: &'a LifecycleBus) -> Self {
        Self {
            workspace_root,
            cache,
            bus,
        }
    }

    pub fn run(&self, tasks: &TaskGraph, options: &RunnerOptions) -> RunSummary {
        let mut project_names: Vec<String> = tasks
            .tasks()
            .iter()
            .map(|task| task.target.project.clone())
            .collect();
        project_names.sort_unstable();
        project_names.dedup();

        // Run-one: the single task belonging to the initiating project.
        let initiating_task = options.initiating_project.as_ref().and_then(|project| {
            let mut initiating = tasks
                .tasks()
                .iter()
                .filter(|task| task.target.project == *project);
            match (initiating.next(), initiating.next()) {
                (Some(task), None) => Some(task.id.clone()),
                _ => None,
            }
        });

        self.bus.publish(LifecycleEvent::StartCommand {
            initiating_project: options.initiating_project.clone(),
            project_names,
            task_ids: tasks.tasks().iter().map(|task| task.id.clone()).collect(),
            args: Vec::new(),
        });

        let ctx = RunnerContext {
            workspace_root: self.workspace_root,
            cache: self.cache,
            bus: self.bus,
            options,
            initiating_task,
        };

        let (results, canceled) = scheduler::execute(tasks, &ctx);
        let summary = RunSummary { results, canceled };

        self.bus.publish(LifecycleEvent::EndCommand {
            totals: summary.totals(),
        });

        summary
    }
}
