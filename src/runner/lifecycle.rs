//! The lifecycle bus.
//!
//! The runner publishes every observable transition as an immutable
//! event value; observers subscribe and receive each event in
//! publication order. Delivery is fan-out over per-observer channels
//! with no backpressure; a slow observer buffers in its own channel, and
//! a dropped observer is pruned on the next publish.
//!
//! Serialized events (for IPC with external renderers) carry a
//! self-describing `kind` discriminator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

/// Terminal state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Success,
    Failure,
    LocalCache,
    RemoteCache,
    LocalCacheKeptExisting,
    Skipped,
}

impl TaskStatus {
    /// Whether dependents may proceed.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            TaskStatus::Success
                | TaskStatus::LocalCache
                | TaskStatus::RemoteCache
                | TaskStatus::LocalCacheKeptExisting
        )
    }

    pub fn is_cache_hit(self) -> bool {
        matches!(
            self,
            TaskStatus::LocalCache | TaskStatus::RemoteCache | TaskStatus::LocalCacheKeptExisting
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::LocalCache => "local-cache",
            TaskStatus::RemoteCache => "remote-cache",
            TaskStatus::LocalCacheKeptExisting => "local-cache-kept-existing",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(text)
    }
}

/// Full result of one task, as collected into the run summary.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub code: i32,
    pub terminal_output: String,
    pub duration: Duration,
}

/// Event payload: a task entering execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Event payload: a task reaching a terminal state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultSummary {
    pub task: String,
    pub status: TaskStatus,
    pub code: i32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    pub success: usize,
    pub failed: usize,
    pub cached: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    StartCommand {
        initiating_project: Option<String>,
        project_names: Vec<String>,
        task_ids: Vec<String>,
        args: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    StartTasks { tasks: Vec<TaskSummary> },
    #[serde(rename_all = "camelCase")]
    PrintTaskTerminalOutput {
        task: String,
        status: TaskStatus,
        terminal_output: String,
    },
    #[serde(rename_all = "camelCase")]
    EndTasks { results: Vec<TaskResultSummary> },
    #[serde(rename_all = "camelCase")]
    EndCommand { totals: RunTotals },
}

/// Fan-out topic for [`LifecycleEvent`]s.
#[derive(Default)]
pub struct LifecycleBus {
    observers: Mutex<Vec<Sender<Arc<LifecycleEvent>>>>,
}

impl LifecycleBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Events published after this call are
    /// delivered in order; the observer reads at its own pace.
    pub fn subscribe(&self) -> Receiver<Arc<LifecycleEvent>> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.observers.lock().unwrap().push(sender);
        receiver
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let event = Arc::new(event);
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|observer| observer.send(Arc::clone(&event)).is_ok());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_fan_out_to_every_observer() {
        let bus = LifecycleBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.publish(LifecycleEvent::EndCommand {
            totals: RunTotals::default(),
        });

        assert!(matches!(
            *first.try_recv().unwrap(),
            LifecycleEvent::EndCommand { .. }
        ));
        assert!(matches!(
            *second.try_recv().unwrap(),
            LifecycleEvent::EndCommand { .. }
        ));
    }

    #[test]
    fn dropped_observers_are_pruned() {
        let bus = LifecycleBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(LifecycleEvent::StartTasks { tasks: Vec::new() });
        bus.publish(LifecycleEvent::EndTasks {
            results: Vec::new(),
        });

        assert_eq!(keep.len(), 2);
        assert_eq!(bus.observers.lock().unwrap().len(), 1);
    }

    #[test]
    fn serialized_events_carry_a_kind_discriminator() {
        let event = LifecycleEvent::EndTasks {
            results: vec![TaskResultSummary {
                task: "a:build".to_string(),
                status: TaskStatus::LocalCacheKeptExisting,
                code: 0,
            }],
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "endTasks");
        assert_eq!(json["results"][0]["status"], "local-cache-kept-existing");
    }

    #[test]
    fn cache_statuses_count_as_success() {
        assert!(TaskStatus::LocalCache.is_success());
        assert!(TaskStatus::RemoteCache.is_success());
        assert!(TaskStatus::LocalCacheKeptExisting.is_success());
        assert!(TaskStatus::Success.is_success());
        assert!(!TaskStatus::Failure.is_success());
        assert!(!TaskStatus::Skipped.is_success());
    }
}
