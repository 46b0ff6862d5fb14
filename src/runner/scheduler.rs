//! The cooperative task scheduler.
//!
//! A single scheduler loop owns all mutable task state. Ready tasks
//! (prerequisites terminal and successful) are dequeued FIFO in planner
//! insertion order, bounded by the parallelism budget. Cache hits and
//! skips complete synchronously on the scheduler thread; everything else
//! is handed to a worker on the rayon pool, which blocks on the PTY and
//! reports back over a channel. The scheduler never holds a lock while
//! waiting — state is local to the loop, and workers communicate only
//! through the channel.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::{CacheTier, RestoreOutcome};
use crate::runner::command;
use crate::runner::lifecycle::{
    LifecycleEvent, TaskResult, TaskResultSummary, TaskStatus, TaskSummary,
};
use crate::runner::RunnerContext;
use crate::task::{Task, TaskGraph};

/// How long the scheduler waits on the result channel before re-checking
/// for cancellation.
const RESULT_POLL: Duration = Duration::from_millis(50);

/// Scheduler-owned per-task state.
struct Board<'a> {
    tasks: &'a [Task],
    index: HashMap<&'a str, usize>,
    /// Index-based reverse adjacency.
    dependents: Vec<Vec<usize>>,
    /// Prerequisites not yet terminal, per task.
    pending: Vec<usize>,
    /// Ready queue, FIFO in insertion order.
    ready: VecDeque<usize>,
    statuses: Vec<Option<TaskStatus>>,
    results: Vec<Option<TaskResult>>,
    completed: usize,
}

impl<'a> Board<'a> {
    fn new(graph: &'a TaskGraph) -> Self {
        let tasks = graph.tasks();
        let index: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| (task.id.as_str(), i))
            .collect();

        let mut dependents = vec![Vec::new(); tasks.len()];
        let mut pending = vec![0usize; tasks.len()];

        for (i, task) in tasks.iter().enumerate() {
            let prerequisites = graph.prerequisites(&task.id);
            pending[i] = prerequisites.len();
            for prerequisite in prerequisites {
                if let Some(&p) = index.get(prerequisite.as_str()) {
                    dependents[p].push(i);
                }
            }
        }

        let ready = (0..tasks.len()).filter(|&i| pending[i] == 0).collect();

        Self {
            tasks,
            index,
            dependents,
            pending,
            ready,
            statuses: vec![None; tasks.len()],
            results: vec![None; tasks.len()],
            completed: 0,
        }
    }

    fn all_done(&self) -> bool {
        self.completed == self.tasks.len()
    }

    /// Record a terminal state and unlock dependents whose prerequisites
    /// are now all terminal. Newly ready tasks enter the queue in
    /// insertion order.
    fn finish(&mut self, idx: usize, result: TaskResult) {
        debug_assert!(self.statuses[idx].is_none(), "task finished twice");

        self.statuses[idx] = Some(result.status);
        self.results[idx] = Some(result);
        self.completed += 1;

        let mut unlocked: Vec<usize> = Vec::new();
        for &dependent in &self.dependents[idx] {
            self.pending[dependent] -= 1;
            if self.pending[dependent] == 0 {
                unlocked.push(dependent);
            }
        }

        unlocked.sort_unstable();
        self.ready.extend(unlocked);
    }

    /// Whether every prerequisite of `idx` succeeded (cache hits count).
    fn prerequisites_succeeded(&self, idx: usize, graph: &TaskGraph) -> bool {
        graph
            .prerequisites(&self.tasks[idx].id)
            .iter()
            .all(|prerequisite| {
                self.index
                    .get(prerequisite.as_str())
                    .and_then(|&p| self.statuses[p])
                    .is_some_and(TaskStatus::is_success)
            })
    }
}

/// Execute the task graph. Returns per-task results in insertion order
/// and whether the run was canceled.
pub(crate) fn execute(graph: &TaskGraph, ctx: &RunnerContext<'_>) -> (Vec<TaskResult>, bool) {
    let mut board = Board::new(graph);
    let parallel = ctx.options.parallel.max(1);
    let cancel = &ctx.options.cancel;

    rayon::scope(|scope| {
        let (sender, receiver) =
            crossbeam_channel::unbounded::<(usize, std::io::Result<command::CommandOutcome>, Duration)>();
        let mut in_flight = 0usize;

        while !board.all_done() {
            // Dequeue while the budget allows. Cancellation stops all
            // further scheduling.
            while in_flight < parallel && !cancel.is_canceled() {
                let Some(idx) = board.ready.pop_front() else {
                    break;
                };

                if !board.prerequisites_succeeded(idx, graph) {
                    // A failed prerequisite skips the task without it
                    // ever being scheduled; no startTasks is emitted.
                    skip(idx, &mut board, ctx);
                    continue;
                }

                if try_cache_hit(idx, &mut board, ctx) {
                    continue;
                }

                if launch(idx, &mut board, ctx, scope, sender.clone()) {
                    in_flight += 1;
                }
            }

            if board.all_done() {
                break;
            }

            if in_flight == 0 {
                if cancel.is_canceled() {
                    // Nothing is running and nothing more will start:
                    // everything left is skipped.
                    for idx in 0..board.tasks.len() {
                        if board.statuses[idx].is_none() {
                            skip(idx, &mut board, ctx);
                        }
                    }
                    break;
                }
                // Nothing running, nothing ready, not everything done:
                // unreachable for a well-formed DAG. Bail rather than
                // spin; unfinished tasks surface as skipped.
                debug_assert!(false, "scheduler stalled with work remaining");
                break;
            }

            match receiver.recv_timeout(RESULT_POLL) {
                Ok((idx, outcome, duration)) => {
                    in_flight -= 1;
                    complete_execution(idx, outcome, duration, &mut board, ctx);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    let canceled = cancel.is_canceled();
    let results = board
        .results
        .into_iter()
        .enumerate()
        .map(|(idx, result)| {
            result.unwrap_or_else(|| TaskResult {
                task_id: board.tasks[idx].id.clone(),
                status: TaskStatus::Skipped,
                code: 1,
                terminal_output: String::new(),
                duration: Duration::ZERO,
            })
        })
        .collect();

    (results, canceled)
}

/// Terminal `skipped` state: endTasks only, never startTasks.
fn skip(idx: usize, board: &mut Board<'_>, ctx: &RunnerContext<'_>) {
    let task = &board.tasks[idx];

    ctx.bus.publish(LifecycleEvent::EndTasks {
        results: vec![TaskResultSummary {
            task: task.id.clone(),
            status: TaskStatus::Skipped,
            code: 1,
        }],
    });

    board.finish(
        idx,
        TaskResult {
            task_id: task.id.clone(),
            status: TaskStatus::Skipped,
            code: 1,
            terminal_output: String::new(),
            duration: Duration::ZERO,
        },
    );
}

/// Consult the cache; on a hit, replay events synthetically with no
/// subprocess. Returns whether the task completed here.
fn try_cache_hit(idx: usize, board: &mut Board<'_>, ctx: &RunnerContext<'_>) -> bool {
    let task = &board.tasks[idx];

    if !ctx.options.cache_enabled || !task.cache {
        return false;
    }
    let Some(hash) = &task.hash else {
        return false;
    };

    let tier = match ctx.cache.lookup(hash) {
        Ok(Some(tier)) => tier,
        Ok(None) => return false,
        Err(err) => {
            // Cache trouble never fails the run; it just costs the
            // benefit.
            warn!(task = %task.id, "cache lookup failed: {err}");
            return false;
        }
    };

    let restore = match ctx.cache.restore_outputs(hash, ctx.workspace_root) {
        Ok(outcome) => outcome,
        Err(err) => {
            // Restored outputs disagreeing with the manifest (or any
            // restore failure) falls through to recomputation.
            warn!(task = %task.id, "cache restore failed: {err}");
            return false;
        }
    };

    let status = match (tier, restore) {
        (CacheTier::Local, RestoreOutcome::KeptExisting) => TaskStatus::LocalCacheKeptExisting,
        (CacheTier::Local, RestoreOutcome::Materialized) => TaskStatus::LocalCache,
        (CacheTier::Remote, _) => TaskStatus::RemoteCache,
    };

    let terminal_output = ctx.cache.terminal_output(hash).unwrap_or_default();
    let code = ctx.cache.exit_code(hash).unwrap_or(0);

    ctx.bus.publish(LifecycleEvent::StartTasks {
        tasks: vec![TaskSummary {
            id: task.id.clone(),
            hash: task.hash.clone(),
        }],
    });

    if !ctx.options.hide_cached_output {
        ctx.bus.publish(LifecycleEvent::PrintTaskTerminalOutput {
            task: task.id.clone(),
            status,
            terminal_output: terminal_output.clone(),
        });
    }

    ctx.bus.publish(LifecycleEvent::EndTasks {
        results: vec![TaskResultSummary {
            task: task.id.clone(),
            status,
            code,
        }],
    });

    board.finish(
        idx,
        TaskResult {
            task_id: task.id.clone(),
            status,
            code,
            terminal_output,
            duration: Duration::ZERO,
        },
    );

    true
}

/// Hand a task to a worker. The worker blocks on the subprocess and
/// reports the outcome over the channel. Returns whether a worker was
/// actually spawned; a task with no runnable command completes (as a
/// failure) right here.
fn launch<'scope>(
    idx: usize,
    board: &mut Board<'_>,
    ctx: &RunnerContext<'_>,
    scope: &rayon::Scope<'scope>,
    sender: crossbeam_channel::Sender<(usize, std::io::Result<command::CommandOutcome>, Duration)>,
) -> bool {
    let task = &board.tasks[idx];

    ctx.bus.publish(LifecycleEvent::StartTasks {
        tasks: vec![TaskSummary {
            id: task.id.clone(),
            hash: task.hash.clone(),
        }],
    });

    let Some(command_line) = task.command.clone() else {
        // Nothing runnable resolved for this target.
        complete_execution(
            idx,
            Ok(command::CommandOutcome {
                exit_code: 1,
                terminal_output: format!("Target '{}' has no runnable command.\n", task.id),
                canceled: false,
            }),
            Duration::ZERO,
            board,
            ctx,
        );
        return false;
    };

    // Live forwarding applies only to the initiating task of a run-one
    // invocation.
    let forward = if ctx.initiating_task.as_deref() == Some(task.id.as_str()) {
        ctx.options.live_output.clone()
    } else {
        None
    };

    let cwd = ctx.workspace_root.to_owned();
    let cancel = ctx.options.cancel.clone();
    let span = tracing::info_span!("task", id = %task.id);

    scope.spawn(move |_| {
        let _enter = span.enter();
        let started = std::time::Instant::now();
        let outcome = command::run(&command_line, &cwd, forward, &cancel);
        let _ = sender.send((idx, outcome, started.elapsed()));
    });

    true
}

/// Handle a worker's report: status, cache store, events, bookkeeping.
fn complete_execution(
    idx: usize,
    outcome: std::io::Result<command::CommandOutcome>,
    duration: Duration,
    board: &mut Board<'_>,
    ctx: &RunnerContext<'_>,
) {
    let task = &board.tasks[idx];

    let (status, code, terminal_output) = match outcome {
        Ok(outcome) => {
            let status = if outcome.exit_code == 0 {
                TaskStatus::Success
            } else {
                TaskStatus::Failure
            };
            (status, outcome.exit_code, outcome.terminal_output)
        }
        Err(err) => (
            TaskStatus::Failure,
            1,
            format!("Failed to launch command: {err}\n"),
        ),
    };

    if status == TaskStatus::Success
        && ctx.options.cache_enabled
        && task.cache
        && let Some(hash) = &task.hash
        && let Err(err) = ctx.cache.store(
            hash,
            &terminal_output,
            code,
            &task.outputs,
            ctx.workspace_root,
        )
    {
        // A failed store costs the next run a miss, nothing more.
        warn!(task = %task.id, "cache store failed: {err}");
    }

    debug!(task = %task.id, %status, code, "task finished");

    ctx.bus.publish(LifecycleEvent::PrintTaskTerminalOutput {
        task: task.id.clone(),
        status,
        terminal_output: terminal_output.clone(),
    });
    ctx.bus.publish(LifecycleEvent::EndTasks {
        results: vec![TaskResultSummary {
            task: task.id.clone(),
            status,
            code,
        }],
    });

    board.finish(
        idx,
        TaskResult {
            task_id: task.id.clone(),
            status,
            code,
            terminal_output,
            duration,
        },
    );
}
