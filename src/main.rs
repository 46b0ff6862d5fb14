use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;

use tsumugi::{RunSummary, RunnerOptions, TaskStatus, TsumugiError, Workspace};

#[derive(Parser)]
#[command(name = "tsumugi", version, about = "Monorepo task orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show debug-level diagnostics.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one target: `tsumugi run my-app:build[:production]`
    Run {
        /// Task to run, as `project:target[:configuration]`
        task: String,

        /// Maximum number of tasks running at once
        #[arg(long)]
        parallel: Option<usize>,

        /// Skip reading and writing the task cache
        #[arg(long)]
        no_cache: bool,

        /// Replay nothing for cache hits
        #[arg(long)]
        hide_cached_output: bool,
    },

    /// Run a target across many projects
    RunMany {
        /// Target name to run
        #[arg(long)]
        target: String,

        /// Projects to include (default: every project with the target)
        #[arg(long, value_delimiter = ',')]
        projects: Vec<String>,

        /// Named configuration to use
        #[arg(long)]
        configuration: Option<String>,

        /// Maximum number of tasks running at once
        #[arg(long)]
        parallel: Option<usize>,

        /// Skip reading and writing the task cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Build the project graph and print (or save) it as JSON
    Graph {
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<Utf8PathBuf>,
    },

    /// Sync root tsconfig project references with the workspace
    Sync,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| {
                if cli.verbose {
                    tracing_subscriber::EnvFilter::new("tsumugi=debug")
                } else {
                    tracing_subscriber::EnvFilter::new("tsumugi=warn")
                }
            },
        ))
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err}", style("error:").red().bold());
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode, TsumugiError> {
    let root = Utf8PathBuf::from(".");
    let mut workspace = Workspace::open(&root)?;

    match cli.command {
        Commands::Run {
            task,
            parallel,
            no_cache,
            hide_cached_output,
        } => {
            let (project, target, configuration) = parse_task_id(&task);
            let runner = workspace.config().runner(None)?;
            let graph = workspace.project_graph()?;
            let tasks = workspace.plan(&graph, &[(project, target, configuration)])?;

            let mut options = runner_options(parallel.or(runner.options.parallel), no_cache);
            options.hide_cached_output = hide_cached_output;
            options.initiating_project = Some(project.to_string());
            options.live_output = Some(Arc::new(|chunk: &str| {
                use std::io::Write;
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(chunk.as_bytes());
                let _ = stdout.flush();
            }));

            let summary = workspace.run(&tasks, options);
            report(&workspace, &summary);
            Ok(ExitCode::from(summary.exit_code() as u8))
        }

        Commands::RunMany {
            target,
            projects,
            configuration,
            parallel,
            no_cache,
        } => {
            let runner = workspace.config().runner(None)?;
            let graph = workspace.project_graph()?;

            let initiating: Vec<(&str, &str, Option<&str>)> = graph
                .nodes
                .values()
                .filter(|node| node.targets.contains_key(&target))
                .filter(|node| projects.is_empty() || projects.contains(&node.name))
                .map(|node| (node.name.as_str(), target.as_str(), configuration.as_deref()))
                .collect();

            let tasks = workspace.plan(&graph, &initiating)?;
            let summary = workspace.run(
                &tasks,
                runner_options(parallel.or(runner.options.parallel), no_cache),
            );
            report(&workspace, &summary);
            Ok(ExitCode::from(summary.exit_code() as u8))
        }

        Commands::Graph { output } => {
            let graph = workspace.project_graph()?;
            let json =
                serde_json::to_string_pretty(&graph).map_err(std::io::Error::other)?;

            match output {
                Some(path) => std::fs::write(path, json)?,
                None => println!("{json}"),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Sync => {
            let graph = workspace.project_graph()?;
            if workspace.sync_project_references(&graph)? {
                eprintln!("Updated root tsconfig.json project references.");
            } else {
                eprintln!("Root tsconfig.json project references are up to date.");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn parse_task_id(task: &str) -> (&str, &str, Option<&str>) {
    let mut parts = task.splitn(3, ':');
    let project = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or("build");
    (project, target, parts.next())
}

fn runner_options(parallel: Option<usize>, no_cache: bool) -> RunnerOptions {
    let options = RunnerOptions {
        cache_enabled: !no_cache,
        ..RunnerOptions::default()
    };
    let options = match parallel {
        Some(parallel) => RunnerOptions {
            parallel: parallel.max(1),
            ..options
        },
        None => options,
    };

    // Ctrl-C cancels cooperatively: stop scheduling, terminate children.
    let cancel = options.cancel.clone();
    let _ = ctrlc::set_handler(move || cancel.cancel());

    options
}

/// Human summary after a run: failed task output, per-status counts,
/// cancellation notice.
fn report(workspace: &Workspace, summary: &RunSummary) {
    for warning in workspace.warnings() {
        match &warning.file {
            Some(file) => eprintln!(
                "{} {}: {}",
                style("warning:").yellow(),
                file,
                warning.message
            ),
            None => eprintln!("{} {}", style("warning:").yellow(), warning.message),
        }
    }

    let failed: Vec<_> = summary
        .results
        .iter()
        .filter(|result| result.status == TaskStatus::Failure)
        .collect();

    for result in &failed {
        eprintln!();
        eprintln!(
            "{} {}",
            style(">").red().bold(),
            style(&result.task_id).bold()
        );
        eprint!("{}", result.terminal_output);
    }

    let totals = summary.totals();
    eprintln!();

    if summary.canceled {
        let in_progress: Vec<&str> = failed.iter().map(|r| r.task_id.as_str()).collect();
        eprintln!(
            "{} run cancelled; {} succeeded, {} cancelled, {} skipped",
            style("✕").red(),
            totals.success + totals.cached,
            in_progress.len(),
            totals.skipped
        );
        for task in in_progress {
            eprintln!("  {} {task}", style("cancelled").red());
        }
        return;
    }

    if failed.is_empty() {
        eprintln!(
            "{} {} succeeded ({} from cache)",
            style("✓").green(),
            totals.success + totals.cached,
            totals.cached
        );
    } else {
        eprintln!(
            "{} {} failed, {} skipped, {} succeeded ({} from cache)",
            style("✕").red(),
            totals.failed,
            totals.skipped,
            totals.success + totals.cached,
            totals.cached
        );
        for result in &failed {
            eprintln!("  {} {}", style("failed").red(), result.task_id);
        }
        eprintln!("Re-run with {} for more detail.", style("--verbose").bold());
    }
}
