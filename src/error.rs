use camino::Utf8PathBuf;
use thiserror::Error;

/// Top-level error type for the orchestrator.
///
/// The variants mirror how errors surface to a caller: configuration and
/// graph errors abort before any task runs (exit code 2), everything else
/// either degrades gracefully or is reported through task results.
#[derive(Debug, Error)]
pub enum TsumugiError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Plugin '{plugin}': {source}")]
    Plugin {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TsumugiError {
    /// Exit code for invocation-level failures. Task failures are not
    /// errors; they are reported through `RunSummary::exit_code`.
    pub fn exit_code(&self) -> i32 {
        match self {
            TsumugiError::Config(_)
            | TsumugiError::Graph(_)
            | TsumugiError::Plugin { .. }
            | TsumugiError::Planner(_) => 2,
            TsumugiError::Io(_) => 1,
        }
    }
}

/// Malformed workspace or project configuration. Surfaced, not retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file '{path}'.\n{source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't parse configuration file '{path}'.\n{source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Project '{0}' does not exist in the workspace")]
    UnknownProject(String),

    #[error("Project '{project}' has no target '{target}'")]
    UnknownTarget { project: String, target: String },

    #[error("Target '{project}:{target}' has no configuration '{configuration}'")]
    UnknownConfiguration {
        project: String,
        target: String,
        configuration: String,
    },

    #[error("Target '{project}:{target}' declares no runnable command")]
    MissingCommand { project: String, target: String },

    #[error("Unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("Plugin '{0}' is registered more than once")]
    DuplicatePlugin(String),

    #[error("Unknown task runner '{0}'")]
    UnknownRunner(String),

    #[error("Nested interpolation in '{0}' is not supported")]
    NestedInterpolation(String),

    #[error("Unknown interpolation token '{{{0}}}'")]
    UnknownInterpolation(String),
}

/// Errors in project graph construction.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("The project graph contains a cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Edge references unknown project '{0}'")]
    UnknownNode(String),
}

/// Errors in task graph planning. All of these abort before any task runs.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("The task graph contains a cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The import scanner could not process a file. Non-fatal: the file is
/// dropped from explicit edge contribution and a warning is emitted.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Unterminated template literal at line {line}")]
    UnterminatedTemplate { line: usize },

    #[error("Unterminated string literal at line {line}")]
    UnterminatedString { line: usize },

    #[error("Unterminated block comment at line {line}")]
    UnterminatedComment { line: usize },
}

/// Cache I/O failed on read or write. Non-fatal: the run proceeds without
/// the affected cache benefit.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O failed.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Cache entry '{0}' is corrupt")]
    Corrupt(String),

    #[error("Remote cache: {0}")]
    Remote(anyhow::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invocation_errors_map_to_exit_code_2() {
        let err = TsumugiError::from(ConfigError::UnknownProject("app".into()));
        assert_eq!(err.exit_code(), 2);

        let err = TsumugiError::from(GraphError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        });
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn cycle_error_names_the_path() {
        let err = GraphError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "The project graph contains a cycle: a -> b -> a"
        );
    }
}
