//! Persistence of the project graph between invocations.
//!
//! The graph is stored as a single JSON document keyed by the aggregate
//! hash of everything that feeds graph construction (workspace
//! configuration, plugin list, lockfile, source files). A load only
//! succeeds when the stored hash matches the current one; anything else
//! falls back to a rebuild. Writes go through a temp file and rename, so
//! readers never observe a half-written graph.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::Hash32;
use crate::graph::ProjectGraph;

const GRAPH_FILE: &str = "graph.json";

#[derive(Serialize, Deserialize)]
struct GraphEnvelope {
    version: String,
    hash: Hash32,
    #[serde(flatten)]
    graph: ProjectGraph,
}

pub struct ProjectGraphCache {
    path: Utf8PathBuf,
}

impl ProjectGraphCache {
    pub fn new(state_dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(GRAPH_FILE),
        }
    }

    /// The persisted graph, if its input hash matches `expected`.
    pub fn load(&self, expected: Hash32) -> Option<ProjectGraph> {
        let text = fs::read_to_string(&self.path).ok()?;
        let envelope: GraphEnvelope = serde_json::from_str(&text).ok()?;

        if envelope.version != env!("CARGO_PKG_VERSION") {
            debug!("graph cache version mismatch, rebuilding");
            return None;
        }
        if envelope.hash != expected {
            debug!("graph cache stale, rebuilding");
            return None;
        }

        Some(envelope.graph)
    }

    pub fn store(&self, hash: Hash32, graph: &ProjectGraph) -> std::io::Result<()> {
        let envelope = GraphEnvelope {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hash,
            graph: graph.clone(),
        };

        let Some(dir) = self.path.parent() else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;

        let data = serde_json::to_vec(&envelope).map_err(std::io::Error::other)?;
        let tmp = tempfile::NamedTempFile::new_in(dir.as_std_path())?;
        fs::write(tmp.path(), data)?;
        tmp.persist(self.path.as_std_path()).map_err(|err| err.error)?;

        Ok(())
    }

    /// Drop the persisted graph; the next invocation rebuilds.
    pub fn invalidate(&self) -> std::io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
