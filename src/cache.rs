//! The content-addressed task cache.
//!
//! Every cacheable, successful task stores its terminal output and its
//! declared outputs under `<cacheDir>/<hash>/`:
//!
//! ```text
//! <cacheDir>/<hash>/terminal-output.log
//! <cacheDir>/<hash>/outputs/...
//! <cacheDir>/<hash>/outputs.manifest.json
//! <cacheDir>/<hash>/meta.json
//! ```
//!
//! Entries are written to a temp directory and renamed into place, so a
//! partially written entry is never observable. The store is append-only;
//! an existing entry is never rewritten. An optional remote tier is
//! consulted on local misses and mirrored on stores.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::Hash32;
use crate::error::CacheError;

/// Which tier satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Remote,
}

/// How outputs were brought back on a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Outputs were materialized from the cache entry.
    Materialized,
    /// Declared outputs already existed on disk with matching content;
    /// nothing was copied.
    KeptExisting,
}

/// An optional second cache tier (typically shared across machines).
/// Implementations move whole entry directories; the local tier remains
/// the only reader of entry internals.
pub trait RemoteCache: Send + Sync {
    /// Copy the entry for `hash` into `into_dir` if the remote has it.
    fn retrieve(&self, hash: &str, into_dir: &Utf8Path) -> Result<bool, CacheError>;

    /// Mirror a freshly stored local entry.
    fn store(&self, hash: &str, entry_dir: &Utf8Path) -> Result<(), CacheError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheMeta {
    status: String,
    exit_code: i32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputsManifest {
    paths: Vec<Utf8PathBuf>,
    sizes: Vec<u64>,
    hashes: Vec<Hash32>,
}

pub struct TaskCache {
    cache_dir: Utf8PathBuf,
    remote: Option<Box<dyn RemoteCache>>,
}

impl TaskCache {
    pub fn new(cache_dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_owned(),
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Box<dyn RemoteCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    fn entry_dir(&self, hash: &str) -> Utf8PathBuf {
        self.cache_dir.join(hash)
    }

    /// Look the hash up locally, falling through to the remote tier.
    /// A remote hit is copied into the local tier before returning.
    pub fn lookup(&self, hash: &str) -> Result<Option<CacheTier>, CacheError> {
        let entry = self.entry_dir(hash);

        if entry.join("meta.json").exists() {
            return Ok(Some(CacheTier::Local));
        }

        if let Some(remote) = &self.remote {
            fs::create_dir_all(&self.cache_dir)?;
            let staging = tempfile::tempdir_in(self.cache_dir.as_std_path())?;
            let staging_path = Utf8Path::from_path(staging.path())
                .ok_or_else(|| CacheError::Corrupt(hash.to_string()))?;

            if remote.retrieve(hash, staging_path)? {
                match fs::rename(staging.keep(), entry.as_std_path()) {
                    Ok(()) => return Ok(Some(CacheTier::Remote)),
                    // Lost a race against a concurrent store; the entry
                    // exists either way.
                    Err(_) if entry.join("meta.json").exists() => {
                        return Ok(Some(CacheTier::Remote));
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(None)
    }

    pub fn terminal_output(&self, hash: &str) -> Result<String, CacheError> {
        Ok(fs::read_to_string(
            self.entry_dir(hash).join("terminal-output.log"),
        )?)
    }

    pub fn exit_code(&self, hash: &str) -> Result<i32, CacheError> {
        let meta = self.read_meta(hash)?;
        Ok(meta.exit_code)
    }

    /// Bring declared outputs back into the workspace.
    ///
    /// When every manifest path already exists on disk with matching
    /// content, nothing is copied. Otherwise outputs are materialized
    /// from the entry; a restored file disagreeing with the manifest
    /// afterwards means the entry is corrupt and the caller should fall
    /// through to recomputation.
    pub fn restore_outputs(
        &self,
        hash: &str,
        workspace_root: &Utf8Path,
    ) -> Result<RestoreOutcome, CacheError> {
        let entry = self.entry_dir(hash);
        let manifest = self.read_manifest(hash)?;

        let all_present = !manifest.paths.is_empty()
            && manifest.paths.iter().zip(&manifest.hashes).all(|(path, expected)| {
                Hash32::hash_file(workspace_root.join(path).as_std_path())
                    .map(|actual| actual == *expected)
                    .unwrap_or(false)
            });

        if all_present {
            return Ok(RestoreOutcome::KeptExisting);
        }

        for (path, expected) in manifest.paths.iter().zip(&manifest.hashes) {
            let from = entry.join("outputs").join(path);
            let to = workspace_root.join(path);

            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&from, &to)?;

            let actual = Hash32::hash_file(to.as_std_path())?;
            if actual != *expected {
                return Err(CacheError::Corrupt(hash.to_string()));
            }
        }

        Ok(RestoreOutcome::Materialized)
    }

    /// Store a successful task's results. Append-only: an existing entry
    /// wins any race and is left untouched.
    pub fn store(
        &self,
        hash: &str,
        terminal_output: &str,
        exit_code: i32,
        outputs: &[Utf8PathBuf],
        workspace_root: &Utf8Path,
    ) -> Result<(), CacheError> {
        let entry = self.entry_dir(hash);
        if entry.exists() {
            return Ok(());
        }

        fs::create_dir_all(&self.cache_dir)?;
        let staging = tempfile::tempdir_in(self.cache_dir.as_std_path())?;
        let staging_path = Utf8Path::from_path(staging.path())
            .ok_or_else(|| CacheError::Corrupt(hash.to_string()))?;

        fs::write(staging_path.join("terminal-output.log"), terminal_output)?;

        let mut manifest = OutputsManifest::default();
        let outputs_dir = staging_path.join("outputs");
        fs::create_dir_all(&outputs_dir)?;

        for output in outputs {
            let source = workspace_root.join(output);
            if !source.exists() {
                continue;
            }
            collect_output(&source, output, &outputs_dir, &mut manifest)?;
        }

        let manifest_json =
            serde_json::to_vec_pretty(&manifest).map_err(std::io::Error::other)?;
        fs::write(staging_path.join("outputs.manifest.json"), manifest_json)?;

        let meta = CacheMeta {
            status: "success".to_string(),
            exit_code,
            created_at: Utc::now(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta).map_err(std::io::Error::other)?;
        fs::write(staging_path.join("meta.json"), meta_json)?;

        match fs::rename(staging.keep(), entry.as_std_path()) {
            Ok(()) => {}
            // Concurrent store of the same hash; first writer wins.
            Err(_) if entry.exists() => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        if let Some(remote) = &self.remote
            && let Err(err) = remote.store(hash, &entry)
        {
            debug!("remote cache store failed: {err}");
        }

        Ok(())
    }

    fn read_meta(&self, hash: &str) -> Result<CacheMeta, CacheError> {
        let text = fs::read_to_string(self.entry_dir(hash).join("meta.json"))?;
        serde_json::from_str(&text).map_err(|_| CacheError::Corrupt(hash.to_string()))
    }

    fn read_manifest(&self, hash: &str) -> Result<OutputsManifest, CacheError> {
        let text = fs::read_to_string(self.entry_dir(hash).join("outputs.manifest.json"))?;
        serde_json::from_str(&text).map_err(|_| CacheError::Corrupt(hash.to_string()))
    }
}

/// Copy one declared output (file or directory) into the staging
/// `outputs/` tree, recording every file in the manifest.
fn collect_output(
    source: &Utf8Path,
    relative: &Utf8Path,
    outputs_dir: &Utf8Path,
    manifest: &mut OutputsManifest,
) -> Result<(), CacheError> {
    let metadata = fs::metadata(source)?;

    if metadata.is_file() {
        let destination = outputs_dir.join(relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &destination)?;

        manifest.paths.push(relative.to_owned());
        manifest.sizes.push(metadata.len());
        manifest.hashes.push(Hash32::hash_file(source.as_std_path())?);
        return Ok(());
    }

    for child in source.read_dir_utf8()? {
        let child = child?;
        collect_output(
            child.path(),
            &relative.join(child.file_name()),
            outputs_dir,
            manifest,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    fn workspace() -> (tempfile::TempDir, Utf8PathBuf, TaskCache) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let cache = TaskCache::new(root.join(".tsumugi/cache"));
        (tmp, root, cache)
    }

    #[test]
    fn miss_then_hit_round_trip() {
        let (_tmp, root, cache) = workspace();
        fs::create_dir_all(root.join("dist")).unwrap();
        fs::write(root.join("dist/out.js"), "payload").unwrap();

        assert_eq!(cache.lookup("h1").unwrap(), None);

        cache
            .store("h1", "compiled ok\n", 0, &[Utf8PathBuf::from("dist")], &root)
            .unwrap();

        assert_eq!(cache.lookup("h1").unwrap(), Some(CacheTier::Local));
        assert_eq!(cache.terminal_output("h1").unwrap(), "compiled ok\n");
        assert_eq!(cache.exit_code("h1").unwrap(), 0);
    }

    #[test]
    fn outputs_restore_byte_for_byte() {
        let (_tmp, root, cache) = workspace();
        fs::create_dir_all(root.join("dist/nested")).unwrap();
        fs::write(root.join("dist/out.js"), "payload").unwrap();
        fs::write(root.join("dist/nested/deep.js"), "deeper").unwrap();

        cache
            .store("h1", "", 0, &[Utf8PathBuf::from("dist")], &root)
            .unwrap();

        // Wipe the outputs, then restore.
        fs::remove_dir_all(root.join("dist")).unwrap();
        let outcome = cache.restore_outputs("h1", &root).unwrap();

        assert_eq!(outcome, RestoreOutcome::Materialized);
        assert_eq!(fs::read_to_string(root.join("dist/out.js")).unwrap(), "payload");
        assert_eq!(
            fs::read_to_string(root.join("dist/nested/deep.js")).unwrap(),
            "deeper"
        );
    }

    #[test]
    fn matching_outputs_on_disk_are_kept() {
        let (_tmp, root, cache) = workspace();
        fs::create_dir_all(root.join("dist")).unwrap();
        fs::write(root.join("dist/out.js"), "payload").unwrap();

        cache
            .store("h1", "", 0, &[Utf8PathBuf::from("dist")], &root)
            .unwrap();

        let outcome = cache.restore_outputs("h1", &root).unwrap();
        assert_eq!(outcome, RestoreOutcome::KeptExisting);
    }

    #[test]
    fn changed_outputs_on_disk_are_rematerialized() {
        let (_tmp, root, cache) = workspace();
        fs::create_dir_all(root.join("dist")).unwrap();
        fs::write(root.join("dist/out.js"), "payload").unwrap();

        cache
            .store("h1", "", 0, &[Utf8PathBuf::from("dist")], &root)
            .unwrap();

        fs::write(root.join("dist/out.js"), "tampered").unwrap();
        let outcome = cache.restore_outputs("h1", &root).unwrap();

        assert_eq!(outcome, RestoreOutcome::Materialized);
        assert_eq!(fs::read_to_string(root.join("dist/out.js")).unwrap(), "payload");
    }

    #[test]
    fn store_is_append_only() {
        let (_tmp, root, cache) = workspace();

        cache.store("h1", "first\n", 0, &[], &root).unwrap();
        cache.store("h1", "second\n", 0, &[], &root).unwrap();

        assert_eq!(cache.terminal_output("h1").unwrap(), "first\n");
    }

    /// A remote tier backed by a directory, as a stand-in for a shared
    /// cache service.
    struct DirRemote {
        dir: Utf8PathBuf,
        retrievals: Mutex<usize>,
    }

    impl RemoteCache for DirRemote {
        fn retrieve(&self, hash: &str, into_dir: &Utf8Path) -> Result<bool, CacheError> {
            let from = self.dir.join(hash);
            if !from.exists() {
                return Ok(false);
            }
            *self.retrievals.lock().unwrap() += 1;
            copy_tree(&from, into_dir)?;
            Ok(true)
        }

        fn store(&self, hash: &str, entry_dir: &Utf8Path) -> Result<(), CacheError> {
            let to = self.dir.join(hash);
            fs::create_dir_all(&to)?;
            copy_tree(entry_dir, &to)?;
            Ok(())
        }
    }

    fn copy_tree(from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()> {
        fs::create_dir_all(to)?;
        for entry in from.read_dir_utf8()? {
            let entry = entry?;
            let target = to.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                copy_tree(entry.path(), &target)?;
            } else {
                fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }

    #[test]
    fn remote_tier_serves_local_misses_and_mirrors_stores() {
        let remote_tmp = tempfile::tempdir().unwrap();
        let remote_dir = Utf8PathBuf::from_path_buf(remote_tmp.path().to_path_buf()).unwrap();

        // First machine stores; the entry is mirrored.
        let (_tmp1, root1, _) = workspace();
        let cache1 = TaskCache::new(root1.join(".tsumugi/cache")).with_remote(Box::new(
            DirRemote {
                dir: remote_dir.clone(),
                retrievals: Mutex::new(0),
            },
        ));
        cache1.store("h9", "remote payload\n", 0, &[], &root1).unwrap();

        // Second machine has a cold local cache but hits remotely.
        let (_tmp2, root2, _) = workspace();
        let cache2 = TaskCache::new(root2.join(".tsumugi/cache")).with_remote(Box::new(
            DirRemote {
                dir: remote_dir,
                retrievals: Mutex::new(0),
            },
        ));

        assert_eq!(cache2.lookup("h9").unwrap(), Some(CacheTier::Remote));
        assert_eq!(cache2.terminal_output("h9").unwrap(), "remote payload\n");

        // Now local; no second retrieval needed.
        assert_eq!(cache2.lookup("h9").unwrap(), Some(CacheTier::Local));
    }
}
