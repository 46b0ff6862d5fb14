//! Workspace file hashing.
//!
//! The hasher enumerates tracked files once, content-hashes them with
//! BLAKE3 in parallel, and persists the records so later runs can trust
//! unchanged `(mtime, size)` pairs without re-reading file bytes. All
//! aggregate hashes are computed over a canonical sorted serialization,
//! so they are stable across hosts and iteration orders.

use std::collections::BTreeMap;
use std::fs;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};

/// Directories never tracked, independent of ignore files.
const BUILTIN_IGNORES: &[&str] = &[".git", "node_modules", "dist", ".tsumugi"];

/// Name of the persisted hash index, relative to the state directory.
const INDEX_FILE: &str = "file-hashes.json";

/// A single tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the workspace root.
    pub path: Utf8PathBuf,
    pub hash: Hash32,
    pub size: u64,
    /// Seconds since the epoch. Never contributes to any hash.
    pub mtime: u64,
}

/// One ignore rule, compiled from a `.gitignore`-style line.
struct IgnoreRule {
    pattern: Pattern,
    negated: bool,
}

pub struct FileHasher {
    workspace_root: Utf8PathBuf,
    state_dir: Utf8PathBuf,
    rules: Vec<IgnoreRule>,
    index: BTreeMap<Utf8PathBuf, FileRecord>,
    warnings: Vec<String>,
}

impl FileHasher {
    pub fn new(workspace_root: impl AsRef<Utf8Path>, state_dir: impl AsRef<Utf8Path>) -> Self {
        let workspace_root = workspace_root.as_ref().to_owned();
        let rules = load_ignore_rules(&workspace_root);

        Self {
            workspace_root,
            state_dir: state_dir.as_ref().to_owned(),
            rules,
            index: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Enumerate tracked files and bring the index up to date.
    ///
    /// Records whose `(mtime, size)` match the previous run are trusted
    /// as-is; everything else is re-hashed in parallel. Unreadable files
    /// get a sentinel hash and a warning instead of aborting.
    pub fn init(&mut self) -> std::io::Result<()> {
        let previous = self.load_index().unwrap_or_default();
        let mut fresh = BTreeMap::new();
        let mut stale = Vec::new();

        for path in self.enumerate()? {
            let meta = match fs::metadata(self.workspace_root.join(&path)) {
                Ok(meta) => meta,
                Err(err) => {
                    self.warnings
                        .push(format!("Couldn't stat '{path}': {err}"));
                    continue;
                }
            };

            let size = meta.len();
            let mtime = mtime_secs(&meta);

            match previous.get(&path) {
                Some(record) if record.mtime == mtime && record.size == size => {
                    fresh.insert(path, record.clone());
                }
                _ => stale.push((path, size, mtime)),
            }
        }

        let root = self.workspace_root.clone();
        let hashed: Vec<(FileRecord, Option<String>)> = stale
            .into_par_iter()
            .map(|(path, size, mtime)| {
                let (hash, warning) = match Hash32::hash_file(root.join(&path).as_std_path()) {
                    Ok(hash) => (hash, None),
                    Err(err) => (
                        Hash32::default(),
                        Some(format!("Couldn't read '{path}': {err}")),
                    ),
                };

                (FileRecord { path, hash, size, mtime }, warning)
            })
            .collect();

        for (record, warning) in hashed {
            if let Some(warning) = warning {
                self.warnings.push(warning);
            }
            fresh.insert(record.path.clone(), record);
        }

        self.index = fresh;
        self.persist_index()
    }

    /// Re-hash only the supplied change set; everything else keeps its
    /// current record.
    pub fn update(&mut self, changed: &[Utf8PathBuf]) -> std::io::Result<()> {
        for path in changed {
            let absolute = self.workspace_root.join(path);
            match fs::metadata(&absolute) {
                Ok(meta) => {
                    let hash = Hash32::hash_file(absolute.as_std_path()).unwrap_or_default();
                    self.index.insert(
                        path.clone(),
                        FileRecord {
                            path: path.clone(),
                            hash,
                            size: meta.len(),
                            mtime: mtime_secs(&meta),
                        },
                    );
                }
                Err(_) => {
                    self.index.remove(path);
                }
            }
        }

        self.persist_index()
    }

    /// Snapshot of every tracked file, sorted by path.
    pub fn all_file_data(&self) -> impl Iterator<Item = &FileRecord> {
        self.index.values()
    }

    pub fn file(&self, path: &Utf8Path) -> Option<&FileRecord> {
        self.index.get(path)
    }

    /// Aggregate hash over the sorted set of `(path, contentHash)` pairs.
    /// Paths missing from the index are skipped.
    pub fn hash_files<'a>(&self, paths: impl IntoIterator<Item = &'a Utf8Path>) -> Hash32 {
        let mut sorted: Vec<&Utf8Path> = paths.into_iter().collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut hasher = Blake3Hasher::default();
        for path in sorted {
            if let Some(record) = self.index.get(path) {
                hasher.update(record.path.as_str());
                hasher.update(b"\0");
                hasher.update(record.hash.to_hex());
                hasher.update(b"\n");
            }
        }

        hasher.into()
    }

    /// Aggregate hash over every tracked file.
    pub fn aggregate(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        for record in self.index.values() {
            hasher.update(record.path.as_str());
            hasher.update(b"\0");
            hasher.update(record.hash.to_hex());
            hasher.update(b"\n");
        }

        hasher.into()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn enumerate(&self) -> std::io::Result<Vec<Utf8PathBuf>> {
        let mut paths = Vec::new();

        let walker = walkdir::WalkDir::new(self.workspace_root.as_std_path())
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !(entry.file_type().is_dir() && BUILTIN_IGNORES.contains(&name.as_ref()))
            });

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let Some(path) = Utf8Path::from_path(entry.path()) else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(&self.workspace_root) else {
                continue;
            };

            if !self.is_ignored(relative) {
                paths.push(relative.to_owned());
            }
        }

        Ok(paths)
    }

    fn is_ignored(&self, path: &Utf8Path) -> bool {
        let mut ignored = false;
        for rule in &self.rules {
            if rule.pattern.matches(path.as_str()) {
                ignored = !rule.negated;
            }
        }

        ignored
    }

    fn index_path(&self) -> Utf8PathBuf {
        self.state_dir.join(INDEX_FILE)
    }

    fn load_index(&self) -> Option<BTreeMap<Utf8PathBuf, FileRecord>> {
        let data = fs::read_to_string(self.index_path()).ok()?;
        serde_json::from_str(&data).ok()
    }

    fn persist_index(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.state_dir)?;

        let data = serde_json::to_vec(&self.index).map_err(std::io::Error::other)?;
        let tmp = tempfile::NamedTempFile::new_in(self.state_dir.as_std_path())?;
        fs::write(tmp.path(), data)?;
        tmp.persist(self.index_path().as_std_path())
            .map_err(|err| err.error)?;

        Ok(())
    }
}

fn mtime_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Compile `.gitignore` lines plus workspace-level ignores into patterns.
fn load_ignore_rules(workspace_root: &Utf8Path) -> Vec<IgnoreRule> {
    let mut rules = Vec::new();

    for file in [".gitignore", ".tsumugiignore"] {
        let Ok(text) = fs::read_to_string(workspace_root.join(file)) else {
            continue;
        };

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (line, negated) = match line.strip_prefix('!') {
                Some(rest) => (rest, true),
                None => (line, false),
            };

            for glob in gitignore_line_to_globs(line) {
                if let Ok(pattern) = Pattern::new(&glob) {
                    rules.push(IgnoreRule { pattern, negated });
                }
            }
        }
    }

    rules
}

/// Translate one gitignore line into the glob dialect of the `glob` crate.
///
/// A leading `/` anchors to the workspace root; otherwise the pattern may
/// match at any depth. A trailing `/` matches a directory subtree.
fn gitignore_line_to_globs(line: &str) -> Vec<String> {
    let dir_only = line.ends_with('/');
    let line = line.trim_end_matches('/');

    let anchored = match line.strip_prefix('/') {
        Some(rest) => rest.to_string(),
        None if line.contains('/') => line.to_string(),
        None => format!("**/{line}"),
    };

    if dir_only {
        vec![format!("{anchored}/**")]
    } else {
        // A bare name can be either a file or a directory.
        vec![anchored.clone(), format!("{anchored}/**")]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
    }

    fn hasher_in(dir: &std::path::Path) -> FileHasher {
        let root = utf8(dir);
        let state = root.join(".tsumugi");
        FileHasher::new(&root, &state)
    }

    #[test]
    fn hashes_are_stable_across_inits() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.ts"), "export const a = 1;").unwrap();

        let mut first = hasher_in(tmp.path());
        first.init().unwrap();
        let aggregate = first.aggregate();

        let mut second = hasher_in(tmp.path());
        second.init().unwrap();
        assert_eq!(second.aggregate(), aggregate);
    }

    #[test]
    fn changed_content_changes_the_aggregate() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.ts"), "export const a = 1;").unwrap();

        let mut hasher = hasher_in(tmp.path());
        hasher.init().unwrap();
        let before = hasher.aggregate();

        fs::write(tmp.path().join("a.ts"), "export const a = 2;").unwrap();
        hasher.update(&[Utf8PathBuf::from("a.ts")]).unwrap();
        assert_ne!(hasher.aggregate(), before);
    }

    #[test]
    fn aggregate_ignores_iteration_order() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.ts"), "a").unwrap();
        fs::write(tmp.path().join("b.ts"), "b").unwrap();

        let mut hasher = hasher_in(tmp.path());
        hasher.init().unwrap();

        let forward = [Utf8Path::new("a.ts"), Utf8Path::new("b.ts")];
        let backward = [Utf8Path::new("b.ts"), Utf8Path::new("a.ts")];
        assert_eq!(hasher.hash_files(forward), hasher.hash_files(backward));
    }

    #[test]
    fn builtin_directories_are_not_tracked() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("node_modules/pkg")).unwrap();
        fs::write(tmp.path().join("node_modules/pkg/index.js"), "x").unwrap();
        fs::write(tmp.path().join("kept.ts"), "x").unwrap();

        let mut hasher = hasher_in(tmp.path());
        hasher.init().unwrap();

        let paths: Vec<_> = hasher.all_file_data().map(|r| r.path.clone()).collect();
        assert_eq!(paths, vec![Utf8PathBuf::from("kept.ts")]);
    }

    #[test]
    fn gitignore_patterns_apply() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(".gitignore"), "*.log\nbuild/\n!keep.log\n").unwrap();
        fs::create_dir_all(tmp.path().join("build")).unwrap();
        fs::write(tmp.path().join("build/out.js"), "x").unwrap();
        fs::write(tmp.path().join("debug.log"), "x").unwrap();
        fs::write(tmp.path().join("keep.log"), "x").unwrap();
        fs::write(tmp.path().join("src.ts"), "x").unwrap();

        let mut hasher = hasher_in(tmp.path());
        hasher.init().unwrap();

        let paths: Vec<_> = hasher
            .all_file_data()
            .map(|r| r.path.as_str().to_owned())
            .collect();
        assert!(paths.contains(&"src.ts".to_string()));
        assert!(paths.contains(&"keep.log".to_string()));
        assert!(!paths.contains(&"debug.log".to_string()));
        assert!(!paths.contains(&"build/out.js".to_string()));
    }

    #[test]
    fn unchanged_mtime_and_size_trusts_old_record() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.ts"), "const a = 1;").unwrap();

        let mut first = hasher_in(tmp.path());
        first.init().unwrap();
        let recorded = first.file(Utf8Path::new("a.ts")).unwrap().clone();

        // A second hasher instance must pick the record up from disk.
        let mut second = hasher_in(tmp.path());
        second.init().unwrap();
        assert_eq!(second.file(Utf8Path::new("a.ts")), Some(&recorded));
    }
}
