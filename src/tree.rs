//! A staged view of the workspace file-system.
//!
//! Generators write through a [`VirtualTree`]: reads fall through to
//! disk, writes and deletes stage in memory, and nothing touches the
//! real file-system until [`VirtualTree::commit`]. Commit writes each
//! changed file atomically (temp + rename) and invalidates the persisted
//! project graph, since any committed change may affect it.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::graph::cache::ProjectGraphCache;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    Write(Vec<u8>),
    Delete,
}

pub struct VirtualTree {
    root: Utf8PathBuf,
    changes: BTreeMap<Utf8PathBuf, Change>,
}

impl VirtualTree {
    pub fn new(root: impl AsRef<Utf8Path>) -> Self {
        Self {
            root: root.as_ref().to_owned(),
            changes: BTreeMap::new(),
        }
    }

    /// Staged content if any, otherwise disk content.
    pub fn read(&self, path: impl AsRef<Utf8Path>) -> std::io::Result<Vec<u8>> {
        let path = normalize(path.as_ref());

        match self.changes.get(&path) {
            Some(Change::Write(content)) => Ok(content.clone()),
            Some(Change::Delete) => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("'{path}' was deleted in this tree"),
            )),
            None => fs::read(self.root.join(&path)),
        }
    }

    pub fn read_to_string(&self, path: impl AsRef<Utf8Path>) -> std::io::Result<String> {
        String::from_utf8(self.read(path)?)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    pub fn write(&mut self, path: impl AsRef<Utf8Path>, content: impl Into<Vec<u8>>) {
        self.changes
            .insert(normalize(path.as_ref()), Change::Write(content.into()));
    }

    pub fn delete(&mut self, path: impl AsRef<Utf8Path>) {
        self.changes
            .insert(normalize(path.as_ref()), Change::Delete);
    }

    pub fn exists(&self, path: impl AsRef<Utf8Path>) -> bool {
        let path = normalize(path.as_ref());

        match self.changes.get(&path) {
            Some(Change::Write(_)) => true,
            Some(Change::Delete) => false,
            None => self.root.join(&path).exists(),
        }
    }

    /// Immediate children of a directory, merging disk state with staged
    /// writes and deletes. Sorted, deduplicated.
    pub fn children(&self, dir: impl AsRef<Utf8Path>) -> Vec<Utf8PathBuf> {
        let dir = normalize(dir.as_ref());
        let mut children = BTreeMap::new();

        if let Ok(entries) = self.root.join(&dir).read_dir_utf8() {
            for entry in entries.flatten() {
                children.insert(dir.join(entry.file_name()), true);
            }
        }

        for (path, change) in &self.changes {
            let direct_child = path
                .parent()
                .is_some_and(|parent| normalize(parent) == dir);
            if direct_child {
                children.insert(path.clone(), !matches!(change, Change::Delete));
            }
        }

        children
            .into_iter()
            .filter_map(|(path, keep)| keep.then_some(path))
            .collect()
    }

    /// Whether anything is staged.
    pub fn is_dirty(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Apply every staged change to disk atomically, then invalidate the
    /// persisted project graph. Returns the changed paths.
    pub fn commit(
        &mut self,
        graph_cache: Option<&ProjectGraphCache>,
    ) -> std::io::Result<Vec<Utf8PathBuf>> {
        let changes = std::mem::take(&mut self.changes);
        let mut committed = Vec::with_capacity(changes.len());

        for (path, change) in changes {
            let target = self.root.join(&path);

            match change {
                Change::Write(content) => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let tmp = tempfile::NamedTempFile::new_in(
                        target.parent().unwrap_or(&self.root).as_std_path(),
                    )?;
                    fs::write(tmp.path(), &content)?;
                    tmp.persist(target.as_std_path()).map_err(|err| err.error)?;
                }
                Change::Delete => match fs::remove_file(&target) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                },
            }

            committed.push(path);
        }

        if !committed.is_empty()
            && let Some(cache) = graph_cache
        {
            cache.invalidate()?;
        }

        Ok(committed)
    }
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(
        path.as_str()
            .trim_start_matches("./")
            .trim_end_matches('/'),
    )
}
