//! Interned absolute paths.
//!
//! Paths are stored as a tree of components so that "is this file under
//! that directory" is a walk up parent links rather than string matching.
//! Canonicalization is purely lexical and never touches the disk.

use crate::densemap::{dense_id, DenseMap};
use rustc_hash::FxHashMap;

dense_id!(
    /// Handle to an interned path.
    PathId
);

struct PathEntry {
    parent: Option<PathId>,
    name: Box<str>,
}

#[derive(Default)]
pub struct PathTable {
    entries: DenseMap<PathId, PathEntry>,
    children: FxHashMap<(Option<PathId>, Box<str>), PathId>,
}

/// Splits a path into canonical components, dropping "." and empty
/// components and resolving ".." lexically.  ".." at the root is dropped.
fn components(path: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    parts
}

impl PathTable {
    pub fn new() -> Self {
        PathTable::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Interns `path`, creating entries for each of its ancestors.
    /// Panics on the empty/root path, which no artifact can live at.
    pub fn add(&mut self, path: &str) -> PathId {
        let parts = components(path);
        assert!(!parts.is_empty(), "cannot intern root path {:?}", path);
        let mut parent = None;
        for part in parts {
            let key = (parent, Box::<str>::from(part));
            let id = match self.children.get(&key) {
                Some(&id) => id,
                None => {
                    let id = self.entries.push(PathEntry {
                        parent,
                        name: key.1.clone(),
                    });
                    self.children.insert(key, id);
                    id
                }
            };
            parent = Some(id);
        }
        // parts was non-empty, so the loop ran at least once.
        parent.unwrap_or_else(|| unreachable!())
    }

    /// Looks up an already-interned path.
    pub fn get(&self, path: &str) -> Option<PathId> {
        let mut parent = None;
        for part in components(path) {
            parent = Some(*self.children.get(&(parent, Box::<str>::from(part)))?);
        }
        parent
    }

    pub fn parent(&self, id: PathId) -> Option<PathId> {
        self.entries[id].parent
    }

    pub fn name(&self, id: PathId) -> &str {
        &self.entries[id].name
    }

    /// `id` and then each of its parents, up to the root component.
    pub fn ancestors(&self, id: PathId) -> impl Iterator<Item = PathId> + '_ {
        std::iter::successors(Some(id), move |&id| self.parent(id))
    }

    /// True if `path` equals `dir` or lies somewhere beneath it.
    pub fn is_within(&self, path: PathId, dir: PathId) -> bool {
        self.ancestors(path).any(|a| a == dir)
    }

    /// True if `path` lies beneath any of `dirs`.
    pub fn is_within_any(&self, path: PathId, dirs: &[PathId]) -> bool {
        self.ancestors(path).any(|a| dirs.contains(&a))
    }

    /// Renders the full path string.
    pub fn expand(&self, id: PathId) -> String {
        let mut names: Vec<&str> = self.ancestors(id).map(|a| self.name(a)).collect();
        names.reverse();
        let mut out = String::new();
        for name in names {
            out.push('/');
            out.push_str(name);
        }
        out
    }
}
