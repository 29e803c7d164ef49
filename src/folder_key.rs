//! Folder key derivation.
//!
//! A folder key is the case-folded, `/`-separated directory of a media file
//! relative to the longest matching configured root, prefixed with that
//! root's own folder name. `/lib/2023/Trip/a.jpg` under root `/lib/2023`
//! yields `2023/trip`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderKey(String);

impl FolderKey {
    /// Wrap an already-normalized key, e.g. one read back from the store.
    pub fn from_stored(key: impl Into<String>) -> Self {
        FolderKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment of the key, used as the default album title.
    pub fn inferred_title(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for FolderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Split a path into lower-cased components, treating `\` and `/` alike.
fn components(path: &str) -> Vec<String> {
    path.replace('\\', "/")
        .to_lowercase()
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .map(str::to_owned)
        .collect()
}

/// Ordered root set, pre-normalized once per pass.
#[derive(Debug, Clone)]
pub struct RootSet {
    roots: Vec<(PathBuf, Vec<String>)>,
}

impl RootSet {
    pub fn new<P: AsRef<Path>>(roots: &[P]) -> Self {
        let roots = roots
            .iter()
            .map(|root| {
                let root = root.as_ref();
                (root.to_path_buf(), components(&root.to_string_lossy()))
            })
            .collect();
        Self { roots }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.roots.iter().map(|(path, _)| path.as_path())
    }

    /// Index of the root owning `path`: most matching components wins,
    /// earliest registration breaks ties.
    fn matching_root(&self, parts: &[String]) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (idx, (_, root_parts)) in self.roots.iter().enumerate() {
            if root_parts.len() > parts.len() || !parts.starts_with(root_parts) {
                continue;
            }
            match best {
                Some((_, len)) if len >= root_parts.len() => {}
                _ => best = Some((idx, root_parts.len())),
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// True when `path` falls under at least one root.
    pub fn contains(&self, path: &Path) -> bool {
        self.matching_root(&components(&path.to_string_lossy()))
            .is_some()
    }

    /// Compute the folder key of a media file, or `None` when no root matches.
    pub fn folder_key(&self, path: &Path) -> Option<FolderKey> {
        let parts = components(&path.to_string_lossy());
        let idx = self.matching_root(&parts)?;
        let root_parts = &self.roots[idx].1;

        // Directory components below the root; the last component is the file itself.
        let below = &parts[root_parts.len()..];
        if below.is_empty() {
            return None;
        }
        let dirs = &below[..below.len() - 1];

        let mut segments: Vec<&str> = Vec::with_capacity(dirs.len() + 1);
        if let Some(label) = root_parts.last() {
            segments.push(label);
        }
        segments.extend(dirs.iter().map(String::as_str));

        if segments.is_empty() {
            None
        } else {
            Some(FolderKey(segments.join("/")))
        }
    }
}

/// Convenience wrapper over [`RootSet::folder_key`] for one-off lookups.
pub fn folder_key<P: AsRef<Path>>(path: &Path, roots: &[P]) -> Option<FolderKey> {
    RootSet::new(roots).folder_key(path)
}
