//! Directory scanning for media discovery.
//!
//! [`Scanner`] is a lazy iterator over every recognized media file below a
//! set of roots. Each pass builds a fresh scanner; nothing is retained
//! between passes.

use crate::formats::MediaKind;
use log::{debug, warn};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use walkdir::WalkDir;

/// A media file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEntry {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub size: u64,
    /// Modification time, unix seconds.
    pub mtime: i64,
}

/// A non-fatal problem met while scanning.
#[derive(Debug, Clone)]
pub struct ScanWarning {
    pub path: Option<PathBuf>,
    pub message: String,
}

pub struct Scanner {
    roots: VecDeque<PathBuf>,
    current: Option<walkdir::IntoIter>,
    visited_dirs: HashSet<PathBuf>,
    seen_files: HashSet<PathBuf>,
    warnings: Vec<ScanWarning>,
    unreadable: Vec<PathBuf>,
}

impl Scanner {
    pub fn new<P: AsRef<Path>>(roots: &[P]) -> Self {
        Self {
            roots: roots.iter().map(|r| r.as_ref().to_path_buf()).collect(),
            current: None,
            visited_dirs: HashSet::new(),
            seen_files: HashSet::new(),
            warnings: Vec::new(),
            unreadable: Vec::new(),
        }
    }

    pub fn warnings(&self) -> &[ScanWarning] {
        &self.warnings
    }

    /// Paths that could not be read this pass. Stored media under these
    /// prefixes must not be treated as deleted.
    pub fn unreadable(&self) -> &[PathBuf] {
        &self.unreadable
    }

    /// True when `path` sits at or below a path that could not be read.
    pub fn is_unreadable(&self, path: &Path) -> bool {
        self.unreadable.iter().any(|prefix| path.starts_with(prefix))
    }

    /// Drain the remaining entries, keeping warnings available afterwards.
    pub fn collect_all(&mut self) -> Vec<ScannedEntry> {
        self.by_ref().collect()
    }

    fn open_next_root(&mut self) -> Option<()> {
        loop {
            let root = self.roots.pop_front()?;
            if root.is_dir() {
                debug!("Scanning root {:?}", root);
                self.current = Some(
                    WalkDir::new(&root)
                        .follow_links(true)
                        .sort_by_file_name()
                        .into_iter(),
                );
                return Some(());
            }
            warn!("Root folder missing or not a directory: {:?}", root);
            self.warnings.push(ScanWarning {
                path: Some(root.clone()),
                message: "root folder missing or not a directory".to_string(),
            });
            self.unreadable.push(root);
        }
    }
}

impl Iterator for Scanner {
    type Item = ScannedEntry;

    fn next(&mut self) -> Option<ScannedEntry> {
        loop {
            let walker = match self.current.as_mut() {
                Some(walker) => walker,
                None => {
                    self.open_next_root()?;
                    continue;
                }
            };

            let entry = match walker.next() {
                None => {
                    self.current = None;
                    continue;
                }
                Some(Err(err)) => {
                    let path = err.path().map(Path::to_path_buf);
                    if let Some(ancestor) = err.loop_ancestor() {
                        debug!("Skipping symlink cycle back to {:?}", ancestor);
                        continue;
                    }
                    warn!("Skipping unreadable entry {:?}: {}", path, err);
                    if let Some(p) = &path {
                        self.unreadable.push(p.clone());
                    }
                    self.warnings.push(ScanWarning {
                        path,
                        message: err.to_string(),
                    });
                    continue;
                }
                Some(Ok(entry)) => entry,
            };

            if entry.file_type().is_dir() {
                match entry.path().canonicalize() {
                    Ok(identity) => {
                        if !self.visited_dirs.insert(identity) {
                            debug!("Directory already visited: {:?}", entry.path());
                            walker.skip_current_dir();
                        }
                    }
                    Err(err) => {
                        warn!("Cannot resolve directory {:?}: {}", entry.path(), err);
                        walker.skip_current_dir();
                        self.unreadable.push(entry.path().to_path_buf());
                        self.warnings.push(ScanWarning {
                            path: Some(entry.path().to_path_buf()),
                            message: err.to_string(),
                        });
                    }
                }
                continue;
            }

            if !entry.file_type().is_file() {
                continue;
            }
            let Some(kind) = MediaKind::from_path(entry.path()) else {
                continue;
            };

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    warn!("Skipping {:?}: {}", entry.path(), err);
                    self.unreadable.push(entry.path().to_path_buf());
                    self.warnings.push(ScanWarning {
                        path: Some(entry.path().to_path_buf()),
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            // The same file can be reached twice through symlinks or overlapping roots.
            let identity = entry
                .path()
                .canonicalize()
                .unwrap_or_else(|_| entry.path().to_path_buf());
            if !self.seen_files.insert(identity) {
                continue;
            }

            let mtime = metadata
                .modified()
                .map(|t| OffsetDateTime::from(t).unix_timestamp())
                .unwrap_or(0);

            return Some(ScannedEntry {
                path: entry.into_path(),
                kind,
                size: metadata.len(),
                mtime,
            });
        }
    }
}
