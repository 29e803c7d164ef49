//! Album reconciliation.
//!
//! Planning is pure: [`plan_reconcile`] reads a [`LibrarySnapshot`] and
//! returns the ordered writes. [`reconcile`] reads, plans and applies inside
//! one transaction, so a failure leaves albums exactly as they were.
//!
//! The plan runs these steps, in order:
//!
//! 1. Each folder album's effective key is the majority folder key of its
//!    linked media under the current roots (ties go to the smallest key).
//! 2. Albums sharing an effective key are merged into one survivor: the
//!    smallest-id album with a customized title, else the smallest id.
//!    Links move to the survivor, appended after its existing positions.
//! 3. Membership of each surviving album is made to equal its candidate.
//! 4. Candidates with no album get one.
//! 5. Surviving albums left empty are deleted.
//! 6. Albums without a cover take the first thumbnail among their media.

use super::builder::build_candidates;
use crate::database::{self, AlbumLink, Database, LibrarySnapshot, MediaRecord};
use crate::folder_key::{FolderKey, RootSet};
use log::{debug, info};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlbumOp {
    SetFolderKey {
        album_id: i64,
        folder_key: String,
    },
    MoveLink {
        from_album: i64,
        to_album: i64,
        media_id: i64,
        position: i64,
    },
    RemoveLink {
        album_id: i64,
        media_id: i64,
    },
    AddLink {
        album_id: i64,
        media_id: i64,
        position: i64,
    },
    SetCover {
        album_id: i64,
        cover_path: String,
    },
    DeleteAlbum {
        album_id: i64,
    },
    CreateAlbum {
        folder_key: String,
        title: String,
        members: Vec<i64>,
        cover_path: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub albums_created: usize,
    /// Albums absorbed into a survivor with the same key.
    pub albums_merged: usize,
    /// Albums deleted because no media belongs to them any more.
    pub albums_deleted: usize,
    pub albums_rekeyed: usize,
    pub links_added: usize,
    pub links_removed: usize,
    pub covers_assigned: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub ops: Vec<AlbumOp>,
    pub stats: ReconcileStats,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Most common key; ties resolve to the lexicographically smallest.
pub fn majority_key<I: IntoIterator<Item = FolderKey>>(keys: I) -> Option<FolderKey> {
    let mut votes: BTreeMap<FolderKey, usize> = BTreeMap::new();
    for key in keys {
        *votes.entry(key).or_default() += 1;
    }
    let mut best: Option<(FolderKey, usize)> = None;
    for (key, count) in votes {
        match &best {
            Some((_, top)) if *top >= count => {}
            _ => best = Some((key, count)),
        }
    }
    best.map(|(key, _)| key)
}

/// True when `title` is what the reconciler would have generated for `key`:
/// the inferred title, optionally followed by a ` (n)` disambiguator.
pub fn is_default_title(title: &str, key: &FolderKey) -> bool {
    let inferred = key.inferred_title();
    if title == inferred {
        return true;
    }
    title
        .strip_prefix(inferred)
        .and_then(|rest| rest.strip_prefix(" ("))
        .and_then(|rest| rest.strip_suffix(')'))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn unique_title(base: &str, used: &mut HashSet<String>) -> String {
    let mut title = base.to_string();
    let mut n = 2;
    while used.contains(&title) {
        title = format!("{} ({})", base, n);
        n += 1;
    }
    used.insert(title.clone());
    title
}

/// First media, in the given order, that has a thumbnail.
fn first_cover(
    media_ids: impl IntoIterator<Item = i64>,
    media: &HashMap<i64, &MediaRecord>,
) -> Option<String> {
    media_ids
        .into_iter()
        .filter_map(|id| media.get(&id))
        .find_map(|record| record.thumb_path.clone())
}

struct WorkingAlbum {
    id: i64,
    title: String,
    cover: Option<String>,
    key: FolderKey,
    /// Ordered by position.
    links: Vec<AlbumLink>,
    next_position: i64,
}

impl WorkingAlbum {
    fn contains(&self, media_id: i64) -> bool {
        self.links.iter().any(|link| link.media_id == media_id)
    }

    /// Append a link after every existing position and return that position.
    fn append(&mut self, media_id: i64) -> i64 {
        let position = self.next_position;
        self.links.push(AlbumLink {
            album_id: self.id,
            media_id,
            position,
        });
        self.next_position += 1;
        position
    }
}

/// Index of the surviving album in an id-ordered group.
fn choose_survivor(group: &[WorkingAlbum]) -> usize {
    group
        .iter()
        .position(|album| !is_default_title(&album.title, &album.key))
        .unwrap_or(0)
}

pub fn plan_reconcile(snapshot: &LibrarySnapshot, roots: &RootSet) -> ReconcilePlan {
    let media: HashMap<i64, &MediaRecord> = snapshot.media.iter().map(|m| (m.id, m)).collect();
    let candidates = build_candidates(&snapshot.media);

    let mut links_by_album: HashMap<i64, Vec<AlbumLink>> = HashMap::new();
    for link in &snapshot.links {
        links_by_album.entry(link.album_id).or_default().push(*link);
    }
    for links in links_by_album.values_mut() {
        links.sort_by_key(|link| (link.position, link.media_id));
    }

    let mut stats = ReconcileStats::default();
    let mut rekeys = Vec::new();
    let mut merges = Vec::new();
    let mut membership = Vec::new();
    let mut creates = Vec::new();
    let mut cleanup = Vec::new();
    let mut covers = Vec::new();

    // Effective keys by majority vote.
    let mut folder_albums: Vec<_> = snapshot
        .albums
        .iter()
        .filter_map(|album| album.folder_key.as_deref().map(|key| (album, key)))
        .collect();
    folder_albums.sort_by_key(|(album, _)| album.id);

    let mut groups: BTreeMap<FolderKey, Vec<WorkingAlbum>> = BTreeMap::new();
    for (album, stored) in folder_albums {
        let links = links_by_album.remove(&album.id).unwrap_or_default();
        let votes = links
            .iter()
            .filter_map(|link| media.get(&link.media_id))
            .filter_map(|record| roots.folder_key(Path::new(&record.path)));
        let key = majority_key(votes).unwrap_or_else(|| FolderKey::from_stored(stored));
        if key.as_str() != stored {
            debug!("Album {} moves from key {} to {}", album.id, stored, key);
            rekeys.push(AlbumOp::SetFolderKey {
                album_id: album.id,
                folder_key: key.as_str().to_string(),
            });
            stats.albums_rekeyed += 1;
        }

        let next_position = links.iter().map(|l| l.position).max().map_or(0, |p| p + 1);
        groups.entry(key.clone()).or_default().push(WorkingAlbum {
            id: album.id,
            title: album.title.clone(),
            cover: album.cover_path.clone(),
            key,
            links,
            next_position,
        });
    }

    // Merge albums that share a key.
    let mut survivors: BTreeMap<FolderKey, WorkingAlbum> = BTreeMap::new();
    for (key, mut group) in groups {
        let mut survivor = group.remove(choose_survivor(&group));
        for absorbed in group {
            for link in &absorbed.links {
                if survivor.contains(link.media_id) {
                    continue;
                }
                let position = survivor.append(link.media_id);
                merges.push(AlbumOp::MoveLink {
                    from_album: absorbed.id,
                    to_album: survivor.id,
                    media_id: link.media_id,
                    position,
                });
            }
            if survivor.cover.is_none() {
                if let Some(cover) = absorbed.cover {
                    merges.push(AlbumOp::SetCover {
                        album_id: survivor.id,
                        cover_path: cover.clone(),
                    });
                    survivor.cover = Some(cover);
                }
            }
            merges.push(AlbumOp::DeleteAlbum {
                album_id: absorbed.id,
            });
            info!(
                "Merging album {} ({}) into album {} ({})",
                absorbed.id, absorbed.title, survivor.id, survivor.title
            );
            stats.albums_merged += 1;
        }
        survivors.insert(key, survivor);
    }

    // Membership follows the candidates exactly.
    for (key, album) in survivors.iter_mut() {
        let wanted: &[i64] = candidates
            .get(key)
            .map(|candidate| candidate.members.as_slice())
            .unwrap_or(&[]);
        let wanted_set: HashSet<i64> = wanted.iter().copied().collect();

        let album_id = album.id;
        album.links.retain(|link| {
            let keep = wanted_set.contains(&link.media_id);
            if !keep {
                membership.push(AlbumOp::RemoveLink {
                    album_id,
                    media_id: link.media_id,
                });
            }
            keep
        });
        for &media_id in wanted {
            if !album.contains(media_id) {
                let position = album.append(media_id);
                membership.push(AlbumOp::AddLink {
                    album_id,
                    media_id,
                    position,
                });
                stats.links_added += 1;
            }
        }
    }
    stats.links_removed = membership
        .iter()
        .filter(|op| matches!(op, AlbumOp::RemoveLink { .. }))
        .count();

    // New albums for keys nobody owns yet.
    let mut used_titles: HashSet<String> =
        snapshot.albums.iter().map(|album| album.title.clone()).collect();
    for (key, candidate) in &candidates {
        if survivors.contains_key(key) {
            continue;
        }
        let title = unique_title(&candidate.title, &mut used_titles);
        let cover_path = first_cover(candidate.members.iter().copied(), &media);
        stats.albums_created += 1;
        stats.links_added += candidate.members.len();
        if cover_path.is_some() {
            stats.covers_assigned += 1;
        }
        creates.push(AlbumOp::CreateAlbum {
            folder_key: key.as_str().to_string(),
            title,
            members: candidate.members.clone(),
            cover_path,
        });
    }

    for album in survivors.values() {
        if album.links.is_empty() {
            cleanup.push(AlbumOp::DeleteAlbum { album_id: album.id });
            stats.albums_deleted += 1;
            continue;
        }
        if album.cover.is_none() {
            if let Some(cover_path) = first_cover(album.links.iter().map(|l| l.media_id), &media) {
                covers.push(AlbumOp::SetCover {
                    album_id: album.id,
                    cover_path,
                });
                stats.covers_assigned += 1;
            }
        }
    }

    let ops = [rekeys, merges, membership, creates, cleanup, covers].concat();
    ReconcilePlan { ops, stats }
}

fn apply_ops(conn: &Connection, ops: &[AlbumOp]) -> rusqlite::Result<()> {
    for op in ops {
        match op {
            AlbumOp::SetFolderKey {
                album_id,
                folder_key,
            } => database::update_album_folder_key(conn, *album_id, folder_key)?,
            AlbumOp::MoveLink {
                from_album,
                to_album,
                media_id,
                position,
            } => database::move_link(
                conn,
                *from_album,
                &AlbumLink {
                    album_id: *to_album,
                    media_id: *media_id,
                    position: *position,
                },
            )?,
            AlbumOp::RemoveLink { album_id, media_id } => {
                database::delete_link(conn, *album_id, *media_id)?
            }
            AlbumOp::AddLink {
                album_id,
                media_id,
                position,
            } => database::insert_link(
                conn,
                &AlbumLink {
                    album_id: *album_id,
                    media_id: *media_id,
                    position: *position,
                },
            )?,
            AlbumOp::SetCover {
                album_id,
                cover_path,
            } => database::update_album_cover(conn, *album_id, Some(cover_path))?,
            AlbumOp::DeleteAlbum { album_id } => database::delete_album(conn, *album_id)?,
            AlbumOp::CreateAlbum {
                folder_key,
                title,
                members,
                cover_path,
            } => {
                let album_id =
                    database::insert_album(conn, title, Some(folder_key), cover_path.as_deref())?;
                for (position, media_id) in members.iter().enumerate() {
                    database::insert_link(
                        conn,
                        &AlbumLink {
                            album_id,
                            media_id: *media_id,
                            position: position as i64,
                        },
                    )?;
                }
                info!("Created album '{}' for folder {}", title, folder_key);
            }
        }
    }
    Ok(())
}

/// Apply a plan computed elsewhere, all or nothing.
pub fn apply_plan(db: &Database, plan: &ReconcilePlan) -> rusqlite::Result<()> {
    if plan.is_empty() {
        return Ok(());
    }
    db.write(|tx| apply_ops(tx, &plan.ops))
}

/// Read, plan and apply in one transaction.
pub fn reconcile(db: &Database, roots: &RootSet) -> rusqlite::Result<ReconcileStats> {
    let stats = db.write(|tx| {
        let snapshot = database::read_snapshot(tx)?;
        let plan = plan_reconcile(&snapshot, roots);
        apply_ops(tx, &plan.ops)?;
        Ok(plan.stats)
    })?;
    if stats != ReconcileStats::default() {
        info!(
            "Albums reconciled: {} created, {} merged, {} deleted, {} rekeyed",
            stats.albums_created, stats.albums_merged, stats.albums_deleted, stats.albums_rekeyed
        );
    }
    Ok(stats)
}
