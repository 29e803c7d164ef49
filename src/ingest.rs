//! Reconcile scanned files against stored media records.
//!
//! New files are inserted, changed files are refreshed, and records whose
//! file is gone are deleted. Writes are committed in batches, and thumbnail
//! jobs are handed to the sink only after the batch that needs them commits.

use crate::database::{self, Database, MediaRecord, NewMedia};
use crate::folder_key::{FolderKey, RootSet};
use crate::formats::MediaKind;
use crate::scanner::{ScannedEntry, Scanner};
use crate::thumbnails::ThumbnailSink;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub added: usize,
    /// Split of `added` by kind.
    pub added_images: usize,
    pub added_videos: usize,
    pub updated: usize,
    /// Unchanged files whose folder key moved, e.g. after a root change.
    pub rekeyed: usize,
    pub removed: usize,
    /// Missing from the scan but kept because their folder could not be read.
    pub retained: usize,
    pub thumbnails_queued: usize,
    pub cancelled: bool,
}

enum Change {
    Insert(ScannedEntry, Option<FolderKey>),
    Update(i64, ScannedEntry, Option<FolderKey>),
    Rekey(i64, Option<FolderKey>),
}

fn classify(
    entry: ScannedEntry,
    key: Option<FolderKey>,
    existing: Option<&MediaRecord>,
) -> Option<Change> {
    let Some(record) = existing else {
        return Some(Change::Insert(entry, key));
    };
    if record.mtime != entry.mtime || record.size != entry.size as i64 {
        return Some(Change::Update(record.id, entry, key));
    }
    if record.folder_key.as_deref() != key.as_ref().map(FolderKey::as_str) {
        return Some(Change::Rekey(record.id, key));
    }
    None
}

struct Ingestor<'a> {
    db: &'a Database,
    sink: &'a dyn ThumbnailSink,
    queued: HashSet<i64>,
    summary: IngestSummary,
}

impl Ingestor<'_> {
    fn commit(&mut self, batch: &mut Vec<Change>) -> rusqlite::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let changes = std::mem::take(batch);
        let (jobs, added, updated, rekeyed) = self.db.write(|tx| {
            let mut jobs = Vec::new();
            let mut added = Vec::new();
            let (mut updated, mut rekeyed) = (0, 0);
            for change in &changes {
                match change {
                    Change::Insert(entry, key) => {
                        let path = entry.path.to_string_lossy();
                        let id = database::insert_media(
                            tx,
                            &NewMedia {
                                path: &path,
                                kind: entry.kind,
                                mtime: entry.mtime,
                                size: entry.size as i64,
                                folder_key: key.as_ref().map(FolderKey::as_str),
                            },
                        )?;
                        jobs.push(id);
                        added.push(entry.kind);
                    }
                    Change::Update(id, entry, key) => {
                        database::update_media_file(
                            tx,
                            *id,
                            entry.kind,
                            entry.mtime,
                            entry.size as i64,
                            key.as_ref().map(FolderKey::as_str),
                        )?;
                        jobs.push(*id);
                        updated += 1;
                    }
                    Change::Rekey(id, key) => {
                        database::update_media_folder_key(tx, *id, key.as_ref().map(FolderKey::as_str))?;
                        rekeyed += 1;
                    }
                }
            }
            Ok((jobs, added, updated, rekeyed))
        })?;

        self.summary.added += added.len();
        for kind in added {
            match kind {
                MediaKind::Image => self.summary.added_images += 1,
                MediaKind::Video => self.summary.added_videos += 1,
            }
        }
        self.summary.updated += updated;
        self.summary.rekeyed += rekeyed;
        for id in jobs {
            self.queue(id);
        }
        Ok(())
    }

    fn queue(&mut self, media_id: i64) {
        if self.queued.insert(media_id) {
            self.sink.enqueue(media_id);
            self.summary.thumbnails_queued += 1;
        }
    }

    /// Delete records whose file was not seen, unless it sits somewhere the scan could not read.
    ///
    /// Kept records still follow root changes so their folder key matches the
    /// one album reconciliation derives from their path.
    fn sweep(
        &mut self,
        existing: &HashMap<String, MediaRecord>,
        observed: &HashSet<String>,
        scanner: &Scanner,
        roots: &RootSet,
    ) -> rusqlite::Result<()> {
        let mut doomed = Vec::new();
        let mut rekeys = Vec::new();
        for (path, record) in existing {
            if observed.contains(path) {
                continue;
            }
            let p = Path::new(path);
            if roots.contains(p) && scanner.is_unreadable(p) {
                debug!("Keeping {} because its folder could not be read", path);
                self.summary.retained += 1;
                let key = roots.folder_key(p);
                if record.folder_key.as_deref() != key.as_ref().map(FolderKey::as_str) {
                    rekeys.push((record.id, key));
                }
                continue;
            }
            doomed.push(record.id);
        }
        if doomed.is_empty() && rekeys.is_empty() {
            return Ok(());
        }
        doomed.sort_unstable();
        rekeys.sort_unstable_by_key(|(id, _)| *id);

        let thumbs = self.db.write(|tx| {
            for (id, key) in &rekeys {
                database::update_media_folder_key(tx, *id, key.as_ref().map(FolderKey::as_str))?;
            }
            let mut thumbs = Vec::new();
            for id in &doomed {
                if let Some(thumb) = database::delete_media(tx, *id)? {
                    thumbs.push(thumb);
                }
            }
            Ok(thumbs)
        })?;
        self.summary.rekeyed += rekeys.len();
        self.summary.removed += doomed.len();

        for thumb in thumbs {
            if let Err(e) = std::fs::remove_file(&thumb) {
                debug!("Could not remove thumbnail {}: {}", thumb, e);
            }
        }
        Ok(())
    }
}

/// Bring stored media in line with what `scanner` finds on disk.
///
/// Each batch of `batch_size` changes is its own transaction. A cancelled
/// ingest keeps the batches already committed and skips the deletion sweep;
/// a store error does the same, rolling back only the batch that failed.
pub fn ingest(
    db: &Database,
    scanner: &mut Scanner,
    roots: &RootSet,
    batch_size: usize,
    sink: &dyn ThumbnailSink,
    cancel: &CancellationToken,
) -> rusqlite::Result<IngestSummary> {
    let batch_size = batch_size.max(1);
    let existing: HashMap<String, MediaRecord> = db
        .all_media()?
        .into_iter()
        .map(|record| (record.path.clone(), record))
        .collect();
    let mut observed: HashSet<String> = HashSet::with_capacity(existing.len());

    let mut ingestor = Ingestor {
        db,
        sink,
        queued: HashSet::new(),
        summary: IngestSummary::default(),
    };
    let mut batch: Vec<Change> = Vec::with_capacity(batch_size);

    for entry in scanner.by_ref() {
        let path = entry.path.to_string_lossy().into_owned();
        let key = roots.folder_key(&entry.path);
        let change = classify(entry, key, existing.get(&path));
        observed.insert(path);

        if let Some(change) = change {
            batch.push(change);
        }
        if batch.len() >= batch_size {
            if cancel.is_cancelled() {
                info!("Ingest cancelled, discarding {} uncommitted change(s)", batch.len());
                ingestor.summary.cancelled = true;
                return Ok(ingestor.summary);
            }
            ingestor.commit(&mut batch)?;
        }
    }

    if cancel.is_cancelled() {
        info!("Ingest cancelled before the final batch");
        ingestor.summary.cancelled = true;
        return Ok(ingestor.summary);
    }
    ingestor.commit(&mut batch)?;
    ingestor.sweep(&existing, &observed, scanner, roots)?;

    // Jobs lost to a crash or shutdown in an earlier run.
    for id in db.pending_thumbnail_ids()? {
        ingestor.queue(id);
    }

    let summary = ingestor.summary;
    if summary.retained > 0 {
        warn!(
            "{} media record(s) kept because their folders could not be read",
            summary.retained
        );
    }
    info!(
        "Ingest finished: {} added, {} updated, {} rekeyed, {} removed",
        summary.added, summary.updated, summary.rekeyed, summary.removed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ThumbStatus;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<i64>>);

    impl ThumbnailSink for RecordingSink {
        fn enqueue(&self, media_id: i64) {
            self.0.lock().unwrap().push(media_id);
        }
    }

    impl RecordingSink {
        fn take(&self) -> Vec<i64> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn touch(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    fn run(db: &Database, roots: &[PathBuf], sink: &RecordingSink, batch: usize) -> IngestSummary {
        let mut scanner = Scanner::new(roots);
        ingest(
            db,
            &mut scanner,
            &RootSet::new(roots),
            batch,
            sink,
            &CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_first_ingest_inserts_and_queues() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("2023");
        touch(&root.join("trip/a.jpg"), b"a");
        touch(&root.join("trip/b.mp4"), b"bb");
        let db = Database::open_in_memory().unwrap();
        let sink = RecordingSink::default();

        let summary = run(&db, &[root.clone()], &sink, 1);

        assert_eq!(summary.added, 2);
        assert_eq!((summary.added_images, summary.added_videos), (1, 1));
        assert_eq!(summary.thumbnails_queued, 2);
        assert_eq!(sink.take().len(), 2);
        let stored = db.all_media().unwrap();
        assert!(stored
            .iter()
            .all(|m| m.folder_key.as_deref() == Some("2023/trip")));
        assert!(stored.iter().all(|m| m.thumb_status == ThumbStatus::Pending));
    }

    #[test]
    fn test_unchanged_files_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("lib/a.jpg"), b"a");
        let roots = [dir.path().join("lib")];
        let db = Database::open_in_memory().unwrap();
        let sink = RecordingSink::default();
        run(&db, &roots, &sink, 10);
        let ids = sink.take();
        db.set_thumbnail_ready(ids[0], "/thumbs/a.jpg", None).unwrap();

        let summary = run(&db, &roots, &sink, 10);

        assert_eq!(summary, IngestSummary::default());
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_changed_file_is_refreshed_and_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lib/a.jpg");
        touch(&file, b"a");
        let roots = [dir.path().join("lib")];
        let db = Database::open_in_memory().unwrap();
        let sink = RecordingSink::default();
        run(&db, &roots, &sink, 10);
        let id = sink.take()[0];
        db.set_thumbnail_ready(id, "/thumbs/a.jpg", None).unwrap();

        filetime::set_file_mtime(&file, filetime::FileTime::from_unix_time(1_000_000, 0)).unwrap();
        let summary = run(&db, &roots, &sink, 10);

        assert_eq!(summary.updated, 1);
        assert_eq!(sink.take(), vec![id]);
        let record = db.media_by_id(id).unwrap().unwrap();
        assert_eq!(record.mtime, 1_000_000);
        assert_eq!(record.thumb_status, ThumbStatus::Pending);
        assert_eq!(record.thumb_path.as_deref(), Some("/thumbs/a.jpg"));
    }

    #[test]
    fn test_deleted_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("lib/a.jpg"), b"a");
        touch(&dir.path().join("lib/b.jpg"), b"b");
        let roots = [dir.path().join("lib")];
        let db = Database::open_in_memory().unwrap();
        let sink = RecordingSink::default();
        run(&db, &roots, &sink, 10);

        fs::remove_file(dir.path().join("lib/b.jpg")).unwrap();
        let summary = run(&db, &roots, &sink, 10);

        assert_eq!(summary.removed, 1);
        let paths: Vec<String> = db.all_media().unwrap().into_iter().map(|m| m.path).collect();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("a.jpg"));
    }

    #[test]
    fn test_missing_root_keeps_its_records() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("usb");
        touch(&root.join("a.jpg"), b"a");
        let db = Database::open_in_memory().unwrap();
        let sink = RecordingSink::default();
        run(&db, &[root.clone()], &sink, 10);

        fs::remove_dir_all(&root).unwrap();
        let summary = run(&db, &[root], &sink, 10);

        assert_eq!(summary.removed, 0);
        assert_eq!(summary.retained, 1);
        assert_eq!(db.all_media().unwrap().len(), 1);
    }

    #[test]
    fn test_removed_root_drops_its_records() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("one/a.jpg"), b"a");
        touch(&dir.path().join("two/b.jpg"), b"b");
        let db = Database::open_in_memory().unwrap();
        let sink = RecordingSink::default();
        run(&db, &[dir.path().join("one"), dir.path().join("two")], &sink, 10);

        let summary = run(&db, &[dir.path().join("one")], &sink, 10);

        assert_eq!(summary.removed, 1);
        assert_eq!(db.all_media().unwrap().len(), 1);
    }

    #[test]
    fn test_root_change_rekeys_without_thumbnail_job() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("lib/2023/trip/a.jpg"), b"a");
        let db = Database::open_in_memory().unwrap();
        let sink = RecordingSink::default();
        run(&db, &[dir.path().join("lib")], &sink, 10);
        let id = sink.take()[0];
        db.set_thumbnail_ready(id, "/thumbs/a.jpg", None).unwrap();

        let roots = [dir.path().join("lib"), dir.path().join("lib/2023")];
        let summary = run(&db, &roots, &sink, 10);

        assert_eq!(summary.rekeyed, 1);
        assert!(sink.take().is_empty());
        let record = db.media_by_id(id).unwrap().unwrap();
        assert_eq!(record.folder_key.as_deref(), Some("2023/trip"));
    }

    #[test]
    fn test_pending_thumbnails_are_resumed() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("lib/a.jpg"), b"a");
        let roots = [dir.path().join("lib")];
        let db = Database::open_in_memory().unwrap();
        let sink = RecordingSink::default();
        run(&db, &roots, &sink, 10);
        let first = sink.take();

        // Nothing rendered the job; the next pass asks again.
        let summary = run(&db, &roots, &sink, 10);
        assert_eq!(summary.thumbnails_queued, 1);
        assert_eq!(sink.take(), first);
    }

    #[test]
    fn test_cancelled_ingest_skips_sweep() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("lib/a.jpg"), b"a");
        let roots = [dir.path().join("lib")];
        let db = Database::open_in_memory().unwrap();
        let sink = RecordingSink::default();
        run(&db, &roots, &sink, 10);

        fs::remove_file(dir.path().join("lib/a.jpg")).unwrap();
        touch(&dir.path().join("lib/b.jpg"), b"b");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut scanner = Scanner::new(&roots);
        let summary = ingest(&db, &mut scanner, &RootSet::new(&roots), 10, &sink, &cancel).unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.removed, 0);
        let paths: Vec<String> = db.all_media().unwrap().into_iter().map(|m| m.path).collect();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("a.jpg"));
    }

    #[test]
    fn test_unreadable_records_follow_root_changes() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("lib");
        touch(&lib.join("2023/trip/a.jpg"), b"a");
        let db = Database::open_in_memory().unwrap();
        let sink = RecordingSink::default();
        run(&db, &[lib.clone()], &sink, 10);
        let id = sink.take()[0];

        fs::rename(&lib, dir.path().join("unplugged")).unwrap();
        let roots = [lib.clone(), lib.join("2023")];
        let summary = run(&db, &roots, &sink, 10);

        assert_eq!(summary.retained, 1);
        assert_eq!(summary.rekeyed, 1);
        assert_eq!(summary.removed, 0);
        let record = db.media_by_id(id).unwrap().unwrap();
        assert_eq!(record.folder_key.as_deref(), Some("2023/trip"));

        let again = run(&db, &roots, &sink, 10);
        assert_eq!((again.retained, again.rekeyed), (1, 0));
    }
}
