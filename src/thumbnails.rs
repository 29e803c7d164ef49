//! Background thumbnail generation.
//!
//! [`ThumbnailPool`] owns a job queue keyed by media id and a fixed set of
//! tokio workers. Submitting an id that is already queued supersedes the
//! older job; an id that is being rendered is queued again once that render
//! finishes. Workers render through a [`ThumbnailCodec`] on the blocking
//! pool and write results back to the store one record at a time.

use crate::codec::{Rendered, ThumbnailCodec};
use crate::database::{Database, MediaRecord};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// Anything that accepts thumbnail jobs. Ingestion only needs this much.
pub trait ThumbnailSink: Send + Sync {
    fn enqueue(&self, media_id: i64);
}

/// Final state of one submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ThumbEvent {
    Ready { media_id: i64, thumb_path: String },
    Failed { media_id: i64, reason: String },
    /// A newer job for the same media replaced this one before it ran.
    Superseded { media_id: i64 },
    /// Discarded by shutdown, or the media disappeared before rendering.
    Dropped { media_id: i64 },
}

impl ThumbEvent {
    pub fn media_id(&self) -> i64 {
        match self {
            ThumbEvent::Ready { media_id, .. }
            | ThumbEvent::Failed { media_id, .. }
            | ThumbEvent::Superseded { media_id }
            | ThumbEvent::Dropped { media_id } => *media_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub thumb_size: u32,
    pub thumbs_dir: PathBuf,
}

/// Deterministic artifact location for a file version.
pub fn thumbnail_path_for(thumbs_dir: &Path, path: &str, size: i64, mtime: i64) -> PathBuf {
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(size.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(mtime.to_string().as_bytes());
    thumbs_dir.join(format!("{}.jpg", hasher.finalize().to_hex()))
}

/// FIFO of media ids with at most one entry per id.
///
/// An id is never rendered by two workers at once: a job submitted while
/// the same id is running waits in `deferred` until that render finishes.
#[derive(Debug, Default)]
struct JobQueue {
    order: VecDeque<i64>,
    queued: HashSet<i64>,
    running: HashSet<i64>,
    deferred: HashSet<i64>,
}

impl JobQueue {
    /// Queue `media_id`. Returns true when an older queued job was replaced.
    fn push(&mut self, media_id: i64) -> bool {
        if self.running.contains(&media_id) {
            return !self.deferred.insert(media_id);
        }
        let superseded = !self.queued.insert(media_id);
        if superseded {
            self.order.retain(|id| *id != media_id);
        }
        self.order.push_back(media_id);
        superseded
    }

    /// Take the next job and count it as in flight.
    fn pop(&mut self) -> Option<i64> {
        let media_id = self.order.pop_front()?;
        self.queued.remove(&media_id);
        self.running.insert(media_id);
        Some(media_id)
    }

    /// Mark `media_id` done. Returns true when a deferred job for it became runnable.
    fn finish(&mut self, media_id: i64) -> bool {
        self.running.remove(&media_id);
        if !self.deferred.remove(&media_id) {
            return false;
        }
        self.queued.insert(media_id);
        self.order.push_back(media_id);
        true
    }

    fn pending(&self) -> usize {
        self.order.len() + self.deferred.len()
    }

    fn in_flight(&self) -> usize {
        self.running.len()
    }

    fn clear(&mut self) -> Vec<i64> {
        self.queued.clear();
        let mut dropped: Vec<i64> = self.order.drain(..).collect();
        let mut deferred: Vec<i64> = self.deferred.drain().collect();
        deferred.sort_unstable();
        dropped.extend(deferred);
        dropped
    }

    fn is_idle(&self) -> bool {
        self.order.is_empty() && self.running.is_empty() && self.deferred.is_empty()
    }
}

struct PoolInner {
    db: Arc<Database>,
    codec: Arc<dyn ThumbnailCodec>,
    thumbs_dir: PathBuf,
    thumb_size: AtomicU32,
    queue: Mutex<JobQueue>,
    work: Notify,
    idle: Notify,
    cancel: CancellationToken,
    events: broadcast::Sender<ThumbEvent>,
}

impl PoolInner {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, JobQueue> {
        // A panicking worker must not wedge the queue for everyone else.
        self.queue.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering from poisoned thumbnail queue");
            poisoned.into_inner()
        })
    }

    fn publish(&self, event: ThumbEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn finish_job(&self, media_id: i64) {
        let mut queue = self.lock_queue();
        if queue.finish(media_id) {
            self.work.notify_one();
        }
        if queue.is_idle() {
            self.idle.notify_waiters();
        }
    }

    async fn process(&self, media_id: i64) {
        let record = match self.db.media_by_id(media_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("Media {} vanished before its thumbnail was rendered", media_id);
                self.publish(ThumbEvent::Dropped { media_id });
                return;
            }
            Err(e) => {
                error!("Failed to load media {} for thumbnailing: {}", media_id, e);
                self.publish(ThumbEvent::Failed {
                    media_id,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let target = thumbnail_path_for(&self.thumbs_dir, &record.path, record.size, record.mtime);
        let size = self.thumb_size.load(Ordering::Relaxed);
        let result = self.render(&record, target.clone(), size).await;

        match result {
            Ok(rendered) => self.store_ready(&record, &target, rendered),
            Err(reason) => {
                warn!("Thumbnail failed for {}: {}", record.path, reason);
                if let Err(e) = self.db.mark_thumbnail_failed(media_id) {
                    error!("Failed to mark thumbnail failure for {}: {}", media_id, e);
                }
                self.publish(ThumbEvent::Failed { media_id, reason });
            }
        }
    }

    async fn render(&self, record: &MediaRecord, target: PathBuf, size: u32) -> Result<Rendered, String> {
        if target.exists() {
            // Same file version was rendered before; keep the artifact.
            return Ok(Rendered {
                rotation: record.rotation,
            });
        }
        let codec = Arc::clone(&self.codec);
        let source = PathBuf::from(&record.path);
        let kind = record.kind;
        tokio::task::spawn_blocking(move || codec.render(&source, kind, &target, size))
            .await
            .map_err(|e| format!("thumbnail task panicked: {}", e))?
            .map_err(|e| e.to_string())
    }

    fn store_ready(&self, record: &MediaRecord, target: &Path, rendered: Rendered) {
        let thumb_path = target.to_string_lossy().into_owned();
        match self
            .db
            .set_thumbnail_ready(record.id, &thumb_path, rendered.rotation)
        {
            Ok(replaced) => {
                if let Some(old) = replaced {
                    if let Err(e) = std::fs::remove_file(&old) {
                        debug!("Could not remove old thumbnail {}: {}", old, e);
                    }
                }
                self.publish(ThumbEvent::Ready {
                    media_id: record.id,
                    thumb_path,
                });
            }
            Err(e) => {
                error!("Failed to store thumbnail for {}: {}", record.id, e);
                self.publish(ThumbEvent::Failed {
                    media_id: record.id,
                    reason: e.to_string(),
                });
            }
        }
    }
}

async fn run_thumbnail_worker(inner: Arc<PoolInner>, worker_id: usize) {
    debug!("Thumbnail worker {} started", worker_id);

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let job = {
            let mut queue = inner.lock_queue();
            let job = queue.pop();
            if job.is_some() && !queue.order.is_empty() {
                // More work left; let a sibling pick it up.
                inner.work.notify_one();
            }
            job
        };

        match job {
            Some(media_id) => {
                inner.process(media_id).await;
                inner.finish_job(media_id);
            }
            None => {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = inner.work.notified() => {}
                }
            }
        }
    }

    debug!("Thumbnail worker {} stopped", worker_id);
}

/// Handle to the worker pool. Clones share the same queue and workers.
#[derive(Clone)]
pub struct ThumbnailPool {
    inner: Arc<PoolInner>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ThumbnailPool {
    /// Create the thumbnail directory and spawn the workers on the current runtime.
    pub fn start(
        db: Arc<Database>,
        codec: Arc<dyn ThumbnailCodec>,
        settings: PoolSettings,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&settings.thumbs_dir)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(PoolInner {
            db,
            codec,
            thumbs_dir: settings.thumbs_dir,
            thumb_size: AtomicU32::new(settings.thumb_size),
            queue: Mutex::new(JobQueue::default()),
            work: Notify::new(),
            idle: Notify::new(),
            cancel: CancellationToken::new(),
            events,
        });

        let workers = settings.workers.max(1);
        let handles = (0..workers)
            .map(|id| tokio::spawn(run_thumbnail_worker(Arc::clone(&inner), id)))
            .collect();
        info!("Started {} thumbnail worker(s)", workers);

        Ok(Self {
            inner,
            handles: Arc::new(Mutex::new(handles)),
        })
    }

    /// Queue a job. Returns false once the pool has been shut down.
    pub fn submit(&self, media_id: i64) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }
        let superseded = self.inner.lock_queue().push(media_id);
        if superseded {
            self.inner.publish(ThumbEvent::Superseded { media_id });
        }
        self.inner.work.notify_one();
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThumbEvent> {
        self.inner.events.subscribe()
    }

    pub fn thumbs_dir(&self) -> &Path {
        &self.inner.thumbs_dir
    }

    /// Applies to jobs that start after the call.
    pub fn set_thumb_size(&self, size: u32) {
        self.inner.thumb_size.store(size, Ordering::Relaxed);
    }

    pub fn pending(&self) -> usize {
        self.inner.lock_queue().pending()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock_queue().in_flight()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock_queue().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work and drop queued jobs. Running jobs finish on their own.
    pub fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        let dropped = {
            let mut queue = self.inner.lock_queue();
            let dropped = queue.clear();
            if queue.is_idle() {
                self.inner.idle.notify_waiters();
            }
            dropped
        };
        if !dropped.is_empty() {
            info!("Thumbnail pool shutting down, dropped {} queued job(s)", dropped.len());
        }
        for media_id in dropped {
            self.inner.publish(ThumbEvent::Dropped { media_id });
        }
    }

    /// Shut down and wait for every worker to exit.
    pub async fn drain(&self) {
        self.shutdown();
        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Thumbnail worker panicked: {}", e);
            }
        }
    }
}

impl ThumbnailSink for ThumbnailPool {
    fn enqueue(&self, media_id: i64) {
        if !self.submit(media_id) {
            debug!("Thumbnail pool is shut down, not queueing {}", media_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use crate::database::{insert_media, NewMedia, ThumbStatus};
    use crate::formats::MediaKind;
    use std::time::Duration;

    /// Writes a placeholder file; fails for paths containing "bad".
    struct StubCodec {
        delay: Duration,
    }

    impl ThumbnailCodec for StubCodec {
        fn render(
            &self,
            source: &Path,
            _kind: MediaKind,
            target: &Path,
            _size: u32,
        ) -> Result<Rendered, CodecError> {
            std::thread::sleep(self.delay);
            if source.to_string_lossy().contains("bad") {
                return Err(CodecError::Decode("stub refuses".to_string()));
            }
            std::fs::write(target, b"thumb")?;
            Ok(Rendered::default())
        }
    }

    /// Slow on its first render only.
    struct SlowFirstCodec {
        first: std::sync::atomic::AtomicBool,
    }

    impl ThumbnailCodec for SlowFirstCodec {
        fn render(
            &self,
            _source: &Path,
            _kind: MediaKind,
            target: &Path,
            _size: u32,
        ) -> Result<Rendered, CodecError> {
            if self.first.swap(false, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(300));
            }
            std::fs::write(target, b"thumb")?;
            Ok(Rendered::default())
        }
    }

    fn seed(db: &Database, paths: &[&str]) -> Vec<i64> {
        db.write(|tx| {
            paths
                .iter()
                .map(|path| {
                    insert_media(
                        tx,
                        &NewMedia {
                            path: *path,
                            kind: MediaKind::Image,
                            mtime: 1,
                            size: 1,
                            folder_key: Some("lib"),
                        },
                    )
                })
                .collect()
        })
        .unwrap()
    }

    fn pool(db: Arc<Database>, dir: &Path, workers: usize, delay: Duration) -> ThumbnailPool {
        ThumbnailPool::start(
            db,
            Arc::new(StubCodec { delay }),
            PoolSettings {
                workers,
                thumb_size: 64,
                thumbs_dir: dir.join("thumbs"),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_queue_coalesces_duplicate_ids() {
        let mut queue = JobQueue::default();
        assert!(!queue.push(1));
        assert!(!queue.push(2));
        assert!(queue.push(1));

        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.in_flight(), 2);
        assert!(!queue.finish(2));
        assert!(!queue.finish(1));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_queue_defers_ids_that_are_running() {
        let mut queue = JobQueue::default();
        queue.push(1);
        assert_eq!(queue.pop(), Some(1));

        assert!(!queue.push(1));
        assert!(queue.push(1));
        assert_eq!(queue.pending(), 1);
        // Not runnable while the first render is still going.
        assert_eq!(queue.pop(), None);

        assert!(queue.finish(1));
        assert_eq!(queue.pop(), Some(1));
        assert!(!queue.finish(1));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_thumbnail_path_is_deterministic() {
        let dir = Path::new("/thumbs");
        let a = thumbnail_path_for(dir, "/lib/a.jpg", 10, 100);
        assert_eq!(a, thumbnail_path_for(dir, "/lib/a.jpg", 10, 100));
        assert_ne!(a, thumbnail_path_for(dir, "/lib/a.jpg", 10, 101));
        assert_eq!(a.extension().unwrap(), "jpg");
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ids = seed(&db, &["/lib/good1.jpg", "/lib/bad.jpg", "/lib/good2.jpg"]);
        let pool = pool(db.clone(), dir.path(), 2, Duration::ZERO);
        let mut events = pool.subscribe();

        for id in &ids {
            pool.submit(*id);
        }
        pool.wait_idle().await;

        let statuses: Vec<ThumbStatus> = ids
            .iter()
            .map(|id| db.media_by_id(*id).unwrap().unwrap().thumb_status)
            .collect();
        assert_eq!(
            statuses,
            vec![ThumbStatus::Ready, ThumbStatus::Failed, ThumbStatus::Ready]
        );
        let good = db.media_by_id(ids[0]).unwrap().unwrap();
        assert!(Path::new(good.thumb_path.as_deref().unwrap()).exists());

        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ThumbEvent::Failed { .. }) {
                assert_eq!(event.media_id(), ids[1]);
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
        pool.drain().await;
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ids = seed(&db, &["/lib/1.jpg", "/lib/2.jpg", "/lib/3.jpg"]);
        let pool = pool(db.clone(), dir.path(), 1, Duration::from_millis(200));

        for id in &ids {
            pool.submit(*id);
        }
        while pool.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.drain().await;

        assert_eq!(pool.pending(), 0);
        assert!(!pool.submit(ids[0]));
        let first = db.media_by_id(ids[0]).unwrap().unwrap();
        assert_eq!(first.thumb_status, ThumbStatus::Ready);
        for id in &ids[1..] {
            let record = db.media_by_id(*id).unwrap().unwrap();
            assert_eq!(record.thumb_status, ThumbStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_rerender_replaces_old_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ids = seed(&db, &["/lib/a.jpg"]);
        let old = dir.path().join("old.jpg");
        std::fs::write(&old, b"old").unwrap();
        db.set_thumbnail_ready(ids[0], &old.to_string_lossy(), None)
            .unwrap();

        let pool = pool(db.clone(), dir.path(), 1, Duration::ZERO);
        pool.submit(ids[0]);
        pool.wait_idle().await;

        let record = db.media_by_id(ids[0]).unwrap().unwrap();
        assert_ne!(record.thumb_path.as_deref(), Some(&*old.to_string_lossy()));
        assert!(!old.exists());
        pool.drain().await;
    }

    #[tokio::test]
    async fn test_resubmit_while_rendering_keeps_newest_version() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ids = seed(&db, &["/lib/a.jpg"]);
        let pool = ThumbnailPool::start(
            db.clone(),
            Arc::new(SlowFirstCodec {
                first: std::sync::atomic::AtomicBool::new(true),
            }),
            PoolSettings {
                workers: 2,
                thumb_size: 64,
                thumbs_dir: dir.path().join("thumbs"),
            },
        )
        .unwrap();

        pool.submit(ids[0]);
        while pool.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        db.write(|tx| {
            crate::database::update_media_file(tx, ids[0], MediaKind::Image, 2, 1, Some("lib"))
        })
        .unwrap();
        pool.submit(ids[0]);
        assert_eq!(pool.in_flight(), 1);
        pool.wait_idle().await;

        let expected = thumbnail_path_for(pool.thumbs_dir(), "/lib/a.jpg", 1, 2);
        let stale = thumbnail_path_for(pool.thumbs_dir(), "/lib/a.jpg", 1, 1);
        let record = db.media_by_id(ids[0]).unwrap().unwrap();
        assert_eq!(record.thumb_status, ThumbStatus::Ready);
        assert_eq!(record.thumb_path.as_deref(), Some(&*expected.to_string_lossy()));
        assert!(expected.exists());
        assert!(!stale.exists());
        pool.drain().await;
    }
}
