//! Indexing pass orchestration.
//!
//! A pass runs scan and ingest on the blocking pool, leaves thumbnails to the
//! [`ThumbnailPool`], and then reconciles albums. Only one pass runs at a time.

use crate::albums::{self, ReconcileStats};
use crate::config::IndexConfig;
use crate::database::Database;
use crate::errors::{AppError, AppResult, IndexStage};
use crate::folder_key::RootSet;
use crate::ingest::{self, IngestSummary};
use crate::scanner::Scanner;
use crate::thumbnails::ThumbnailPool;
use log::{error, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Counts from one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub media_added: usize,
    pub images_added: usize,
    pub videos_added: usize,
    pub media_updated: usize,
    pub media_rekeyed: usize,
    pub media_removed: usize,
    pub media_retained: usize,
    pub thumbnails_queued: usize,
    pub albums_created: usize,
    pub albums_merged: usize,
    pub albums_deleted: usize,
    pub albums_rekeyed: usize,
    pub links_added: usize,
    pub links_removed: usize,
    pub covers_assigned: usize,
    pub scan_warnings: usize,
    pub elapsed_ms: u64,
}

impl PassReport {
    fn record_ingest(&mut self, summary: &IngestSummary) {
        self.media_added = summary.added;
        self.images_added = summary.added_images;
        self.videos_added = summary.added_videos;
        self.media_updated = summary.updated;
        self.media_rekeyed = summary.rekeyed;
        self.media_removed = summary.removed;
        self.media_retained = summary.retained;
        self.thumbnails_queued = summary.thumbnails_queued;
    }

    fn record_reconcile(&mut self, stats: &ReconcileStats) {
        self.albums_created = stats.albums_created;
        self.albums_merged = stats.albums_merged;
        self.albums_deleted = stats.albums_deleted;
        self.albums_rekeyed = stats.albums_rekeyed;
        self.links_added = stats.links_added;
        self.links_removed = stats.links_removed;
        self.covers_assigned = stats.covers_assigned;
    }

    /// Number of store writes the pass made to media and albums.
    pub fn mutations(&self) -> usize {
        self.media_added
            + self.media_updated
            + self.media_rekeyed
            + self.media_removed
            + self.albums_created
            + self.albums_merged
            + self.albums_deleted
            + self.albums_rekeyed
            + self.links_added
            + self.links_removed
            + self.covers_assigned
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// Stopped early. Committed batches stay; no deletion sweep or reconciliation ran.
    Cancelled(PassReport),
    NoRoots,
    AlreadyRunning,
}

/// Progress notifications for whoever drives the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum IndexEvent {
    Started { roots: usize },
    Ingested { summary: IngestSummary },
    Finished { report: PassReport },
    Cancelled { report: PassReport },
    Failed { stage: IndexStage, reason: String },
}

/// Clears the running flag however the pass ends.
///
/// Blocking tasks hold a clone, so dropping the `run_pass` future leaves the
/// flag set until the scan or reconcile it started has returned.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Indexer {
    db: Arc<Database>,
    pool: ThumbnailPool,
    running: Arc<AtomicBool>,
    events: broadcast::Sender<IndexEvent>,
}

impl Indexer {
    pub fn new(db: Arc<Database>, pool: ThumbnailPool) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            db,
            pool,
            running: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn pool(&self) -> &ThumbnailPool {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn emit(&self, event: IndexEvent) {
        let _ = self.events.send(event);
    }

    /// Run one indexing pass over `roots`.
    pub async fn run_pass(
        &self,
        roots: &[PathBuf],
        config: &IndexConfig,
        cancel: CancellationToken,
    ) -> AppResult<PassOutcome> {
        if roots.is_empty() {
            info!("No root folders configured, nothing to index");
            return Ok(PassOutcome::NoRoots);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Index pass requested while another is running");
            return Ok(PassOutcome::AlreadyRunning);
        }
        let guard = Arc::new(RunningGuard(Arc::clone(&self.running)));

        match self.execute(roots, config, cancel, guard).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!("{}", err);
                if let AppError::PassFailed { stage, reason } = &err {
                    self.emit(IndexEvent::Failed {
                        stage: *stage,
                        reason: reason.clone(),
                    });
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        roots: &[PathBuf],
        config: &IndexConfig,
        cancel: CancellationToken,
        guard: Arc<RunningGuard>,
    ) -> AppResult<PassOutcome> {
        let started = Instant::now();
        let root_set = RootSet::new(roots);
        info!("Index pass started over {} root(s)", roots.len());
        self.emit(IndexEvent::Started { roots: roots.len() });
        self.pool.set_thumb_size(config.thumb_size);

        let mut report = PassReport::default();

        let (summary, warnings) = {
            let db = Arc::clone(&self.db);
            let pool = self.pool.clone();
            let root_set = root_set.clone();
            let roots = roots.to_vec();
            let batch_size = config.batch_size;
            let cancel = cancel.clone();
            let guard = Arc::clone(&guard);
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                let mut scanner = Scanner::new(&roots);
                let summary =
                    ingest::ingest(&db, &mut scanner, &root_set, batch_size, &pool, &cancel)?;
                Ok::<_, rusqlite::Error>((summary, scanner.warnings().len()))
            })
            .await
            .map_err(|e| AppError::pass_failed(IndexStage::Scan, e))?
            .map_err(|e| AppError::pass_failed(IndexStage::Ingest, e))?
        };
        report.record_ingest(&summary);
        report.scan_warnings = warnings;
        self.emit(IndexEvent::Ingested {
            summary: summary.clone(),
        });

        if summary.cancelled || cancel.is_cancelled() {
            report.elapsed_ms = started.elapsed().as_millis() as u64;
            info!("Index pass cancelled after {} ms", report.elapsed_ms);
            self.emit(IndexEvent::Cancelled {
                report: report.clone(),
            });
            return Ok(PassOutcome::Cancelled(report));
        }

        let stats = {
            let db = Arc::clone(&self.db);
            let guard = Arc::clone(&guard);
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                albums::reconcile(&db, &root_set)
            })
                .await
                .map_err(|e| AppError::pass_failed(IndexStage::Reconcile, e))?
                .map_err(|e| AppError::pass_failed(IndexStage::Reconcile, e))?
        };
        report.record_reconcile(&stats);
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            "Index pass finished in {} ms: {} added, {} updated, {} removed, {} album change(s)",
            report.elapsed_ms,
            report.media_added,
            report.media_updated,
            report.media_removed,
            report.albums_created + report.albums_merged + report.albums_deleted
        );
        self.emit(IndexEvent::Finished {
            report: report.clone(),
        });
        Ok(PassOutcome::Completed(report))
    }

    /// Stop the thumbnail pool. Queued jobs are dropped; call [`ThumbnailPool::drain`] to wait.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
