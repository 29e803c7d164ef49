//! Local media library indexing.
//!
//! Scans root folders for images and video, keeps a SQLite record per file,
//! renders thumbnails in the background, and maintains one album per folder
//! that survives renames, moves and repeated re-indexing.

pub mod albums;
pub mod codec;
pub mod config;
pub mod database;
pub mod errors;
pub mod folder_key;
pub mod formats;
pub mod indexer;
pub mod ingest;
pub mod scanner;
pub mod thumbnails;

pub use codec::{StandardCodec, ThumbnailCodec};
pub use config::IndexConfig;
pub use database::Database;
pub use errors::{AppError, AppResult, IndexStage};
pub use folder_key::{folder_key, FolderKey, RootSet};
pub use formats::MediaKind;
pub use indexer::{IndexEvent, Indexer, PassOutcome, PassReport};
pub use thumbnails::{PoolSettings, ThumbEvent, ThumbnailPool};

/// Initialize `env_logger`, defaulting to `info` when `RUST_LOG` is unset.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    // A second call (e.g. from tests) is harmless.
    let _ = env_logger::Builder::from_env(env).try_init();
}
