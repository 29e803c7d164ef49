//! `picople` command-line front end.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use picople::{
    config, Database, IndexConfig, Indexer, PassOutcome, PoolSettings, StandardCodec,
    ThumbnailPool,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "picople", about = "Index a local photo and video library")]
struct Cli {
    /// Library database (defaults to <data dir>/library.db)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one indexing pass
    Index {
        /// Root folder to index (repeatable); defaults to the registered roots
        #[arg(long = "root", value_name = "DIR")]
        roots: Vec<PathBuf>,

        /// Exit without waiting for queued thumbnails
        #[arg(long)]
        no_wait: bool,
    },
    /// Manage registered root folders
    Roots {
        #[command(subcommand)]
        action: RootsAction,
    },
    /// Mark a file as favorite
    Favorite {
        path: PathBuf,

        /// Clear the flag instead
        #[arg(long)]
        off: bool,
    },
    /// List albums
    Albums,
}

#[derive(Debug, Subcommand)]
enum RootsAction {
    Add { path: PathBuf },
    Remove { path: PathBuf },
    List,
}

fn open_database(cli_path: Option<PathBuf>, data_dir: &std::path::Path) -> Result<Database> {
    let path = cli_path.unwrap_or_else(|| config::database_path(data_dir));
    Database::new(&path).with_context(|| format!("opening database {}", path.display()))
}

async fn run_index(
    db: Arc<Database>,
    data_dir: PathBuf,
    roots: Vec<PathBuf>,
    no_wait: bool,
) -> Result<()> {
    let index_config = IndexConfig::load(&db)?;
    let roots = if roots.is_empty() { db.roots()? } else { roots };

    let pool = ThumbnailPool::start(
        Arc::clone(&db),
        Arc::new(StandardCodec),
        PoolSettings {
            workers: index_config.workers,
            thumb_size: index_config.thumb_size,
            thumbs_dir: index_config.thumbs_dir_in(&data_dir),
        },
    )
    .context("starting thumbnail workers")?;
    let indexer = Indexer::new(db, pool.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, stopping");
                cancel.cancel();
                pool.shutdown();
            }
        });
    }

    match indexer.run_pass(&roots, &index_config, cancel.clone()).await? {
        PassOutcome::Completed(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        PassOutcome::Cancelled(report) => {
            println!("cancelled: {}", serde_json::to_string_pretty(&report)?);
        }
        PassOutcome::NoRoots => {
            println!("No root folders. Add one with `picople roots add DIR` or pass --root.");
        }
        PassOutcome::AlreadyRunning => println!("An index pass is already running."),
    }

    if !no_wait && !cancel.is_cancelled() {
        let queued = pool.pending() + pool.in_flight();
        if queued > 0 {
            println!("Waiting for {} thumbnail(s)...", queued);
        }
        tokio::select! {
            _ = pool.wait_idle() => {}
            _ = cancel.cancelled() => {}
        }
    }
    pool.drain().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    picople::init_logging();
    let cli = Cli::parse();

    let data_dir = config::data_dir()?;
    let db = Arc::new(open_database(cli.db, &data_dir)?);

    match cli.command {
        Command::Index { roots, no_wait } => run_index(db, data_dir, roots, no_wait).await?,
        Command::Roots { action } => match action {
            RootsAction::Add { path } => {
                let path = path
                    .canonicalize()
                    .with_context(|| format!("resolving {}", path.display()))?;
                if db.add_root(&path)? {
                    println!("Added {}", path.display());
                } else {
                    println!("{} is already registered", path.display());
                }
            }
            RootsAction::Remove { path } => {
                if db.remove_root(&path)? {
                    println!("Removed {}", path.display());
                } else {
                    println!("{} was not registered", path.display());
                }
            }
            RootsAction::List => {
                for root in db.roots()? {
                    println!("{}", root.display());
                }
            }
        },
        Command::Favorite { path, off } => {
            let found = db.set_favorite_by_path(&path.to_string_lossy(), !off)?
                || match path.canonicalize() {
                    Ok(resolved) => db.set_favorite_by_path(&resolved.to_string_lossy(), !off)?,
                    Err(_) => false,
                };
            if !found {
                anyhow::bail!("{} is not in the library", path.display());
            }
        }
        Command::Albums => {
            for album in db.list_albums()? {
                println!(
                    "{:>5}  {:<32}  {:>6} item(s)  {}",
                    album.id,
                    album.title,
                    album.media_count,
                    album.folder_key.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
