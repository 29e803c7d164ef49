//! Indexing configuration.
//!
//! Values are layered: built-in defaults, then the JSON stored in the
//! `config` table under [`INDEX_CONFIG_KEY`], then `PICOPLE_*` environment
//! variables (a `.env` file is loaded by the binary before this runs).

use crate::database::Database;
use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const INDEX_CONFIG_KEY: &str = "index_config";

const DATA_DIR_NAME: &str = "picople";
const DATABASE_FILE: &str = "library.db";
const THUMBS_DIR_NAME: &str = "thumbs";

pub const ENV_DATA_DIR: &str = "PICOPLE_DATA_DIR";
const ENV_THUMB_SIZE: &str = "PICOPLE_THUMB_SIZE";
const ENV_BATCH_SIZE: &str = "PICOPLE_BATCH_SIZE";
const ENV_WORKERS: &str = "PICOPLE_WORKERS";
const ENV_THUMBS_DIR: &str = "PICOPLE_THUMBS_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexConfig {
    /// Edge length of the square thumbnails, in pixels.
    pub thumb_size: u32,
    /// Media changes committed per ingest transaction.
    pub batch_size: usize,
    /// Thumbnail worker tasks.
    pub workers: usize,
    /// Defaults to `<data dir>/thumbs`.
    pub thumbs_dir: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            thumb_size: 320,
            batch_size: 500,
            workers: 2,
            thumbs_dir: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> AppResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{} must be a number, got '{}'", name, raw)))
}

impl IndexConfig {
    /// Defaults, overlaid with the stored JSON and then the process environment.
    pub fn load(db: &Database) -> AppResult<Self> {
        let mut config = match db.get_config(INDEX_CONFIG_KEY)? {
            Some(json) => serde_json::from_str::<IndexConfig>(&json)
                .map_err(|e| AppError::Config(format!("Invalid stored index config: {}", e)))?,
            None => IndexConfig::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        log::debug!("Index config: {:?}", config);
        Ok(config)
    }

    pub fn save(&self, db: &Database) -> AppResult<()> {
        self.validate()?;
        let json = serde_json::to_string(self).map_err(|e| AppError::Config(e.to_string()))?;
        db.set_config(INDEX_CONFIG_KEY, &json)?;
        Ok(())
    }

    /// Override fields from variables returned by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> AppResult<()> {
        if let Some(raw) = lookup(ENV_THUMB_SIZE) {
            self.thumb_size = parse_env(ENV_THUMB_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = parse_env(ENV_BATCH_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WORKERS) {
            self.workers = parse_env(ENV_WORKERS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_THUMBS_DIR) {
            if !raw.trim().is_empty() {
                self.thumbs_dir = Some(PathBuf::from(raw.trim()));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if !(16..=4096).contains(&self.thumb_size) {
            return Err(AppError::Config(format!(
                "thumbSize must be between 16 and 4096, got {}",
                self.thumb_size
            )));
        }
        if self.batch_size == 0 {
            return Err(AppError::Config("batchSize must be at least 1".to_string()));
        }
        if !(1..=64).contains(&self.workers) {
            return Err(AppError::Config(format!(
                "workers must be between 1 and 64, got {}",
                self.workers
            )));
        }
        Ok(())
    }

    pub fn thumbs_dir_in(&self, data_dir: &Path) -> PathBuf {
        self.thumbs_dir
            .clone()
            .unwrap_or_else(|| data_dir.join(THUMBS_DIR_NAME))
    }
}

/// Where the library database and thumbnails live. Created if missing.
pub fn data_dir() -> AppResult<PathBuf> {
    let dir = match std::env::var(ENV_DATA_DIR) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => dirs::data_local_dir()
            .ok_or_else(|| AppError::Config("Could not find local data directory".to_string()))?
            .join(DATA_DIR_NAME),
    };
    std::fs::create_dir_all(&dir)?;
    log::debug!("Using data directory at {:?}", dir);
    Ok(dir)
}

pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DATABASE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = IndexConfig::default();
        assert_eq!(config.thumb_size, 320);
        assert_eq!(config.batch_size, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stored_config_then_env_override() {
        let db = Database::open_in_memory().unwrap();
        db.set_config(INDEX_CONFIG_KEY, r#"{"thumbSize": 256, "workers": 4}"#)
            .unwrap();
        let stored: IndexConfig =
            serde_json::from_str(&db.get_config(INDEX_CONFIG_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(stored.thumb_size, 256);
        assert_eq!(stored.batch_size, 500);

        let mut config = stored;
        config
            .apply_env(env(&[("PICOPLE_WORKERS", "3"), ("PICOPLE_THUMBS_DIR", "/tmp/t")]))
            .unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.thumb_size, 256);
        assert_eq!(config.thumbs_dir_in(Path::new("/data")), PathBuf::from("/tmp/t"));
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = IndexConfig::default();
        let err = config
            .apply_env(env(&[("PICOPLE_BATCH_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = IndexConfig {
            thumb_size: 8,
            ..IndexConfig::default()
        };
        assert!(config.validate().is_err());
        let config = IndexConfig {
            workers: 0,
            ..IndexConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_round_trips_through_store() {
        let db = Database::open_in_memory().unwrap();
        let config = IndexConfig {
            batch_size: 50,
            ..IndexConfig::default()
        };
        config.save(&db).unwrap();
        let json = db.get_config(INDEX_CONFIG_KEY).unwrap().unwrap();
        assert_eq!(serde_json::from_str::<IndexConfig>(&json).unwrap(), config);
    }

    #[test]
    fn test_default_thumbs_dir_under_data_dir() {
        let config = IndexConfig::default();
        assert_eq!(
            config.thumbs_dir_in(Path::new("/data")),
            PathBuf::from("/data/thumbs")
        );
    }
}
