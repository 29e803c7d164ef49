use crate::formats::MediaKind;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Result, Transaction};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use time::OffsetDateTime;

/// Lifecycle of a media record's thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbStatus {
    /// Not generated yet, or the file changed since the last artifact.
    Pending,
    Ready,
    /// Codec gave up on this file; not retried until the file changes.
    Failed,
}

impl ThumbStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ThumbStatus::Pending => "pending",
            ThumbStatus::Ready => "ready",
            ThumbStatus::Failed => "failed",
        }
    }
}

impl ToSql for ThumbStatus {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ThumbStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "pending" => Ok(ThumbStatus::Pending),
            "ready" => Ok(ThumbStatus::Ready),
            "failed" => Ok(ThumbStatus::Failed),
            other => Err(FromSqlError::Other(
                format!("unknown thumbnail status '{}'", other).into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: i64,
    pub path: String,
    pub kind: MediaKind,
    pub mtime: i64,
    pub size: i64,
    pub thumb_path: Option<String>,
    pub thumb_status: ThumbStatus,
    pub favorite: bool,
    pub folder_key: Option<String>,
    /// Container-declared rotation in degrees, reported by the codec for video.
    pub rotation: Option<i32>,
    pub indexed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: i64,
    pub title: String,
    pub cover_path: Option<String>,
    /// `None` for albums that are not derived from a folder.
    pub folder_key: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumLink {
    pub album_id: i64,
    pub media_id: i64,
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumSummary {
    pub id: i64,
    pub title: String,
    pub cover_path: Option<String>,
    pub folder_key: Option<String>,
    pub media_count: i64,
}

/// Values for a freshly discovered media file.
#[derive(Debug, Clone)]
pub struct NewMedia<'a> {
    pub path: &'a str,
    pub kind: MediaKind,
    pub mtime: i64,
    pub size: i64,
    pub folder_key: Option<&'a str>,
}

/// Consistent read of everything album reconciliation looks at.
#[derive(Debug, Clone, Default)]
pub struct LibrarySnapshot {
    pub media: Vec<MediaRecord>,
    pub albums: Vec<Album>,
    pub links: Vec<AlbumLink>,
}

const MEDIA_COLUMNS: &str = "id, path, kind, mtime, size, thumb_path, thumb_status, favorite, folder_key, rotation, indexed_at";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Get a connection, recovering from poisoned mutex if needed.
    pub fn get_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            log::warn!("Recovering from poisoned database mutex");
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("Mutex poisoned: {}", e)),
            )
        })
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        log::debug!("Database journal mode: {}", mode);
        Self::init(conn)
    }

    /// Private in-memory store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let mut version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        log::info!("Database schema version: {}", version);

        if version < 1 {
            conn.execute_batch(
                "BEGIN;
                CREATE TABLE IF NOT EXISTS config (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS folders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    path TEXT NOT NULL UNIQUE
                );

                CREATE TABLE IF NOT EXISTS media (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    path TEXT NOT NULL UNIQUE,
                    kind TEXT NOT NULL,            -- 'image' | 'video'
                    mtime INTEGER NOT NULL,
                    size INTEGER NOT NULL,
                    thumb_path TEXT,
                    thumb_status TEXT NOT NULL DEFAULT 'pending', -- pending, ready, failed
                    favorite INTEGER NOT NULL DEFAULT 0,
                    folder_key TEXT,
                    indexed_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_media_mtime ON media(mtime);
                CREATE INDEX IF NOT EXISTS idx_media_kind ON media(kind);
                CREATE INDEX IF NOT EXISTS idx_media_folder_key ON media(folder_key);

                CREATE TABLE IF NOT EXISTS albums (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL UNIQUE,
                    cover_path TEXT,
                    folder_key TEXT,               -- NULL for hand-made albums
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS album_media (
                    album_id INTEGER NOT NULL,
                    media_id INTEGER NOT NULL,
                    position INTEGER NOT NULL,
                    PRIMARY KEY (album_id, media_id),
                    FOREIGN KEY(album_id) REFERENCES albums(id) ON DELETE CASCADE,
                    FOREIGN KEY(media_id) REFERENCES media(id) ON DELETE CASCADE
                );
                CREATE INDEX IF NOT EXISTS idx_album_media_media ON album_media(media_id);

                PRAGMA user_version = 1;
                COMMIT;",
            )?;
            version = 1;
        }

        if version < 2 {
            // Migration 2: rotation reported by the video codec
            conn.execute_batch(
                "BEGIN;
                 ALTER TABLE media ADD COLUMN rotation INTEGER;
                 PRAGMA user_version = 2;
                 COMMIT;",
            )?;
        }

        Ok(())
    }

    /// Run `f` inside a single transaction; any error rolls the whole thing back.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // --- Config ---

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.get_conn()?;
        conn.query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (key, value),
        )?;
        Ok(())
    }

    // --- Folder roots ---

    /// Register a root folder. Returns false if it was already registered.
    pub fn add_root(&self, path: &Path) -> Result<bool> {
        let conn = self.get_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO folders (path) VALUES (?1)",
            [path.to_string_lossy()],
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_root(&self, path: &Path) -> Result<bool> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM folders WHERE path = ?1",
            [path.to_string_lossy()],
        )?;
        Ok(removed > 0)
    }

    /// Registered roots in registration order.
    pub fn roots(&self) -> Result<Vec<PathBuf>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT path FROM folders ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut roots = Vec::new();
        for row in rows {
            roots.push(PathBuf::from(row?));
        }
        Ok(roots)
    }

    // --- Media reads ---

    fn map_media_row(row: &rusqlite::Row<'_>) -> Result<MediaRecord> {
        Ok(MediaRecord {
            id: row.get(0)?,
            path: row.get(1)?,
            kind: row.get(2)?,
            mtime: row.get(3)?,
            size: row.get(4)?,
            thumb_path: row.get(5)?,
            thumb_status: row.get(6)?,
            favorite: row.get::<_, i32>(7)? != 0,
            folder_key: row.get(8)?,
            rotation: row.get(9)?,
            indexed_at: row.get(10)?,
        })
    }

    fn query_media(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> Result<Vec<MediaRecord>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, Self::map_media_row)?;
        let mut media = Vec::new();
        for row in rows {
            media.push(row?);
        }
        Ok(media)
    }

    /// All media ordered by path.
    pub fn all_media(&self) -> Result<Vec<MediaRecord>> {
        let conn = self.get_conn()?;
        Self::query_media(
            &conn,
            &format!("SELECT {} FROM media ORDER BY path", MEDIA_COLUMNS),
            &[],
        )
    }

    pub fn media_by_id(&self, media_id: i64) -> Result<Option<MediaRecord>> {
        let conn = self.get_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM media WHERE id = ?1", MEDIA_COLUMNS),
            [media_id],
            Self::map_media_row,
        )
        .optional()
    }

    pub fn media_by_path(&self, path: &str) -> Result<Option<MediaRecord>> {
        let conn = self.get_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM media WHERE path = ?1", MEDIA_COLUMNS),
            [path],
            Self::map_media_row,
        )
        .optional()
    }

    /// Ids of media still waiting for a thumbnail, oldest first.
    pub fn pending_thumbnail_ids(&self) -> Result<Vec<i64>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT id FROM media WHERE thumb_status = 'pending' ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    fn build_where(kind: Option<MediaKind>, search: Option<&str>) -> (String, Vec<Box<dyn ToSql>>) {
        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(kind) = kind {
            clauses.push("kind = ?");
            args.push(Box::new(kind));
        }
        if let Some(search) = search.filter(|s| !s.is_empty()) {
            clauses.push("path LIKE ? ESCAPE '\\'");
            args.push(Box::new(format!("%{}%", escape_like_pattern(search))));
        }
        if clauses.is_empty() {
            (String::new(), args)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), args)
        }
    }

    pub fn count_media(&self, kind: Option<MediaKind>, search: Option<&str>) -> Result<i64> {
        let conn = self.get_conn()?;
        let (clause, args) = Self::build_where(kind, search);
        conn.query_row(
            &format!("SELECT COUNT(*) FROM media {}", clause),
            rusqlite::params_from_iter(args.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )
    }

    /// A page of media, newest modification first.
    pub fn fetch_media_page(
        &self,
        offset: i64,
        limit: i64,
        kind: Option<MediaKind>,
        search: Option<&str>,
    ) -> Result<Vec<MediaRecord>> {
        let limit = limit.clamp(0, 1000);
        let offset = offset.max(0);

        let conn = self.get_conn()?;
        let (clause, mut args) = Self::build_where(kind, search);
        args.push(Box::new(limit));
        args.push(Box::new(offset));
        let sql = format!(
            "SELECT {} FROM media {} ORDER BY mtime DESC, id DESC LIMIT ? OFFSET ?",
            MEDIA_COLUMNS, clause
        );
        let refs: Vec<&dyn ToSql> = args.iter().map(|p| p.as_ref()).collect();
        Self::query_media(&conn, &sql, &refs)
    }

    pub fn favorites(&self) -> Result<Vec<MediaRecord>> {
        let conn = self.get_conn()?;
        Self::query_media(
            &conn,
            &format!(
                "SELECT {} FROM media WHERE favorite = 1 ORDER BY mtime DESC, id DESC",
                MEDIA_COLUMNS
            ),
            &[],
        )
    }

    // --- Favorites ---

    /// Set or clear the favorite flag. Returns false when no such media exists.
    pub fn set_favorite(&self, media_id: i64, favorite: bool) -> Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE media SET favorite = ?1 WHERE id = ?2",
            params![favorite as i32, media_id],
        )?;
        Ok(updated > 0)
    }

    pub fn set_favorite_by_path(&self, path: &str, favorite: bool) -> Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE media SET favorite = ?1 WHERE path = ?2",
            params![favorite as i32, path],
        )?;
        Ok(updated > 0)
    }

    /// Toggle favorite status for a media item. Returns new favorite status.
    pub fn toggle_favorite(&self, media_id: i64) -> Result<bool> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE media SET favorite = NOT favorite WHERE id = ?1",
            [media_id],
        )?;

        let favorite: i32 = conn.query_row(
            "SELECT favorite FROM media WHERE id = ?1",
            [media_id],
            |row| row.get(0),
        )?;

        Ok(favorite != 0)
    }

    // --- Thumbnails ---

    /// Record a generated thumbnail. Album covers that pointed at the previous
    /// artifact follow it to the new one. Returns the replaced path, if any.
    pub fn set_thumbnail_ready(
        &self,
        media_id: i64,
        thumb_path: &str,
        rotation: Option<i32>,
    ) -> Result<Option<String>> {
        self.write(|tx| {
            let previous: Option<Option<String>> = tx
                .query_row(
                    "SELECT thumb_path FROM media WHERE id = ?1",
                    [media_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(previous) = previous else {
                // Media vanished while the job was running.
                return Ok(None);
            };

            tx.execute(
                "UPDATE media SET thumb_path = ?1, thumb_status = 'ready', rotation = ?2 WHERE id = ?3",
                params![thumb_path, rotation, media_id],
            )?;

            match previous {
                Some(old) if old != thumb_path => {
                    tx.execute(
                        "UPDATE albums SET cover_path = ?1 WHERE cover_path = ?2",
                        params![thumb_path, old],
                    )?;
                    Ok(Some(old))
                }
                _ => Ok(None),
            }
        })
    }

    /// Mark a thumbnail as permanently failed. Any earlier artifact stays referenced.
    pub fn mark_thumbnail_failed(&self, media_id: i64) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE media SET thumb_status = 'failed' WHERE id = ?1",
            [media_id],
        )?;
        Ok(())
    }

    // --- Albums ---

    pub fn album_by_id(&self, album_id: i64) -> Result<Option<Album>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT id, title, cover_path, folder_key, created_at FROM albums WHERE id = ?1",
            [album_id],
            map_album_row,
        )
        .optional()
    }

    pub fn album_by_title(&self, title: &str) -> Result<Option<Album>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT id, title, cover_path, folder_key, created_at FROM albums WHERE title = ?1",
            [title],
            map_album_row,
        )
        .optional()
    }

    /// Rename an album. Fails on an empty title or one already in use.
    pub fn rename_album(&self, album_id: i64, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(rusqlite::Error::InvalidParameterName(
                "Album title cannot be empty".to_string(),
            ));
        }
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE albums SET title = ?1 WHERE id = ?2",
            params![title, album_id],
        )?;
        Ok(())
    }

    pub fn set_album_cover(&self, album_id: i64, cover_path: Option<&str>) -> Result<()> {
        let conn = self.get_conn()?;
        update_album_cover(&conn, album_id, cover_path)
    }

    pub fn list_albums(&self) -> Result<Vec<AlbumSummary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT a.id, a.title, a.cover_path, a.folder_key,
                    (SELECT COUNT(*) FROM album_media am WHERE am.album_id = a.id)
             FROM albums a
             ORDER BY a.title",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AlbumSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                cover_path: row.get(2)?,
                folder_key: row.get(3)?,
                media_count: row.get(4)?,
            })
        })?;

        let mut albums = Vec::new();
        for album in rows {
            albums.push(album?);
        }
        Ok(albums)
    }

    /// Media of one album in display order.
    pub fn album_media(&self, album_id: i64) -> Result<Vec<MediaRecord>> {
        let conn = self.get_conn()?;
        let columns = MEDIA_COLUMNS
            .split(", ")
            .map(|c| format!("m.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        Self::query_media(
            &conn,
            &format!(
                "SELECT {} FROM media m
                 INNER JOIN album_media am ON m.id = am.media_id
                 WHERE am.album_id = ?1
                 ORDER BY am.position",
                columns
            ),
            &[&album_id],
        )
    }

    pub fn links_for_album(&self, album_id: i64) -> Result<Vec<AlbumLink>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT album_id, media_id, position FROM album_media WHERE album_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([album_id], map_link_row)?;
        rows.collect()
    }

    pub fn links_for_media(&self, media_id: i64) -> Result<Vec<AlbumLink>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT album_id, media_id, position FROM album_media WHERE media_id = ?1 ORDER BY album_id",
        )?;
        let rows = stmt.query_map([media_id], map_link_row)?;
        rows.collect()
    }

    /// Read media, albums and links under one read transaction.
    pub fn snapshot(&self) -> Result<LibrarySnapshot> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let snapshot = read_snapshot(&tx)?;
        tx.commit()?;
        Ok(snapshot)
    }
}

/// Everything album reconciliation looks at, read through `conn`.
pub(crate) fn read_snapshot(conn: &Connection) -> Result<LibrarySnapshot> {
    let media = Database::query_media(
        conn,
        &format!("SELECT {} FROM media ORDER BY path", MEDIA_COLUMNS),
        &[],
    )?;

    let albums = {
        let mut stmt = conn.prepare(
            "SELECT id, title, cover_path, folder_key, created_at FROM albums ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_album_row)?;
        rows.collect::<Result<Vec<_>>>()?
    };

    let links = {
        let mut stmt = conn.prepare(
            "SELECT album_id, media_id, position FROM album_media ORDER BY album_id, position, media_id",
        )?;
        let rows = stmt.query_map([], map_link_row)?;
        rows.collect::<Result<Vec<_>>>()?
    };

    Ok(LibrarySnapshot {
        media,
        albums,
        links,
    })
}

fn map_album_row(row: &rusqlite::Row<'_>) -> Result<Album> {
    Ok(Album {
        id: row.get(0)?,
        title: row.get(1)?,
        cover_path: row.get(2)?,
        folder_key: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn map_link_row(row: &rusqlite::Row<'_>) -> Result<AlbumLink> {
    Ok(AlbumLink {
        album_id: row.get(0)?,
        media_id: row.get(1)?,
        position: row.get(2)?,
    })
}

/// Escape special characters in LIKE patterns to prevent SQL injection issues.
pub fn escape_like_pattern(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// --- Transaction-scoped writes used by ingestion and reconciliation ---

pub(crate) fn insert_media(conn: &Connection, media: &NewMedia<'_>) -> Result<i64> {
    let indexed_at = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO media (path, kind, mtime, size, thumb_status, favorite, folder_key, indexed_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)",
        params![
            media.path,
            media.kind,
            media.mtime,
            media.size,
            media.folder_key,
            indexed_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// The file changed on disk: refresh metadata and queue a new thumbnail.
/// The old thumbnail path stays in place until a replacement exists.
pub(crate) fn update_media_file(
    conn: &Connection,
    media_id: i64,
    kind: MediaKind,
    mtime: i64,
    size: i64,
    folder_key: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE media SET kind = ?1, mtime = ?2, size = ?3, folder_key = ?4, thumb_status = 'pending'
         WHERE id = ?5",
        params![kind, mtime, size, folder_key, media_id],
    )?;
    Ok(())
}

pub(crate) fn update_media_folder_key(
    conn: &Connection,
    media_id: i64,
    folder_key: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE media SET folder_key = ?1 WHERE id = ?2",
        params![folder_key, media_id],
    )?;
    Ok(())
}

/// Delete a media row with its album links, clearing covers that showed its
/// thumbnail. Returns the thumbnail path so the caller can remove the file.
pub(crate) fn delete_media(conn: &Connection, media_id: i64) -> Result<Option<String>> {
    let thumb_path: Option<String> = conn
        .query_row(
            "SELECT thumb_path FROM media WHERE id = ?1",
            [media_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    if let Some(ref thumb) = thumb_path {
        conn.execute(
            "UPDATE albums SET cover_path = NULL WHERE cover_path = ?1",
            [thumb],
        )?;
    }
    conn.execute("DELETE FROM album_media WHERE media_id = ?1", [media_id])?;
    conn.execute("DELETE FROM media WHERE id = ?1", [media_id])?;
    Ok(thumb_path)
}

pub(crate) fn insert_album(
    conn: &Connection,
    title: &str,
    folder_key: Option<&str>,
    cover_path: Option<&str>,
) -> Result<i64> {
    let created_at = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO albums (title, cover_path, folder_key, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![title, cover_path, folder_key, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn delete_album(conn: &Connection, album_id: i64) -> Result<()> {
    conn.execute("DELETE FROM album_media WHERE album_id = ?1", [album_id])?;
    conn.execute("DELETE FROM albums WHERE id = ?1", [album_id])?;
    Ok(())
}

pub(crate) fn update_album_folder_key(
    conn: &Connection,
    album_id: i64,
    folder_key: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE albums SET folder_key = ?1 WHERE id = ?2",
        params![folder_key, album_id],
    )?;
    Ok(())
}

pub(crate) fn update_album_cover(
    conn: &Connection,
    album_id: i64,
    cover_path: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE albums SET cover_path = ?1 WHERE id = ?2",
        params![cover_path, album_id],
    )?;
    Ok(())
}

pub(crate) fn insert_link(conn: &Connection, link: &AlbumLink) -> Result<()> {
    conn.execute(
        "INSERT INTO album_media (album_id, media_id, position) VALUES (?1, ?2, ?3)",
        params![link.album_id, link.media_id, link.position],
    )?;
    Ok(())
}

pub(crate) fn delete_link(conn: &Connection, album_id: i64, media_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM album_media WHERE album_id = ?1 AND media_id = ?2",
        params![album_id, media_id],
    )?;
    Ok(())
}

/// Re-point a link from one album to another at a new position.
pub(crate) fn move_link(
    conn: &Connection,
    from_album: i64,
    link: &AlbumLink,
) -> Result<()> {
    conn.execute(
        "UPDATE album_media SET album_id = ?1, position = ?2 WHERE album_id = ?3 AND media_id = ?4",
        params![link.album_id, link.position, from_album, link.media_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media<'a>(path: &'a str, key: Option<&'a str>) -> NewMedia<'a> {
        NewMedia {
            path,
            kind: MediaKind::Image,
            mtime: 100,
            size: 10,
            folder_key: key,
        }
    }

    #[test]
    fn test_escape_like_pattern() {
        assert_eq!(escape_like_pattern("test"), "test");
        assert_eq!(escape_like_pattern("100%"), "100\\%");
        assert_eq!(escape_like_pattern("a_b"), "a\\_b");
        assert_eq!(escape_like_pattern("c:\\path"), "c:\\\\path");
    }

    #[test]
    fn test_migrations_are_rerunnable() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.get_conn().unwrap();
        Database::migrate(&conn).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_delete_media_clears_links_and_covers() {
        let db = Database::open_in_memory().unwrap();
        let (media_id, album_id) = db
            .write(|tx| {
                let media_id = insert_media(tx, &media("/lib/a.jpg", Some("lib")))?;
                let album_id = insert_album(tx, "lib", Some("lib"), None)?;
                insert_link(
                    tx,
                    &AlbumLink {
                        album_id,
                        media_id,
                        position: 0,
                    },
                )?;
                Ok((media_id, album_id))
            })
            .unwrap();
        db.set_thumbnail_ready(media_id, "/thumbs/a.jpg", None)
            .unwrap();
        db.set_album_cover(album_id, Some("/thumbs/a.jpg")).unwrap();

        let removed = db.write(|tx| delete_media(tx, media_id)).unwrap();

        assert_eq!(removed.as_deref(), Some("/thumbs/a.jpg"));
        assert!(db.links_for_album(album_id).unwrap().is_empty());
        assert_eq!(db.album_by_id(album_id).unwrap().unwrap().cover_path, None);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.write(|tx| {
            insert_media(tx, &media("/lib/a.jpg", None))?;
            // Duplicate path violates the unique constraint.
            insert_media(tx, &media("/lib/a.jpg", None))?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(db.all_media().unwrap().is_empty());
    }

    #[test]
    fn test_new_thumbnail_repoints_covers() {
        let db = Database::open_in_memory().unwrap();
        let media_id = db
            .write(|tx| insert_media(tx, &media("/lib/a.jpg", Some("lib"))))
            .unwrap();
        db.set_thumbnail_ready(media_id, "/thumbs/old.jpg", None)
            .unwrap();
        let album_id = db
            .write(|tx| insert_album(tx, "lib", Some("lib"), Some("/thumbs/old.jpg")))
            .unwrap();

        let replaced = db
            .set_thumbnail_ready(media_id, "/thumbs/new.jpg", Some(90))
            .unwrap();

        assert_eq!(replaced.as_deref(), Some("/thumbs/old.jpg"));
        let album = db.album_by_id(album_id).unwrap().unwrap();
        assert_eq!(album.cover_path.as_deref(), Some("/thumbs/new.jpg"));
        let record = db.media_by_id(media_id).unwrap().unwrap();
        assert_eq!(record.thumb_status, ThumbStatus::Ready);
        assert_eq!(record.rotation, Some(90));
    }

    #[test]
    fn test_favorites_and_paging() {
        let db = Database::open_in_memory().unwrap();
        let ids = db
            .write(|tx| {
                let a = insert_media(tx, &media("/lib/a_1.jpg", None))?;
                let b = insert_media(tx, &media("/lib/b%2.jpg", None))?;
                let c = insert_media(
                    tx,
                    &NewMedia {
                        kind: MediaKind::Video,
                        ..media("/lib/c.mp4", None)
                    },
                )?;
                Ok(vec![a, b, c])
            })
            .unwrap();

        assert!(db.set_favorite(ids[0], true).unwrap());
        assert!(db.set_favorite_by_path("/lib/c.mp4", true).unwrap());
        assert!(!db.set_favorite(9999, true).unwrap());
        assert!(!db.toggle_favorite(ids[2]).unwrap());
        assert_eq!(db.favorites().unwrap().len(), 1);

        assert_eq!(db.count_media(None, None).unwrap(), 3);
        assert_eq!(db.count_media(Some(MediaKind::Video), None).unwrap(), 1);
        assert_eq!(db.count_media(None, Some("a_1")).unwrap(), 1);
        assert_eq!(db.count_media(None, Some("%")).unwrap(), 1);

        let page = db.fetch_media_page(0, 2, Some(MediaKind::Image), None).unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_roots_keep_registration_order() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.add_root(Path::new("/b")).unwrap());
        assert!(db.add_root(Path::new("/a")).unwrap());
        assert!(!db.add_root(Path::new("/b")).unwrap());
        assert_eq!(
            db.roots().unwrap(),
            vec![PathBuf::from("/b"), PathBuf::from("/a")]
        );
        assert!(db.remove_root(Path::new("/b")).unwrap());
        assert_eq!(db.roots().unwrap(), vec![PathBuf::from("/a")]);
    }
}
