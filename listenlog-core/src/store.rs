use crate::error::Result;
use crate::model::{Album, Artist, PlaybackContext, Play, StoredPlay, TrackStats};
use crate::time::from_millis;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// How long a write waits for another connection (e.g. `listenlog trigger`) to release the lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = r"
-- One row per listen; the (track_id, played_at_rounded) pair is the dedup key
CREATE TABLE IF NOT EXISTS plays (
    id INTEGER PRIMARY KEY,
    track_id TEXT NOT NULL,
    name TEXT NOT NULL,
    artists TEXT NOT NULL,
    artist_ids TEXT NOT NULL,
    album TEXT NOT NULL,
    album_id TEXT,
    album_art TEXT,
    duration_ms INTEGER NOT NULL,
    played_at INTEGER NOT NULL,
    played_at_rounded INTEGER NOT NULL,
    device_name TEXT,
    device_type TEXT,
    shuffle_state INTEGER,
    context_type TEXT,
    context_uri TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE(track_id, played_at_rounded)
);

-- Exploded artist IDs for lookups by artist
CREATE TABLE IF NOT EXISTS play_artists (
    play_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    artist_id TEXT NOT NULL,
    FOREIGN KEY (play_id) REFERENCES plays(id) ON DELETE CASCADE,
    PRIMARY KEY (play_id, position)
);

CREATE TABLE IF NOT EXISTS tracks (
    track_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    artists TEXT NOT NULL,
    album TEXT NOT NULL,
    album_art TEXT,
    duration_ms INTEGER NOT NULL,
    listen_count INTEGER NOT NULL DEFAULT 0,
    first_listened_at INTEGER NOT NULL,
    last_listened_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS artists (
    artist_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    genres TEXT NOT NULL,
    popularity INTEGER,
    image TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS artist_genres (
    artist_id TEXT NOT NULL,
    genre TEXT NOT NULL,
    FOREIGN KEY (artist_id) REFERENCES artists(artist_id) ON DELETE CASCADE,
    PRIMARY KEY (artist_id, genre)
);

CREATE TABLE IF NOT EXISTS albums (
    album_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    release_date TEXT,
    label TEXT,
    genres TEXT NOT NULL,
    popularity INTEGER,
    image TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_plays_played_at ON plays(played_at);
CREATE INDEX IF NOT EXISTS idx_play_artists_artist ON play_artists(artist_id);
CREATE INDEX IF NOT EXISTS idx_artist_genres_genre ON artist_genres(genre);
";

const PLAY_COLUMNS: &str = "id, track_id, name, artists, artist_ids, album, album_id, album_art,
    duration_ms, played_at, played_at_rounded, device_name, device_type, shuffle_state,
    context_type, context_uri, created_at";

/// How a listen write affects the track's `listen_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountPolicy {
    /// Increment unconditionally (a new-track transition)
    Always,
    /// Increment only when the play row was newly inserted
    IfNewPlay,
    /// Write the play row only; leave the track untouched
    PlayOnly,
}

/// Outcome of writing one listen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenWrite {
    pub play_inserted: bool,
    pub track_created: bool,
    pub counted: bool,
}

/// Play with its JSON columns serialized ahead of the blocking call.
struct PlayRow {
    play: Play,
    artists_json: String,
    artist_ids_json: String,
}

impl PlayRow {
    fn new(play: &Play) -> Result<Self> {
        Ok(Self {
            artists_json: serde_json::to_string(&play.artists)?,
            artist_ids_json: serde_json::to_string(&play.artist_ids)?,
            play: play.clone(),
        })
    }
}

fn to_sql_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn play_from_row(row: &Row<'_>) -> rusqlite::Result<StoredPlay> {
    Ok(StoredPlay {
        id: row.get(0)?,
        play: Play {
            track_id: row.get(1)?,
            name: row.get(2)?,
            artists: json_list(row, 3)?,
            artist_ids: json_list(row, 4)?,
            album: row.get(5)?,
            album_id: row.get(6)?,
            album_art: row.get(7)?,
            duration_ms: from_sql_u64(row.get(8)?),
            played_at: from_millis(row.get(9)?),
            played_at_rounded: Some(from_millis(row.get(10)?)),
            context: PlaybackContext {
                device_name: row.get(11)?,
                device_type: row.get(12)?,
                shuffle_state: row.get(13)?,
                context_type: row.get(14)?,
                context_uri: row.get(15)?,
            },
        },
        created_at: from_millis(row.get(16)?),
    })
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<TrackStats> {
    Ok(TrackStats {
        track_id: row.get(0)?,
        name: row.get(1)?,
        artists: json_list(row, 2)?,
        album: row.get(3)?,
        album_art: row.get(4)?,
        duration_ms: from_sql_u64(row.get(5)?),
        listen_count: from_sql_u64(row.get(6)?),
        first_listened_at: from_millis(row.get(7)?),
        last_listened_at: from_millis(row.get(8)?),
    })
}

fn artist_from_row(row: &Row<'_>) -> rusqlite::Result<Artist> {
    Ok(Artist {
        artist_id: row.get(0)?,
        name: row.get(1)?,
        genres: json_list(row, 2)?,
        popularity: row.get(3)?,
        image: row.get(4)?,
    })
}

/// Begin a transaction that holds the write lock from the start.
///
/// A deferred transaction that reads first cannot upgrade to a writer while another
/// connection writes, and fails instead of waiting out `BUSY_TIMEOUT`.
fn write_transaction(conn: &mut rusqlite::Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

/// Upsert a play by its dedup key. Returns `(play_id, inserted)`.
///
/// Optional fields use `COALESCE` so an absent value keeps what is stored.
fn upsert_play(conn: &rusqlite::Connection, row: &PlayRow, now: i64) -> rusqlite::Result<(i64, bool)> {
    let play = &row.play;
    let bucket = play.bucket().timestamp_millis();

    let existing: Option<i64> = conn
        .prepare_cached("SELECT id FROM plays WHERE track_id = ?1 AND played_at_rounded = ?2")?
        .query_row(params![play.track_id, bucket], |r| r.get(0))
        .optional()?;

    let (play_id, inserted) = if let Some(id) = existing {
        conn.execute(
            r"
            UPDATE plays SET
                name = ?2,
                artists = ?3,
                artist_ids = ?4,
                album = ?5,
                album_id = COALESCE(?6, album_id),
                album_art = COALESCE(?7, album_art),
                duration_ms = ?8,
                played_at = ?9,
                device_name = COALESCE(?10, device_name),
                device_type = COALESCE(?11, device_type),
                shuffle_state = COALESCE(?12, shuffle_state),
                context_type = COALESCE(?13, context_type),
                context_uri = COALESCE(?14, context_uri)
            WHERE id = ?1
        ",
            params![
                id,
                play.name,
                row.artists_json,
                row.artist_ids_json,
                play.album,
                play.album_id,
                play.album_art,
                to_sql_u64(play.duration_ms),
                play.played_at.timestamp_millis(),
                play.context.device_name,
                play.context.device_type,
                play.context.shuffle_state,
                play.context.context_type,
                play.context.context_uri,
            ],
        )?;
        conn.execute("DELETE FROM play_artists WHERE play_id = ?1", params![id])?;
        (id, false)
    } else {
        conn.execute(
            r"
            INSERT INTO plays (track_id, name, artists, artist_ids, album, album_id, album_art,
                               duration_ms, played_at, played_at_rounded, device_name, device_type,
                               shuffle_state, context_type, context_uri, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        ",
            params![
                play.track_id,
                play.name,
                row.artists_json,
                row.artist_ids_json,
                play.album,
                play.album_id,
                play.album_art,
                to_sql_u64(play.duration_ms),
                play.played_at.timestamp_millis(),
                bucket,
                play.context.device_name,
                play.context.device_type,
                play.context.shuffle_state,
                play.context.context_type,
                play.context.context_uri,
                now,
            ],
        )?;
        (conn.last_insert_rowid(), true)
    };

    let mut stmt = conn.prepare_cached(
        "INSERT INTO play_artists (play_id, position, artist_id) VALUES (?1, ?2, ?3)",
    )?;
    for (position, artist_id) in (0_i64..).zip(&play.artist_ids) {
        stmt.execute(params![play_id, position, artist_id])?;
    }

    Ok((play_id, inserted))
}

/// Upsert track metadata, adding `increment` to its listen count. Returns whether the row was created.
fn upsert_track(conn: &rusqlite::Connection, row: &PlayRow, increment: i64) -> rusqlite::Result<bool> {
    let play = &row.play;
    let played_at = play.played_at.timestamp_millis();

    let updated = conn.execute(
        r"
        UPDATE tracks SET
            name = ?2,
            artists = ?3,
            album = ?4,
            album_art = COALESCE(?5, album_art),
            duration_ms = ?6,
            listen_count = listen_count + ?7,
            first_listened_at = MIN(first_listened_at, ?8),
            last_listened_at = MAX(last_listened_at, ?8)
        WHERE track_id = ?1
    ",
        params![
            play.track_id,
            play.name,
            row.artists_json,
            play.album,
            play.album_art,
            to_sql_u64(play.duration_ms),
            increment,
            played_at,
        ],
    )?;

    if updated > 0 {
        return Ok(false);
    }

    conn.execute(
        r"
        INSERT INTO tracks (track_id, name, artists, album, album_art, duration_ms,
                            listen_count, first_listened_at, last_listened_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
    ",
        params![
            play.track_id,
            play.name,
            row.artists_json,
            play.album,
            play.album_art,
            to_sql_u64(play.duration_ms),
            increment,
            played_at,
        ],
    )?;
    Ok(true)
}

fn write_listen(
    conn: &rusqlite::Connection,
    row: &PlayRow,
    policy: CountPolicy,
    now: i64,
) -> rusqlite::Result<ListenWrite> {
    let (_, play_inserted) = upsert_play(conn, row, now)?;

    let counted = match policy {
        CountPolicy::Always => true,
        CountPolicy::IfNewPlay => play_inserted,
        CountPolicy::PlayOnly => {
            return Ok(ListenWrite {
                play_inserted,
                track_created: false,
                counted: false,
            })
        }
    };

    let track_created = upsert_track(conn, row, i64::from(counted))?;
    Ok(ListenWrite {
        play_inserted,
        track_created,
        counted,
    })
}

/// SQLite-backed durable store for plays, tracks, artists and albums
pub struct ListenStore {
    conn: Connection,
}

impl ListenStore {
    /// Open a store at a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub async fn open(path: &Path) -> Result<Self> {
        info!("Opening listen database at {:?}", path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    /// Open a private in-memory store
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch(SCHEMA_SQL)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        })
        .await?;

        info!("Listen database initialized");
        Ok(Self { conn })
    }

    /// Write one listen atomically (play row, then track aggregate).
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn upsert_listen(&self, play: &Play, policy: CountPolicy) -> Result<ListenWrite> {
        let row = PlayRow::new(play)?;
        let now = Utc::now().timestamp_millis();
        debug!(
            "Upserting listen {} @ {} ({:?})",
            row.play.track_id,
            row.play.bucket(),
            policy
        );

        self.conn
            .call(move |conn| {
                let tx = write_transaction(conn)?;
                let write = write_listen(&tx, &row, policy, now)?;
                tx.commit()?;
                Ok(write)
            })
            .await
            .map_err(Into::into)
    }

    /// Write a batch of listens in one transaction, one upsert per play.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails; the whole batch is rolled back.
    pub async fn upsert_listens(
        &self,
        plays: &[Play],
        policy: CountPolicy,
    ) -> Result<Vec<ListenWrite>> {
        let rows = plays.iter().map(PlayRow::new).collect::<Result<Vec<_>>>()?;
        let now = Utc::now().timestamp_millis();

        self.conn
            .call(move |conn| {
                let tx = write_transaction(conn)?;
                let writes = rows
                    .iter()
                    .map(|row| write_listen(&tx, row, policy, now))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                tx.commit()?;
                Ok(writes)
            })
            .await
            .map_err(Into::into)
    }

    /// Look up aggregate stats for a track
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn track(&self, track_id: &str) -> Result<Option<TrackStats>> {
        let track_id = track_id.to_string();
        self.conn
            .call(move |conn| {
                let track = conn
                    .prepare_cached(
                        r"
                        SELECT track_id, name, artists, album, album_art, duration_ms,
                               listen_count, first_listened_at, last_listened_at
                        FROM tracks WHERE track_id = ?1
                    ",
                    )?
                    .query_row(params![track_id], track_from_row)
                    .optional()?;
                Ok(track)
            })
            .await
            .map_err(Into::into)
    }

    /// All plays of a track, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn plays_for_track(&self, track_id: &str) -> Result<Vec<StoredPlay>> {
        let track_id = track_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {PLAY_COLUMNS} FROM plays WHERE track_id = ?1 ORDER BY played_at_rounded"
                ))?;
                let plays = stmt
                    .query_map(params![track_id], play_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(plays)
            })
            .await
            .map_err(Into::into)
    }

    /// Most recent plays, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn recent_plays(&self, limit: u32) -> Result<Vec<StoredPlay>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {PLAY_COLUMNS} FROM plays ORDER BY played_at DESC LIMIT ?1"
                ))?;
                let plays = stmt
                    .query_map(params![limit], play_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(plays)
            })
            .await
            .map_err(Into::into)
    }

    /// Most recent plays crediting an artist, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn plays_by_artist(&self, artist_id: &str, limit: u32) -> Result<Vec<StoredPlay>> {
        let artist_id = artist_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    r"
                    SELECT {PLAY_COLUMNS} FROM plays
                    WHERE id IN (SELECT play_id FROM play_artists WHERE artist_id = ?1)
                    ORDER BY played_at DESC
                    LIMIT ?2
                "
                ))?;
                let plays = stmt
                    .query_map(params![artist_id, limit], play_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(plays)
            })
            .await
            .map_err(Into::into)
    }

    /// Total number of stored plays
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn play_count(&self) -> Result<u64> {
        self.conn
            .call(|conn| {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM plays", [], |r| r.get(0))?;
                Ok(from_sql_u64(count))
            })
            .await
            .map_err(Into::into)
    }

    /// Artist IDs referenced by plays but absent from the artists table
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn missing_artist_ids(&self, limit: u32) -> Result<Vec<String>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    r"
                    SELECT DISTINCT pa.artist_id
                    FROM play_artists pa
                    LEFT JOIN artists a ON a.artist_id = pa.artist_id
                    WHERE a.artist_id IS NULL
                    ORDER BY pa.artist_id
                    LIMIT ?1
                ",
                )?;
                let ids = stmt
                    .query_map(params![limit], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(ids)
            })
            .await
            .map_err(Into::into)
    }

    /// Subset of `ids` with no artist row yet, in input order
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn unknown_artists(&self, ids: &[String]) -> Result<Vec<String>> {
        let ids = ids.to_vec();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached("SELECT 1 FROM artists WHERE artist_id = ?1")?;
                let mut missing = Vec::new();
                for id in ids {
                    if !stmt.exists(params![id])? && !missing.contains(&id) {
                        missing.push(id);
                    }
                }
                Ok(missing)
            })
            .await
            .map_err(Into::into)
    }

    /// Insert artists that do not exist yet. Existing rows are never updated.
    ///
    /// Returns the number of rows inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn insert_artists(&self, artists: &[Artist]) -> Result<usize> {
        let rows = artists
            .iter()
            .map(|a| Ok((a.clone(), serde_json::to_string(&a.genres)?)))
            .collect::<Result<Vec<_>>>()?;
        let now = Utc::now().timestamp_millis();

        self.conn
            .call(move |conn| {
                let tx = write_transaction(conn)?;
                let mut inserted = 0;
                {
                    let mut artist_stmt = tx.prepare_cached(
                        r"
                        INSERT OR IGNORE INTO artists (artist_id, name, genres, popularity, image, created_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ",
                    )?;
                    let mut genre_stmt = tx.prepare_cached(
                        "INSERT OR IGNORE INTO artist_genres (artist_id, genre) VALUES (?1, ?2)",
                    )?;
                    for (artist, genres_json) in &rows {
                        let changed = artist_stmt.execute(params![
                            artist.artist_id,
                            artist.name,
                            genres_json,
                            artist.popularity,
                            artist.image,
                            now,
                        ])?;
                        if changed == 0 {
                            continue;
                        }
                        inserted += 1;
                        for genre in &artist.genres {
                            genre_stmt.execute(params![artist.artist_id, genre])?;
                        }
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await
            .map_err(Into::into)
    }

    /// Look up one artist
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn artist(&self, artist_id: &str) -> Result<Option<Artist>> {
        let artist_id = artist_id.to_string();
        self.conn
            .call(move |conn| {
                let artist = conn
                    .prepare_cached(
                        "SELECT artist_id, name, genres, popularity, image FROM artists WHERE artist_id = ?1",
                    )?
                    .query_row(params![artist_id], artist_from_row)
                    .optional()?;
                Ok(artist)
            })
            .await
            .map_err(Into::into)
    }

    /// Artists tagged with a genre, by name
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn artists_by_genre(&self, genre: &str) -> Result<Vec<Artist>> {
        let genre = genre.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    r"
                    SELECT a.artist_id, a.name, a.genres, a.popularity, a.image
                    FROM artists a
                    INNER JOIN artist_genres g ON g.artist_id = a.artist_id
                    WHERE g.genre = ?1
                    ORDER BY a.name
                ",
                )?;
                let artists = stmt
                    .query_map(params![genre], artist_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(artists)
            })
            .await
            .map_err(Into::into)
    }

    /// Whether an album row exists
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn has_album(&self, album_id: &str) -> Result<bool> {
        let album_id = album_id.to_string();
        self.conn
            .call(move |conn| {
                let exists = conn
                    .prepare_cached("SELECT 1 FROM albums WHERE album_id = ?1")?
                    .exists(params![album_id])?;
                Ok(exists)
            })
            .await
            .map_err(Into::into)
    }

    /// Insert an album unless it already exists. Returns whether a row was inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn insert_album(&self, album: &Album) -> Result<bool> {
        let genres_json = serde_json::to_string(&album.genres)?;
        let album = album.clone();
        let now = Utc::now().timestamp_millis();

        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    r"
                    INSERT OR IGNORE INTO albums (album_id, name, release_date, label, genres,
                                                  popularity, image, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                    params![
                        album.album_id,
                        album.name,
                        album.release_date,
                        album.label,
                        genres_json,
                        album.popularity,
                        album.image,
                        now,
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    /// Look up one album
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn album(&self, album_id: &str) -> Result<Option<Album>> {
        let album_id = album_id.to_string();
        self.conn
            .call(move |conn| {
                let album = conn
                    .prepare_cached(
                        r"
                        SELECT album_id, name, release_date, label, genres, popularity, image
                        FROM albums WHERE album_id = ?1
                    ",
                    )?
                    .query_row(params![album_id], |row| {
                        Ok(Album {
                            album_id: row.get(0)?,
                            name: row.get(1)?,
                            release_date: row.get(2)?,
                            label: row.get(3)?,
                            genres: json_list(row, 4)?,
                            popularity: row.get(5)?,
                            image: row.get(6)?,
                        })
                    })
                    .optional()?;
                Ok(album)
            })
            .await
            .map_err(Into::into)
    }

    /// Checkpoint WAL for clean shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the WAL checkpoint fails.
    pub async fn checkpoint(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Run raw SQL against the connection, e.g. to install a failing trigger.
    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &'static str) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(sql)?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{album, artist, play_at};

    #[tokio::test]
    async fn test_same_bucket_collapses_to_one_play() {
        let store = ListenStore::open_in_memory().await.unwrap();

        let first = store
            .upsert_listen(&play_at("t1", 12, 0, 5), CountPolicy::IfNewPlay)
            .await
            .unwrap();
        let second = store
            .upsert_listen(&play_at("t1", 12, 0, 42), CountPolicy::IfNewPlay)
            .await
            .unwrap();

        assert!(first.play_inserted);
        assert!(!second.play_inserted);
        assert_eq!(store.play_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_converge_without_lock_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listens.db");
        let daemon = ListenStore::open(&path).await.unwrap();
        let trigger = ListenStore::open(&path).await.unwrap();

        let mut inserted = 0;
        for minute in 0..50 {
            let play = play_at("t1", 12, minute, 5);
            let (a, b) = tokio::join!(
                daemon.upsert_listen(&play, CountPolicy::IfNewPlay),
                trigger.upsert_listen(&play, CountPolicy::IfNewPlay),
            );
            let (a, b) = (a.unwrap(), b.unwrap());
            assert_ne!(a.play_inserted, b.play_inserted);
            inserted += usize::from(a.play_inserted) + usize::from(b.play_inserted);
        }

        assert_eq!(inserted, 50);
        assert_eq!(daemon.play_count().await.unwrap(), 50);
        assert_eq!(trigger.track("t1").await.unwrap().unwrap().listen_count, 50);
    }

    #[tokio::test]
    async fn test_absent_optional_fields_do_not_overwrite() {
        let store = ListenStore::open_in_memory().await.unwrap();

        let mut with_device = play_at("t1", 12, 0, 5);
        with_device.context.device_name = Some("Kitchen".into());
        with_device.context.shuffle_state = Some(true);
        store
            .upsert_listen(&with_device, CountPolicy::Always)
            .await
            .unwrap();

        let mut without_device = play_at("t1", 12, 0, 30);
        without_device.album_art = None;
        without_device.context.context_type = Some("album".into());
        store
            .upsert_listen(&without_device, CountPolicy::PlayOnly)
            .await
            .unwrap();

        let plays = store.plays_for_track("t1").await.unwrap();
        assert_eq!(plays.len(), 1);
        let stored = &plays[0].play;
        assert_eq!(stored.context.device_name.as_deref(), Some("Kitchen"));
        assert_eq!(stored.context.shuffle_state, Some(true));
        assert_eq!(stored.context.context_type.as_deref(), Some("album"));
        assert!(stored.album_art.is_some());
        assert_eq!(stored.played_at, without_device.played_at);
    }

    #[tokio::test]
    async fn test_count_policies() {
        let store = ListenStore::open_in_memory().await.unwrap();

        let created = store
            .upsert_listen(&play_at("t1", 12, 0, 5), CountPolicy::Always)
            .await
            .unwrap();
        assert!(created.track_created);
        assert!(created.counted);

        // Duplicate under IfNewPlay refreshes metadata only
        let dup = store
            .upsert_listen(&play_at("t1", 12, 0, 20), CountPolicy::IfNewPlay)
            .await
            .unwrap();
        assert!(!dup.counted);
        assert!(!dup.track_created);

        // PlayOnly never touches the track
        let refresh = store
            .upsert_listen(&play_at("t1", 12, 5, 0), CountPolicy::PlayOnly)
            .await
            .unwrap();
        assert!(refresh.play_inserted);
        assert!(!refresh.counted);

        let track = store.track("t1").await.unwrap().unwrap();
        assert_eq!(track.listen_count, 1);
        assert_eq!(store.plays_for_track("t1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_reports_per_play_outcome() {
        let store = ListenStore::open_in_memory().await.unwrap();
        store
            .upsert_listen(&play_at("t1", 12, 0, 5), CountPolicy::Always)
            .await
            .unwrap();

        let writes = store
            .upsert_listens(
                &[play_at("t1", 12, 0, 50), play_at("t2", 12, 4, 0)],
                CountPolicy::IfNewPlay,
            )
            .await
            .unwrap();

        assert!(!writes[0].play_inserted);
        assert!(writes[1].play_inserted);
        assert!(writes[1].track_created);
        assert_eq!(store.play_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_track_timestamps_span_history() {
        let store = ListenStore::open_in_memory().await.unwrap();
        store
            .upsert_listen(&play_at("t1", 12, 10, 0), CountPolicy::Always)
            .await
            .unwrap();
        store
            .upsert_listen(&play_at("t1", 11, 0, 0), CountPolicy::IfNewPlay)
            .await
            .unwrap();

        let track = store.track("t1").await.unwrap().unwrap();
        assert_eq!(track.listen_count, 2);
        assert!(track.first_listened_at < track.last_listened_at);
    }

    #[tokio::test]
    async fn test_missing_artists_and_first_write_wins() {
        let store = ListenStore::open_in_memory().await.unwrap();
        store
            .upsert_listen(&play_at("t1", 12, 0, 0), CountPolicy::Always)
            .await
            .unwrap();

        let missing = store.missing_artist_ids(50).await.unwrap();
        assert_eq!(missing, vec!["artist-t1".to_string()]);

        let inserted = store
            .insert_artists(&[artist("artist-t1", "First")])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let again = store
            .insert_artists(&[artist("artist-t1", "Renamed")])
            .await
            .unwrap();
        assert_eq!(again, 0);

        let stored = store.artist("artist-t1").await.unwrap().unwrap();
        assert_eq!(stored.name, "First");
        assert!(store.missing_artist_ids(50).await.unwrap().is_empty());
        assert_eq!(store.artists_by_genre("shoegaze").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_artists_dedupes_input() {
        let store = ListenStore::open_in_memory().await.unwrap();
        store.insert_artists(&[artist("a1", "Known")]).await.unwrap();

        let unknown = store
            .unknown_artists(&["a1".into(), "a2".into(), "a2".into()])
            .await
            .unwrap();
        assert_eq!(unknown, vec!["a2".to_string()]);
    }

    #[tokio::test]
    async fn test_plays_by_artist_uses_exploded_ids() {
        let store = ListenStore::open_in_memory().await.unwrap();
        store
            .upsert_listen(&play_at("t1", 12, 0, 0), CountPolicy::Always)
            .await
            .unwrap();
        store
            .upsert_listen(&play_at("t2", 12, 3, 0), CountPolicy::Always)
            .await
            .unwrap();

        let plays = store.plays_by_artist("artist-t2", 10).await.unwrap();
        assert_eq!(plays.len(), 1);
        assert_eq!(plays[0].play.track_id, "t2");
        assert_eq!(store.recent_plays(10).await.unwrap()[0].play.track_id, "t2");
    }

    #[tokio::test]
    async fn test_album_insert_once() {
        let store = ListenStore::open_in_memory().await.unwrap();
        assert!(!store.has_album("al1").await.unwrap());
        assert!(store.insert_album(&album("al1")).await.unwrap());
        assert!(!store.insert_album(&album("al1")).await.unwrap());
        assert!(store.has_album("al1").await.unwrap());
        assert_eq!(store.album("al1").await.unwrap().unwrap().genres, vec!["indie"]);
    }
}
