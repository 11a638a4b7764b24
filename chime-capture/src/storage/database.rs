use async_trait::async_trait;
use camino::Utf8Path;
use libsql::Connection;
use time::format_description::well_known::Rfc3339;

use crate::event::EventRecord;
use crate::storage::{SaveOutcome, Storage, StorageError, VideoMetadata, VideoSource};

/// We use the 'user_version' value to store the migration state.
/// It's a very lightweight approach as it is just an integer at a fixed
/// offset in the SQLite file.
/// - <https://sqlite.org/pragma.html#pragma_user_version>
const MIGRATIONS: &[&str] = &["CREATE TABLE events (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        created_at TEXT NOT NULL,
        device_id TEXT NOT NULL,
        device_name TEXT NOT NULL,
        has_video INTEGER NOT NULL DEFAULT 0,
        video_path TEXT,
        payload TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX events_device_id_idx ON events (device_id);"];

const PRAGMAS: &str = "
    -- https://www.sqlite.org/pragma.html#pragma_journal_mode
    -- WAL mode plays well with a single long-running writer process.
    PRAGMA journal_mode = WAL;

    -- https://www.sqlite.org/pragma.html#pragma_synchronous
    -- journal_mode WAL + synchronous NORMAL is a good combination.
    PRAGMA synchronous = NORMAL;

    -- https://www.sqlite.org/pragma.html#pragma_busy_timeout
    -- Wait for locked resources instead of failing with SQLITE_BUSY.
    PRAGMA busy_timeout = 15000;
";

/// Relational event index backed by libSQL.
///
/// Standard fields live in their own columns; kind-specific and passthrough
/// fields are folded into the `payload` JSON column.
pub struct DatabaseStorage {
    _db: libsql::Database,
    conn: Connection,
}

impl DatabaseStorage {
    pub async fn open(path: &Utf8Path) -> Result<Self, StorageError> {
        Self::open_inner(path.as_str()).await
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::open_inner(":memory:").await
    }

    async fn open_inner(path: &str) -> Result<Self, StorageError> {
        let db = libsql::Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        let storage = Self { _db: db, conn };
        storage.apply_pragmas().await?;
        storage.migrate().await?;

        Ok(storage)
    }

    async fn apply_pragmas(&self) -> Result<(), StorageError> {
        trace!(sql_query = %PRAGMAS, "PRAGMAs query");

        let mut batch_rows = self.conn.execute_batch(PRAGMAS).await?;

        while let Some(rows) = batch_rows.next_stmt_row() {
            let Some(mut rows) = rows else {
                continue;
            };

            while let Ok(Some(row)) = rows.next().await {
                trace!(?row, "PRAGMA row");
            }
        }

        Ok(())
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        let user_version = self.query_user_version().await?;

        match MIGRATIONS.get(user_version..) {
            Some(remaining) if !remaining.is_empty() => {
                info!(
                    user_version,
                    migration_count = MIGRATIONS.len() - user_version,
                    "Start migration"
                );

                for (sql_query, migration_id) in remaining.iter().zip(user_version..MIGRATIONS.len()) {
                    trace!(migration_id, %sql_query, "Apply migration");

                    self.conn.execute_batch(sql_query).await?;

                    self.update_user_version(migration_id + 1).await?;
                }

                info!("Migration complete");
            }
            None => {
                warn!(user_version, "user_version is set to an unexpected value");
            }
            _ => {
                debug!(user_version, "Database is already up to date");
            }
        }

        Ok(())
    }

    async fn query_user_version(&self) -> Result<usize, StorageError> {
        let row = self
            .conn
            .query("PRAGMA user_version", ())
            .await?
            .next()
            .await?
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("no row returned for user_version")))?;

        let value = row.get::<u64>(0)?;

        Ok(usize::try_from(value).expect("number not too big"))
    }

    async fn update_user_version(&self, value: usize) -> Result<(), StorageError> {
        let value = u64::try_from(value).expect("number not too big");
        self.conn
            .execute(&format!("PRAGMA user_version = {value}"), ())
            .await?;
        Ok(())
    }
}

fn payload_json(record: &EventRecord) -> Result<String, StorageError> {
    let mut payload = serde_json::Map::new();

    if let Some(answered) = record.answered {
        payload.insert("answered".to_owned(), serde_json::Value::Bool(answered));
    }
    if let Some(score) = record.motion_detection_score {
        payload.insert("motion_detection_score".to_owned(), serde_json::json!(score));
    }
    if let Some(requester) = &record.requester {
        payload.insert("requester".to_owned(), serde_json::json!(requester));
    }
    for (key, value) in &record.extra {
        payload.insert(key.clone(), value.clone());
    }

    Ok(serde_json::to_string(&payload)?)
}

fn record_from_row(row: &libsql::Row) -> Result<EventRecord, StorageError> {
    let id = row.get::<String>(0)?;
    let kind = row.get::<String>(1)?;
    let created_at = row.get::<String>(2)?;
    let device_id = row.get::<String>(3)?;
    let device_name = row.get::<String>(4)?;
    let has_video = row.get::<i64>(5)? != 0;
    let video_path = match row.get_value(6)? {
        libsql::Value::Text(text) => Some(text),
        _ => None,
    };
    let payload = row.get::<String>(7)?;

    let mut map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&payload)?;
    map.insert("id".to_owned(), serde_json::json!(id));
    map.insert("kind".to_owned(), serde_json::json!(kind));
    map.insert("created_at".to_owned(), serde_json::json!(created_at));
    map.insert("device_id".to_owned(), serde_json::json!(device_id));
    map.insert("device_name".to_owned(), serde_json::json!(device_name));
    map.insert("has_video".to_owned(), serde_json::json!(has_video));
    if let Some(video_path) = video_path {
        map.insert("video_path".to_owned(), serde_json::json!(video_path));
    }

    let record = serde_json::from_value(serde_json::Value::Object(map))?;

    Ok(record)
}

#[async_trait]
impl Storage for DatabaseStorage {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn save_event(&self, record: &EventRecord) -> Result<SaveOutcome, StorageError> {
        let created_at = record
            .created_at
            .format(&Rfc3339)
            .map_err(|e| StorageError::Other(anyhow::Error::new(e).context("format created_at")))?;
        let payload = payload_json(record)?;

        let video_path = match &record.video_path {
            Some(path) => libsql::Value::Text(path.clone()),
            None => libsql::Value::Null,
        };

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO events (id, kind, created_at, device_id, device_name, has_video, video_path, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                libsql::params![
                    record.id.clone(),
                    record.kind.as_str(),
                    created_at,
                    record.device_id.clone(),
                    record.device_name.clone(),
                    i64::from(record.has_video),
                    video_path.clone(),
                    payload.clone(),
                ],
            )
            .await?;

        if inserted > 0 {
            return Ok(SaveOutcome::Saved);
        }

        // The row exists: update the mutable fields. `kind` is immutable and
        // `has_video` only ever goes from 0 to 1.
        self.conn
            .execute(
                "UPDATE events
                 SET has_video = has_video OR ?2,
                     video_path = COALESCE(?3, video_path),
                     device_name = ?4,
                     payload = ?5
                 WHERE id = ?1",
                libsql::params![
                    record.id.clone(),
                    i64::from(record.has_video),
                    video_path,
                    record.device_name.clone(),
                    payload,
                ],
            )
            .await?;

        Ok(SaveOutcome::AlreadyExists)
    }

    async fn retrieve_event(&self, event_id: &str) -> Result<Option<EventRecord>, StorageError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, kind, created_at, device_id, device_name, has_video, video_path, payload
                 FROM events WHERE id = ?1",
                libsql::params![event_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(record_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_video(
        &self,
        event_id: &str,
        source: VideoSource,
        _metadata: Option<&VideoMetadata>,
    ) -> Result<String, StorageError> {
        // The relational index only ever stores a reference.
        let reference = match source {
            VideoSource::Bytes(_) => return Err(StorageError::UnsupportedVideoSource),
            VideoSource::Path(path) => path.into_string(),
            VideoSource::Url(url) => url.to_string(),
        };

        self.conn
            .execute(
                "UPDATE events SET has_video = 1, video_path = ?2 WHERE id = ?1",
                libsql::params![event_id, reference.clone()],
            )
            .await?;

        Ok(reference)
    }

    async fn retrieve_video(&self, event_id: &str) -> Result<Option<String>, StorageError> {
        let mut rows = self
            .conn
            .query(
                "SELECT video_path FROM events WHERE id = ?1 AND has_video = 1",
                libsql::params![event_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get::<Option<String>>(0)?),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        // libsql releases its handles on drop; nothing to flush here.
        debug!("Database storage closed");
        Ok(())
    }
}
