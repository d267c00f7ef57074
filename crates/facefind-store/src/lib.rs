//! facefind-store: SQLite persistence for face encodings.
//!
//! One database holds two tables: `face_encodings`, keyed by
//! `(photo_id, face_index)` with the embedding as a little-endian `f32` BLOB,
//! and `indexed_photos`, the per-photo stamp behind the "indexed" flag.
//! Vector search is exact: every encoding of the requested model version is
//! scored by cosine distance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facefind_core::store::{exact_nearest, EncodingStore, IndexStamp, PhotoCatalog, VectorQuery, VectorSearch};
use facefind_core::{FaceEncoding, MatchCandidate, PhotoId, StoreError};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS face_encodings (
    photo_id TEXT NOT NULL,
    face_index INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    box_x INTEGER NOT NULL,
    box_y INTEGER NOT NULL,
    box_width INTEGER NOT NULL,
    box_height INTEGER NOT NULL,
    quality_score REAL NOT NULL,
    model_version TEXT NOT NULL,
    PRIMARY KEY(photo_id, face_index)
);

CREATE INDEX IF NOT EXISTS idx_face_encodings_model
    ON face_encodings(model_version);

CREATE TABLE IF NOT EXISTS indexed_photos (
    photo_id TEXT PRIMARY KEY NOT NULL,
    model_version TEXT NOT NULL,
    content_digest TEXT NOT NULL,
    face_count INTEGER NOT NULL,
    indexed_at TEXT NOT NULL
);
";

/// SQLite-backed [`EncodingStore`], [`PhotoCatalog`] and [`VectorSearch`].
///
/// All statements run on the connection's background thread.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }

        let conn = Connection::open(path).await.map_err(store_error)?;
        conn.call(|conn| {
            let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(journal_mode = %mode, "sqlite journal mode");
            Ok(())
        })
        .await
        .map_err(store_error)?;

        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "face store opened");
        Ok(store)
    }

    /// Private in-memory database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(store_error)?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA_SQL)?;
                Ok(())
            })
            .await
            .map_err(store_error)
    }

    /// Number of encodings across all photos.
    pub async fn total_encodings(&self) -> Result<usize, StoreError> {
        self.conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM face_encodings", [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .await
            .map_err(store_error)
    }
}

#[async_trait]
impl EncodingStore for SqliteStore {
    async fn replace_encodings(&self, photo_id: &str, encodings: &[FaceEncoding]) -> Result<(), StoreError> {
        if let Some(stray) = encodings.iter().find(|e| e.photo_id != photo_id) {
            return Err(StoreError::Rejected(format!(
                "encoding for {} in batch for {photo_id}",
                stray.photo_id
            )));
        }

        let photo_id = photo_id.to_string();
        let encodings = encodings.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM face_encodings WHERE photo_id = ?1", params![photo_id])?;
                {
                    let mut insert = tx.prepare(
                        "INSERT INTO face_encodings (
                            photo_id, face_index, embedding, box_x, box_y, box_width, box_height,
                            quality_score, model_version
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )?;
                    for e in &encodings {
                        let rect = e.bounding_box;
                        insert.execute(params![
                            e.photo_id,
                            e.face_index,
                            encode_embedding(&e.embedding),
                            rect.x,
                            rect.y,
                            rect.width,
                            rect.height,
                            e.quality_score as f64,
                            e.model_version,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(store_error)
    }

    async fn delete_encodings(&self, photo_id: &str) -> Result<usize, StoreError> {
        let photo_id = photo_id.to_string();
        self.conn
            .call(move |conn| Ok(conn.execute("DELETE FROM face_encodings WHERE photo_id = ?1", params![photo_id])?))
            .await
            .map_err(store_error)
    }

    async fn count_encodings(&self, photo_id: &str) -> Result<usize, StoreError> {
        let photo_id = photo_id.to_string();
        self.conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM face_encodings WHERE photo_id = ?1",
                    params![photo_id],
                    |row| row.get(0),
                )?;
                Ok(n as usize)
            })
            .await
            .map_err(store_error)
    }
}

#[async_trait]
impl PhotoCatalog for SqliteStore {
    async fn index_stamp(&self, photo_id: &str) -> Result<Option<IndexStamp>, StoreError> {
        let photo_id = photo_id.to_string();
        self.conn
            .call(move |conn| {
                let stamp = conn
                    .query_row(
                        "SELECT model_version, content_digest, face_count, indexed_at
                         FROM indexed_photos WHERE photo_id = ?1",
                        params![photo_id],
                        decode_stamp_row,
                    )
                    .optional()?;
                Ok(stamp)
            })
            .await
            .map_err(store_error)
    }

    async fn mark_indexed(&self, photo_id: &str, stamp: &IndexStamp) -> Result<(), StoreError> {
        let photo_id = photo_id.to_string();
        let stamp = stamp.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO indexed_photos (photo_id, model_version, content_digest, face_count, indexed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(photo_id) DO UPDATE SET
                        model_version = excluded.model_version,
                        content_digest = excluded.content_digest,
                        face_count = excluded.face_count,
                        indexed_at = excluded.indexed_at",
                    params![
                        photo_id,
                        stamp.model_version,
                        stamp.content_digest,
                        stamp.face_count,
                        stamp.indexed_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(store_error)
    }

    async fn clear_indexed(&self, photo_id: &str) -> Result<(), StoreError> {
        let photo_id = photo_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM indexed_photos WHERE photo_id = ?1", params![photo_id])?;
                Ok(())
            })
            .await
            .map_err(store_error)
    }

    async fn stale_photos(&self, model_version: &str) -> Result<Vec<PhotoId>, StoreError> {
        let model_version = model_version.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT photo_id FROM indexed_photos WHERE model_version != ?1 ORDER BY photo_id",
                )?;
                let ids = stmt
                    .query_map(params![model_version], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<PhotoId>>>()?;
                Ok(ids)
            })
            .await
            .map_err(store_error)
    }
}

#[async_trait]
impl VectorSearch for SqliteStore {
    async fn nearest(&self, query: &VectorQuery) -> Result<Vec<MatchCandidate>, StoreError> {
        let query = query.clone();
        let candidates = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT photo_id, embedding FROM face_encodings WHERE model_version = ?1")?;
                let rows = stmt
                    .query_map(params![query.model_version], |row| {
                        let photo_id: String = row.get(0)?;
                        let blob: Vec<u8> = row.get(1)?;
                        Ok((photo_id, decode_embedding(&blob, 1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<(String, Vec<f32>)>>>()?;
                Ok(exact_nearest(rows.iter().map(|(id, e)| (id.as_str(), e.as_slice())), &query))
            })
            .await
            .map_err(store_error)?;

        tracing::debug!(candidates = candidates.len(), "exact vector search");
        Ok(candidates)
    }
}

fn decode_stamp_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexStamp> {
    let indexed_at: String = row.get(3)?;
    let indexed_at = DateTime::parse_from_rfc3339(&indexed_at)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err)))?
        .with_timezone(&Utc);
    Ok(IndexStamp {
        model_version: row.get(0)?,
        content_digest: row.get(1)?,
        face_count: row.get(2)?,
        indexed_at,
    })
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// `column` is only used for error reporting.
fn decode_embedding(blob: &[u8], column: usize) -> rusqlite::Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Blob,
            format!("embedding blob of {} bytes is not a whole number of f32", blob.len()).into(),
        ));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn store_error(err: tokio_rusqlite::Error) -> StoreError {
    match err {
        tokio_rusqlite::Error::Rusqlite(err) => sqlite_error(err),
        tokio_rusqlite::Error::ConnectionClosed => StoreError::Unavailable("connection closed".into()),
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn sqlite_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == rusqlite::ErrorCode::ConstraintViolation => {
            StoreError::Rejected(err.to_string())
        }
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
            StoreError::Corrupt(err.to_string())
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facefind_core::PixelRect;

    fn encoding(photo: &str, index: u32, embedding: Vec<f32>, version: &str) -> FaceEncoding {
        FaceEncoding {
            photo_id: photo.into(),
            face_index: index,
            embedding,
            bounding_box: PixelRect { x: 4, y: 8, width: 40, height: 48 },
            quality_score: 0.87,
            model_version: version.into(),
        }
    }

    fn stamp(version: &str) -> IndexStamp {
        IndexStamp {
            model_version: version.into(),
            content_digest: "ab12".into(),
            face_count: 2,
            indexed_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc),
        }
    }

    #[test]
    fn test_embedding_blob_is_little_endian() {
        let blob = encode_embedding(&[1.0, -0.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_embedding(&blob, 1).unwrap(), vec![1.0, -0.5]);
        assert!(decode_embedding(&blob[..6], 1).is_err());
    }

    #[tokio::test]
    async fn test_replace_is_atomic_and_idempotent() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let batch = vec![
            encoding("p1", 0, vec![1.0, 0.0], "v1"),
            encoding("p1", 1, vec![0.0, 1.0], "v1"),
        ];
        store.replace_encodings("p1", &batch).await.unwrap();
        store.replace_encodings("p1", &batch).await.unwrap();
        assert_eq!(store.count_encodings("p1").await.unwrap(), 2);

        // The duplicate key fails the insert; the transaction rolls back.
        let dup = vec![encoding("p1", 0, vec![1.0, 0.0], "v2"), encoding("p1", 0, vec![1.0, 0.0], "v2")];
        let err = store.replace_encodings("p1", &dup).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)), "{err}");
        assert_eq!(store.count_encodings("p1").await.unwrap(), 2);

        let stray = vec![encoding("p2", 0, vec![1.0], "v1")];
        assert!(matches!(store.replace_encodings("p1", &stray).await, Err(StoreError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_delete_encodings_counts_rows() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .replace_encodings("p", &[encoding("p", 0, vec![1.0], "v1"), encoding("p", 1, vec![1.0], "v1")])
            .await
            .unwrap();
        assert_eq!(store.delete_encodings("p").await.unwrap(), 2);
        assert_eq!(store.delete_encodings("p").await.unwrap(), 0);
        assert_eq!(store.total_encodings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nearest_filters_version_ceiling_and_limit() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.replace_encodings("same", &[encoding("same", 0, vec![1.0, 0.0], "v1")]).await.unwrap();
        store.replace_encodings("close", &[encoding("close", 0, vec![0.98, 0.2], "v1")]).await.unwrap();
        store.replace_encodings("far", &[encoding("far", 0, vec![0.0, 1.0], "v1")]).await.unwrap();
        store.replace_encodings("old", &[encoding("old", 0, vec![1.0, 0.0], "v0")]).await.unwrap();

        let mut query = VectorQuery {
            embedding: vec![1.0, 0.0],
            model_version: "v1".into(),
            max_distance: 0.2,
            limit: 50,
        };
        let ids: Vec<String> = store.nearest(&query).await.unwrap().into_iter().map(|c| c.photo_id).collect();
        assert_eq!(ids, vec!["same".to_string(), "close".to_string()]);

        query.limit = 1;
        let top = store.nearest(&query).await.unwrap();
        assert_eq!(top.len(), 1);
        assert!(top[0].distance.abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_stamp_round_trip_and_stale() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        assert!(store.index_stamp("a").await.unwrap().is_none());

        store.mark_indexed("a", &stamp("v1")).await.unwrap();
        store.mark_indexed("b", &stamp("v1")).await.unwrap();
        store.mark_indexed("b", &stamp("v2")).await.unwrap();
        assert_eq!(store.index_stamp("a").await.unwrap(), Some(stamp("v1")));
        assert_eq!(store.stale_photos("v2").await.unwrap(), vec!["a".to_string()]);

        store.clear_indexed("a").await.unwrap();
        assert!(store.index_stamp("a").await.unwrap().is_none());
        assert!(store.stale_photos("v2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_embedding_is_reported() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO face_encodings VALUES ('bad', 0, x'000102', 0, 0, 1, 1, 0.5, 'v1')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let query = VectorQuery {
            embedding: vec![1.0],
            model_version: "v1".into(),
            max_distance: 1.0,
            limit: 10,
        };
        assert!(matches!(store.nearest(&query).await, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let path = std::env::temp_dir().join(format!("facefind-store-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.replace_encodings("p", &[encoding("p", 0, vec![1.0], "v1")]).await.unwrap();
        }
        let reopened = SqliteStore::open(&path).await.unwrap();
        assert_eq!(reopened.count_encodings("p").await.unwrap(), 1);

        drop(reopened);
        let _ = std::fs::remove_file(&path);
    }
}
