//! Published artifact index persistence

use sqlx::SqlitePool;

use super::{format_timestamp, parse_timestamp};
use crate::upload::{DedupEntry, DedupStore, UploadError};

/// Artifact row
#[derive(Debug, Clone, sqlx::FromRow)]
struct ArtifactRow {
    content_hash: String,
    artifact_name: String,
    size: i64,
    created_at: String,
}

impl TryFrom<ArtifactRow> for DedupEntry {
    type Error = UploadError;

    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        Ok(DedupEntry {
            created_at: parse_timestamp(&row.created_at)?,
            content_hash: row.content_hash,
            artifact_name: row.artifact_name,
            size: row.size as u64,
        })
    }
}

/// SQLite-backed dedup store
#[derive(Clone)]
pub struct SqliteDedupStore {
    pool: SqlitePool,
}

impl SqliteDedupStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DedupStore for SqliteDedupStore {
    async fn get(&self, content_hash: &str) -> Result<Option<DedupEntry>, UploadError> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT content_hash, artifact_name, size, created_at
            FROM artifacts
            WHERE content_hash = ?
            "#,
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DedupEntry::try_from).transpose()
    }

    async fn put_if_absent(&self, entry: DedupEntry) -> Result<DedupEntry, UploadError> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (content_hash, artifact_name, size, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(&entry.content_hash)
        .bind(&entry.artifact_name)
        .bind(entry.size as i64)
        .bind(format_timestamp(&entry.created_at))
        .execute(&self.pool)
        .await?;

        self.get(&entry.content_hash)
            .await?
            .ok_or_else(|| UploadError::DatabaseError(format!("artifact {} vanished", entry.content_hash)))
    }

    async fn remove(&self, content_hash: &str) -> Result<bool, UploadError> {
        let result = sqlx::query("DELETE FROM artifacts WHERE content_hash = ?")
            .bind(content_hash)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<usize, UploadError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts")
            .fetch_one(&self.pool)
            .await?;

        Ok(count as usize)
    }
}
