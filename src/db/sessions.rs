//! Upload session persistence

use std::collections::BTreeSet;

use sqlx::SqlitePool;

use super::{format_timestamp, parse_timestamp};
use crate::upload::{SessionStatus, SessionStore, UploadError, UploadSession, Versioned};

const SESSION_COLUMNS: &str = "upload_id, file_name, content_hash, chunk_count, received_chunks, \
                               status, version, created_at, updated_at";

/// Upload session row
#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    upload_id: String,
    file_name: String,
    content_hash: String,
    chunk_count: i64,
    received_chunks: String,
    status: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Versioned<UploadSession>, UploadError> {
        let received_chunks: BTreeSet<usize> = serde_json::from_str(&self.received_chunks)
            .map_err(|e| {
                UploadError::DatabaseError(format!(
                    "bad received_chunks for {}: {}",
                    self.upload_id, e
                ))
            })?;
        let status = SessionStatus::parse(&self.status).ok_or_else(|| {
            UploadError::DatabaseError(format!("bad status for {}: {}", self.upload_id, self.status))
        })?;

        Ok(Versioned {
            version: self.version as u64,
            value: UploadSession {
                created_at: parse_timestamp(&self.created_at)?,
                updated_at: parse_timestamp(&self.updated_at)?,
                upload_id: self.upload_id,
                file_name: self.file_name,
                content_hash: self.content_hash,
                chunk_count: self.chunk_count as usize,
                received_chunks,
                status,
            },
        })
    }
}

fn encode_chunks(session: &UploadSession) -> Result<String, UploadError> {
    serde_json::to_string(&session.received_chunks)
        .map_err(|e| UploadError::DatabaseError(e.to_string()))
}

/// SQLite-backed session store; compare-and-swap on the `version` column
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, upload_id: &str) -> Result<Option<Versioned<UploadSession>>, UploadError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM upload_sessions WHERE upload_id = ?",
            SESSION_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRow::into_session).transpose()
    }

    async fn insert_if_absent(
        &self,
        session: UploadSession,
    ) -> Result<Versioned<UploadSession>, UploadError> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions
                (upload_id, file_name, content_hash, chunk_count, received_chunks,
                 status, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(upload_id) DO NOTHING
            "#,
        )
        .bind(&session.upload_id)
        .bind(&session.file_name)
        .bind(&session.content_hash)
        .bind(session.chunk_count as i64)
        .bind(encode_chunks(&session)?)
        .bind(session.status.as_str())
        .bind(format_timestamp(&session.created_at))
        .bind(format_timestamp(&session.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(Versioned {
                version: 1,
                value: session,
            });
        }

        self.get(&session.upload_id)
            .await?
            .ok_or_else(|| UploadError::UnknownUpload(session.upload_id.clone()))
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        session: UploadSession,
    ) -> Result<Option<Versioned<UploadSession>>, UploadError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET file_name = ?, content_hash = ?, chunk_count = ?, received_chunks = ?,
                status = ?, updated_at = ?, version = version + 1
            WHERE upload_id = ? AND version = ?
            "#,
        )
        .bind(&session.file_name)
        .bind(&session.content_hash)
        .bind(session.chunk_count as i64)
        .bind(encode_chunks(&session)?)
        .bind(session.status.as_str())
        .bind(format_timestamp(&session.updated_at))
        .bind(&session.upload_id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(Versioned {
            version: expected_version + 1,
            value: session,
        }))
    }

    async fn remove(&self, upload_id: &str) -> Result<Option<UploadSession>, UploadError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "DELETE FROM upload_sessions WHERE upload_id = ? RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SessionRow::into_session).transpose()?.map(|v| v.value))
    }

    async fn compare_and_remove(
        &self,
        upload_id: &str,
        expected_version: u64,
    ) -> Result<Option<UploadSession>, UploadError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "DELETE FROM upload_sessions WHERE upload_id = ? AND version = ? RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(upload_id)
        .bind(expected_version as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SessionRow::into_session).transpose()?.map(|v| v.value))
    }

    async fn find_by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<UploadSession>, UploadError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            SELECT {} FROM upload_sessions
            WHERE content_hash = ? AND status = 'receiving'
            ORDER BY created_at ASC, upload_id ASC
            LIMIT 1
            "#,
            SESSION_COLUMNS
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SessionRow::into_session).transpose()?.map(|v| v.value))
    }

    async fn list(&self) -> Result<Vec<UploadSession>, UploadError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM upload_sessions ORDER BY created_at ASC, upload_id ASC",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_session().map(|v| v.value))
            .collect()
    }
}
