//! The shared status record both detectors rendezvous on.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS verification_records (
//!     person_id      TEXT PRIMARY KEY,
//!     status         TEXT NOT NULL,
//!     reported_force DOUBLE PRECISION NOT NULL,
//!     requested_at   TIMESTAMPTZ NOT NULL,
//!     note           TEXT NOT NULL,
//!     source         TEXT
//! );
//! ```

use crate::model::{RecordPatch, VerificationRecord, VerificationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record for {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out")]
    Timeout,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, person_id: &str) -> Result<Option<VerificationRecord>, StoreError>;

    /// Upsert; fields absent from `patch` keep their stored values.
    async fn merge(&self, person_id: &str, patch: &RecordPatch) -> Result<(), StoreError>;

    /// Like `merge`, but fails with [`StoreError::NotFound`] when no record exists.
    async fn update(&self, person_id: &str, patch: &RecordPatch) -> Result<(), StoreError>;
}

/// Process-local store, used when no database is configured.
#[derive(Default)]
pub struct MemoryStatusStore {
    records: RwLock<HashMap<String, VerificationRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, person_id: &str) -> Result<Option<VerificationRecord>, StoreError> {
        Ok(self.records.read().get(person_id).cloned())
    }

    async fn merge(&self, person_id: &str, patch: &RecordPatch) -> Result<(), StoreError> {
        self.records
            .write()
            .entry(person_id.to_string())
            .or_default()
            .apply(patch);
        Ok(())
    }

    async fn update(&self, person_id: &str, patch: &RecordPatch) -> Result<(), StoreError> {
        match self.records.write().get_mut(person_id) {
            Some(record) => {
                record.apply(patch);
                Ok(())
            }
            None => Err(StoreError::NotFound(person_id.to_string())),
        }
    }
}

#[derive(Debug, FromRow)]
struct RecordRow {
    status: String,
    reported_force: f64,
    requested_at: DateTime<Utc>,
    note: String,
    source: Option<String>,
}

impl TryFrom<RecordRow> for VerificationRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<VerificationStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Self {
            status,
            reported_force: row.reported_force,
            requested_at: row.requested_at,
            note: row.note,
            source: row.source,
        })
    }
}

/// Postgres-backed store.
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS verification_records (
                person_id      TEXT PRIMARY KEY,
                status         TEXT NOT NULL,
                reported_force DOUBLE PRECISION NOT NULL,
                requested_at   TIMESTAMPTZ NOT NULL,
                note           TEXT NOT NULL,
                source         TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn get(&self, person_id: &str) -> Result<Option<VerificationRecord>, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT status, reported_force, requested_at, note, source
            FROM verification_records
            WHERE person_id = $1
            "#,
        )
        .bind(person_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(VerificationRecord::try_from).transpose()
    }

    async fn merge(&self, person_id: &str, patch: &RecordPatch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO verification_records
                (person_id, status, reported_force, requested_at, note, source)
            VALUES
                ($1, COALESCE($2, 'IDLE'), COALESCE($3, 0), COALESCE($4, to_timestamp(0)),
                 COALESCE($5, ''), $6)
            ON CONFLICT (person_id) DO UPDATE SET
                status         = COALESCE($2, verification_records.status),
                reported_force = COALESCE($3, verification_records.reported_force),
                requested_at   = COALESCE($4, verification_records.requested_at),
                note           = COALESCE($5, verification_records.note),
                source         = COALESCE($6, verification_records.source)
            "#,
        )
        .bind(person_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.reported_force)
        .bind(patch.requested_at)
        .bind(patch.note.as_deref())
        .bind(patch.source.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, person_id: &str, patch: &RecordPatch) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE verification_records SET
                status         = COALESCE($2, status),
                reported_force = COALESCE($3, reported_force),
                requested_at   = COALESCE($4, requested_at),
                note           = COALESCE($5, note),
                source         = COALESCE($6, source)
            WHERE person_id = $1
            "#,
        )
        .bind(person_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.reported_force)
        .bind(patch.requested_at)
        .bind(patch.note.as_deref())
        .bind(patch.source.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(person_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merge_creates_then_preserves_fields() {
        let store = MemoryStatusStore::new();
        store
            .merge(
                "p1",
                &RecordPatch {
                    status: Some(VerificationStatus::VerifyRequest),
                    reported_force: Some(2.1),
                    note: Some("first".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store
            .merge("p1", &RecordPatch::status(VerificationStatus::Normal))
            .await
            .unwrap();

        let record = store.get("p1").await.unwrap().unwrap();
        assert_eq!(record.status, VerificationStatus::Normal);
        assert_eq!(record.reported_force, 2.1);
        assert_eq!(record.note, "first");
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let store = MemoryStatusStore::new();
        let patch = RecordPatch::status(VerificationStatus::Emergency);

        assert!(matches!(
            store.update("ghost", &patch).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.get("ghost").await.unwrap().is_none());

        store.merge("ghost", &RecordPatch::default()).await.unwrap();
        store.update("ghost", &patch).await.unwrap();
        assert_eq!(
            store.get("ghost").await.unwrap().unwrap().status,
            VerificationStatus::Emergency
        );
    }

    #[test]
    fn corrupt_status_row_is_reported() {
        let row = RecordRow {
            status: "PANIC".into(),
            reported_force: 0.0,
            requested_at: Utc::now(),
            note: String::new(),
            source: None,
        };
        assert!(matches!(
            VerificationRecord::try_from(row),
            Err(StoreError::Corrupt(_))
        ));
    }
}
