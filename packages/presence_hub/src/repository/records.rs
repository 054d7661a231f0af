use async_trait::async_trait;
use uuid::Uuid;

use super::{Repository, is_unique_violation};
use crate::store::{DEFAULT_STATUS, RecordStore, StatusRecord, StoreError, now_millis};

const RECORD_COLUMNS: &str = "id, subject_id, content, status, created_at, updated_at";

impl Repository {
    /// Insert-or-update in one statement so concurrent writers from any hub
    /// serialize in the database; the last committed write wins.
    pub async fn write_status(
        &self,
        subject_id: &str,
        status: &str,
    ) -> Result<StatusRecord, sqlx::Error> {
        let now = now_millis();
        sqlx::query_as::<_, StatusRecord>(&format!(
            "INSERT INTO status_records (id, subject_id, content, status, created_at, updated_at)
             VALUES (?, ?, NULL, ?, ?, ?)
             ON CONFLICT(subject_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(subject_id)
        .bind(status)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn insert_record(
        &self,
        subject_id: &str,
        content: &str,
    ) -> Result<StatusRecord, sqlx::Error> {
        let now = now_millis();
        sqlx::query_as::<_, StatusRecord>(&format!(
            "INSERT INTO status_records (id, subject_id, content, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(subject_id)
        .bind(content)
        .bind(DEFAULT_STATUS)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_record_by_subject(
        &self,
        subject_id: &str,
    ) -> Result<Option<StatusRecord>, sqlx::Error> {
        sqlx::query_as::<_, StatusRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM status_records WHERE subject_id = ?"
        ))
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl RecordStore for Repository {
    async fn upsert_status(&self, subject_id: &str, status: &str) -> Result<StatusRecord, StoreError> {
        Ok(self.write_status(subject_id, status).await?)
    }

    async fn create_record(&self, subject_id: &str, content: &str) -> Result<StatusRecord, StoreError> {
        self.insert_record(subject_id, content).await.map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(subject_id.to_string())
            } else {
                StoreError::Database(e)
            }
        })
    }

    async fn find_by_subject(&self, subject_id: &str) -> Result<Option<StatusRecord>, StoreError> {
        Ok(self.get_record_by_subject(subject_id).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
