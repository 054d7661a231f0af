//! Record and account storage seams.
//!
//! The coordinator and handlers only see the [`RecordStore`] and
//! [`AccountStore`] traits. Production wires in the sqlite
//! [`Repository`](crate::repository::Repository); tests and single-node
//! demos use [`MemoryStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Status given to a record that has never been updated.
pub const DEFAULT_STATUS: &str = "offline";

/// Per-subject data record with its last known status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub id: String,
    pub subject_id: String,
    pub content: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a record for subject {0} already exists")]
    AlreadyExists(String),
    #[error("an account for {0} already exists")]
    AccountExists(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Set `status` for `subject_id`, creating the record if needed.
    /// Concurrent writers resolve last-write-wins.
    async fn upsert_status(&self, subject_id: &str, status: &str) -> Result<StatusRecord, StoreError>;

    /// Create the subject's record. Fails if one exists.
    async fn create_record(&self, subject_id: &str, content: &str) -> Result<StatusRecord, StoreError>;

    async fn find_by_subject(&self, subject_id: &str) -> Result<Option<StatusRecord>, StoreError>;

    /// Cheap reachability check for the readiness probe.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create_account(&self, email: &str, password_hash: &str) -> Result<Account, StoreError>;

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError>;
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Process-local store. Shared between hubs in tests to stand in for a
/// common database.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, StatusRecord>>,
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_status(&self, subject_id: &str, status: &str) -> Result<StatusRecord, StoreError> {
        let now = now_millis();
        let mut records = self.records.write().await;
        let record = records
            .entry(subject_id.to_string())
            .or_insert_with(|| StatusRecord {
                id: Uuid::new_v4().to_string(),
                subject_id: subject_id.to_string(),
                content: None,
                status: DEFAULT_STATUS.to_string(),
                created_at: now,
                updated_at: now,
            });
        record.status = status.to_string();
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn create_record(&self, subject_id: &str, content: &str) -> Result<StatusRecord, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(subject_id) {
            return Err(StoreError::AlreadyExists(subject_id.to_string()));
        }
        let now = now_millis();
        let record = StatusRecord {
            id: Uuid::new_v4().to_string(),
            subject_id: subject_id.to_string(),
            content: Some(content.to_string()),
            status: DEFAULT_STATUS.to_string(),
            created_at: now,
            updated_at: now,
        };
        records.insert(subject_id.to_string(), record.clone());
        Ok(record)
    }

    async fn find_by_subject(&self, subject_id: &str) -> Result<Option<StatusRecord>, StoreError> {
        Ok(self.records.read().await.get(subject_id).cloned())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn create_account(&self, email: &str, password_hash: &str) -> Result<Account, StoreError> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(email) {
            return Err(StoreError::AccountExists(email.to_string()));
        }
        let account = Account {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now_millis(),
        };
        accounts.insert(email.to_string(), account.clone());
        Ok(account)
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.read().await.get(email).cloned())
    }
}
