//! Email/password accounts. Hashing happens in the handler; this layer only
//! stores the argon2 PHC string.

use async_trait::async_trait;
use uuid::Uuid;

use super::{Repository, is_unique_violation};
use crate::store::{Account, AccountStore, StoreError, now_millis};

impl Repository {
    pub async fn insert_account(&self, account: &Account) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO accounts (id, email, password_hash, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&account.id)
        .bind(&account.email)
        .bind(&account.password_hash)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_account_by_email(&self, email: &str) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as::<_, Account>(
            "SELECT id, email, password_hash, created_at FROM accounts WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl AccountStore for Repository {
    async fn create_account(&self, email: &str, password_hash: &str) -> Result<Account, StoreError> {
        let account = Account {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now_millis(),
        };
        match self.insert_account(&account).await {
            Ok(()) => Ok(account),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AccountExists(email.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.get_account_by_email(email).await?)
    }
}
