// Repository layer: each table lives in its own file with `impl Repository`.
//
// Callers go through the `RecordStore` / `AccountStore` traits in
// `crate::store`; the trait impls here are thin wrappers over the inherent
// query methods.

use sqlx::sqlite::SqlitePool;

mod accounts;
mod records;

#[cfg(test)]
pub(crate) mod test_helpers;

#[derive(Clone)]
pub struct Repository {
    pub(crate) pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// True when `err` is a UNIQUE constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
