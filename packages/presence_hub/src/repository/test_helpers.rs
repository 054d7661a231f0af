use sqlx::sqlite::SqlitePoolOptions;

/// Create a fresh Repository backed by an in-memory SQLite database.
/// Each call returns an isolated database with all migrations applied (~1ms).
pub async fn test_repository() -> super::Repository {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    super::Repository::new(pool)
}
