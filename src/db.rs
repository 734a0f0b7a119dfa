//! Database module
//!
//! Connection pool and schema checks. The schema itself lives in
//! `migrations/`.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Tables the transactions process needs
pub const TRANSACTION_TABLES: &[&str] = &["transactions", "outbox"];

/// Tables the antifraud process needs
pub const RISK_TABLES: &[&str] = &["daily_totals"];

/// Open a connection pool
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Simple connectivity check
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Check if required tables exist
pub async fn check_schema(pool: &PgPool, required_tables: &[&str]) -> Result<bool, sqlx::Error> {
    for &table in required_tables {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!("Required table '{}' does not exist", table);
            return Ok(false);
        }
    }

    Ok(true)
}

/// Failure to open a pool over a usable schema
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("Database schema is not complete, run migrations (needs {0:?})")]
    Incomplete(&'static [&'static str]),
}

/// Open a pool and make sure `required_tables` exist; the pool is closed on failure
pub async fn connect_with_schema(
    database_url: &str,
    max_connections: u32,
    required_tables: &'static [&'static str],
) -> Result<PgPool, SchemaError> {
    let pool = connect(database_url, max_connections).await?;
    if !check_schema(&pool, required_tables).await? {
        pool.close().await;
        return Err(SchemaError::Incomplete(required_tables));
    }
    Ok(pool)
}
