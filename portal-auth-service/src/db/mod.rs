//! PostgreSQL pool and schema setup for the credential store.

use crate::config::DatabaseConfig;
use crate::services::store::PgCredentialStore;
use service_core::error::AppError;
use service_core::utils::RetryConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!(
        max_connections = config.max_connections,
        "Connecting to the credential database"
    );

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.url)
        .await
}

/// Applies the embedded `migrations/` directory.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Credential schema is up to date");
    Ok(())
}

/// Connects, migrates, and wraps the pool in a store that retries transient failures.
pub async fn open_store(
    config: &DatabaseConfig,
    retry: RetryConfig,
) -> Result<PgCredentialStore, AppError> {
    let pool = create_pool(config)
        .await
        .map_err(|e| AppError::DatabaseError(e.into()))?;
    run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.into()))?;
    Ok(PgCredentialStore::new(pool, retry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::CredentialStore;

    fn config(url: &str) -> DatabaseConfig {
        DatabaseConfig {
            url: url.to_string(),
            max_connections: 2,
            min_connections: 1,
        }
    }

    #[tokio::test]
    async fn test_malformed_url_is_a_database_error() {
        let err = open_store(&config("not a database url"), RetryConfig::no_retry())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::DatabaseError(_)));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_open_store_migrates_and_answers_health_checks() {
        let url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/portal_auth_test".to_string());
        let store = open_store(&config(&url), RetryConfig::no_retry())
            .await
            .unwrap();
        assert!(store.health_check().await.is_ok());
    }
}
