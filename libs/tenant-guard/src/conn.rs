//! PostgreSQL connection handle.

use sea_orm::{DatabaseConnection, SqlxPostgresConnector};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::catalog::PgCatalog;
use crate::config::DatabaseConfig;
use crate::error::{GuardError, Result};

/// Owns the sqlx pool and the `SeaORM` connection built on top of it.
#[derive(Debug, Clone)]
pub struct GuardDb {
    pool: PgPool,
    sea: DatabaseConnection,
}

impl GuardDb {
    /// Connect using the configured DSN and pool limits.
    ///
    /// # Errors
    /// Returns an error if no DSN is set, the scheme is not PostgreSQL, or the
    /// pool cannot connect.
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let dsn = cfg.dsn()?;
        let s = dsn.trim_start();
        if !(s.starts_with("postgres://") || s.starts_with("postgresql://")) {
            return Err(GuardError::UnsupportedDsn(redact_credentials_in_dsn(dsn)));
        }

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_conns.max(1))
            .acquire_timeout(cfg.acquire_timeout)
            .connect(s)
            .await?;
        info!(dsn = %redact_credentials_in_dsn(s), "connected to database");

        let sea = SqlxPostgresConnector::from_sqlx_postgres_pool(pool.clone());
        Ok(Self { pool, sea })
    }

    /// Catalog and executor backed by this connection.
    #[must_use]
    pub fn catalog(&self) -> PgCatalog {
        PgCatalog::new(self.sea.clone())
    }

    #[must_use]
    pub fn conn(&self) -> &DatabaseConnection {
        &self.sea
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Replace the password in a DSN with `***` for logging.
#[must_use]
pub fn redact_credentials_in_dsn(dsn: &str) -> String {
    if !dsn.contains('@') {
        return dsn.to_owned();
    }
    match url::Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
                return "***".to_owned();
            }
            parsed.to_string()
        }
        Err(_) => "***".to_owned(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn password_is_redacted() {
        assert_eq!(
            redact_credentials_in_dsn("postgres://app:s3cret@db:5432/shop"),
            "postgres://app:***@db:5432/shop"
        );
    }

    #[test]
    fn dsn_without_credentials_is_unchanged() {
        assert_eq!(
            redact_credentials_in_dsn("postgres://db:5432/shop"),
            "postgres://db:5432/shop"
        );
        assert_eq!(
            redact_credentials_in_dsn("postgres://app@db/shop"),
            "postgres://app@db/shop"
        );
    }

    #[test]
    fn unparsable_dsn_is_hidden() {
        assert_eq!(redact_credentials_in_dsn("not a url @ all"), "***");
    }

    #[tokio::test]
    async fn non_postgres_dsn_is_rejected() {
        let cfg = DatabaseConfig {
            dsn: Some("mysql://root:pw@localhost/shop".to_owned()),
            ..Default::default()
        };
        let err = GuardDb::connect(&cfg).await.unwrap_err();
        assert!(matches!(err, GuardError::UnsupportedDsn(_)));
        assert!(!err.to_string().contains("pw"));
    }

    #[tokio::test]
    async fn missing_dsn_is_rejected() {
        let err = GuardDb::connect(&DatabaseConfig::default()).await.unwrap_err();
        assert!(matches!(
            err,
            GuardError::Config(crate::error::ConfigError::MissingDsn)
        ));
    }
}
