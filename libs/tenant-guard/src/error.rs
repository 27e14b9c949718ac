use thiserror::Error;

/// Library-local result type.
pub type Result<T> = std::result::Result<T, GuardError>;

/// Failure of a catalog query or DDL statement against the live schema.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Db(#[from] sea_orm::DbErr),

    /// The catalog could not be reached or returned an unusable answer.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file does not exist: {0}")]
    MissingFile(String),

    #[error("failed to load configuration")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid identifier for {field}: '{value}' (expected [a-z_][a-z0-9_]*, at most 63 bytes)")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("database.dsn is not set (use --dsn, SHOPGUARD__DATABASE__DSN or the config file)")]
    MissingDsn,
}

/// Typed error for installer, verifier and connection helpers.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A shared trigger function could not be created; nothing that depends
    /// on it can be bound.
    #[error("failed to create shared function '{function}'")]
    SharedFunction {
        function: &'static str,
        #[source]
        source: CatalogError,
    },

    #[error("unsupported DSN '{0}': only postgres:// and postgresql:// are supported")]
    UnsupportedDsn(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Load(Box::new(e))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn shared_function_error_exposes_cause_once() {
        let err = GuardError::SharedFunction {
            function: "prevent_shop_id_change",
            source: CatalogError::Unavailable("permission denied for schema public".to_owned()),
        };
        assert_eq!(
            err.to_string(),
            "failed to create shared function 'prevent_shop_id_change'"
        );
        let cause = err.source().map(ToString::to_string);
        assert_eq!(
            cause.as_deref(),
            Some("catalog unavailable: permission denied for schema public")
        );
    }

    #[test]
    fn load_error_keeps_details_in_source() {
        let err = ConfigError::from(figment::Error::from("bad yaml".to_owned()));
        assert_eq!(err.to_string(), "failed to load configuration");
        assert!(err.source().is_some_and(|s| s.to_string().contains("bad yaml")));
    }
}
