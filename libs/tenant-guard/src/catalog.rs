//! Database seams: read-only catalog queries and DDL execution.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement, Value};
use tracing::debug;

use crate::ddl::{Ddl, QualifiedName, loopback_check_sql, quote_ident, quote_literal};
use crate::error::CatalogError;

/// Read-only view of the live schema.
///
/// Implementations must not write; the verifier runs against hot production
/// databases through this trait alone.
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    /// Base tables in `schema` that have a column named `column`.
    async fn tables_with_column(
        &self,
        schema: &str,
        column: &str,
    ) -> Result<BTreeSet<String>, CatalogError>;

    async fn function_exists(&self, function: &QualifiedName) -> Result<bool, CatalogError>;

    /// Body of a function, if it exists.
    async fn function_source(
        &self,
        function: &QualifiedName,
    ) -> Result<Option<String>, CatalogError>;

    async fn constraint_exists(
        &self,
        table: &QualifiedName,
        constraint: &str,
    ) -> Result<bool, CatalogError>;

    /// Number of user-defined triggers in `schema` whose name matches the
    /// `LIKE` pattern.
    async fn count_triggers(&self, schema: &str, pattern: &str) -> Result<i64, CatalogError>;

    async fn extension_installed(&self, name: &str) -> Result<bool, CatalogError>;

    /// Rows of `table` with `role_column = role` and a null `shop_id`.
    async fn count_missing_tenant(
        &self,
        table: &QualifiedName,
        role_column: &str,
        role: &str,
    ) -> Result<i64, CatalogError>;
}

/// Executes typed DDL.
#[async_trait]
pub trait SchemaExecutor: Send + Sync {
    async fn execute(&self, ddl: &Ddl) -> Result<(), CatalogError>;

    /// Open the `dblink` loopback connection once. Fails when the connection
    /// cannot be established or authenticated.
    async fn check_loopback(&self, conninfo: Option<&str>) -> Result<(), CatalogError>;
}

/// PostgreSQL implementation over a `SeaORM` connection.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    conn: DatabaseConnection,
}

impl PgCatalog {
    #[must_use]
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    fn stmt<I>(sql: &str, values: I) -> Statement
    where
        I: IntoIterator<Item = Value>,
    {
        Statement::from_sql_and_values(DatabaseBackend::Postgres, sql, values)
    }

    async fn scalar_i64(&self, stmt: Statement) -> Result<i64, CatalogError> {
        let row = self
            .conn
            .query_one(stmt)
            .await?
            .ok_or_else(|| CatalogError::Unavailable("count query returned no row".to_owned()))?;
        Ok(row.try_get::<i64>("", "n")?)
    }

    async fn scalar_bool(&self, stmt: Statement) -> Result<bool, CatalogError> {
        let row = self
            .conn
            .query_one(stmt)
            .await?
            .ok_or_else(|| CatalogError::Unavailable("exists query returned no row".to_owned()))?;
        Ok(row.try_get::<bool>("", "present")?)
    }
}

#[async_trait]
impl SchemaCatalog for PgCatalog {
    async fn tables_with_column(
        &self,
        schema: &str,
        column: &str,
    ) -> Result<BTreeSet<String>, CatalogError> {
        let rows = self
            .conn
            .query_all(Self::stmt(
                r"SELECT c.table_name::text AS table_name
                  FROM information_schema.columns c
                  JOIN information_schema.tables t
                    ON t.table_schema = c.table_schema AND t.table_name = c.table_name
                  WHERE c.table_schema = $1
                    AND c.column_name = $2
                    AND t.table_type = 'BASE TABLE'",
                [schema.into(), column.into()],
            ))
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String>("", "table_name").map_err(Into::into))
            .collect()
    }

    async fn function_exists(&self, function: &QualifiedName) -> Result<bool, CatalogError> {
        self.scalar_bool(Self::stmt(
            r"SELECT EXISTS (
                  SELECT 1 FROM pg_proc p
                  JOIN pg_namespace n ON n.oid = p.pronamespace
                  WHERE n.nspname = $1 AND p.proname = $2
              ) AS present",
            [function.schema.as_str().into(), function.name.as_str().into()],
        ))
        .await
    }

    async fn function_source(
        &self,
        function: &QualifiedName,
    ) -> Result<Option<String>, CatalogError> {
        let row = self
            .conn
            .query_one(Self::stmt(
                r"SELECT p.prosrc AS source FROM pg_proc p
                  JOIN pg_namespace n ON n.oid = p.pronamespace
                  WHERE n.nspname = $1 AND p.proname = $2
                  LIMIT 1",
                [function.schema.as_str().into(), function.name.as_str().into()],
            ))
            .await?;
        row.map(|r| r.try_get::<String>("", "source"))
            .transpose()
            .map_err(Into::into)
    }

    async fn constraint_exists(
        &self,
        table: &QualifiedName,
        constraint: &str,
    ) -> Result<bool, CatalogError> {
        self.scalar_bool(Self::stmt(
            r"SELECT EXISTS (
                  SELECT 1 FROM pg_constraint con
                  JOIN pg_class c ON c.oid = con.conrelid
                  JOIN pg_namespace n ON n.oid = c.relnamespace
                  WHERE n.nspname = $1 AND c.relname = $2
                    AND con.conname = $3 AND con.contype = 'c'
              ) AS present",
            [
                table.schema.as_str().into(),
                table.name.as_str().into(),
                constraint.into(),
            ],
        ))
        .await
    }

    async fn count_triggers(&self, schema: &str, pattern: &str) -> Result<i64, CatalogError> {
        self.scalar_i64(Self::stmt(
            r"SELECT COUNT(*)::bigint AS n
              FROM pg_trigger tg
              JOIN pg_class c ON c.oid = tg.tgrelid
              JOIN pg_namespace n ON n.oid = c.relnamespace
              WHERE NOT tg.tgisinternal AND n.nspname = $1 AND tg.tgname LIKE $2",
            [schema.into(), pattern.into()],
        ))
        .await
    }

    async fn extension_installed(&self, name: &str) -> Result<bool, CatalogError> {
        self.scalar_bool(Self::stmt(
            "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = $1) AS present",
            [name.into()],
        ))
        .await
    }

    async fn count_missing_tenant(
        &self,
        table: &QualifiedName,
        role_column: &str,
        role: &str,
    ) -> Result<i64, CatalogError> {
        // Role compared as text so enum-typed role columns work too.
        let sql = format!(
            "SELECT COUNT(*)::bigint AS n FROM {} WHERE {}::text = {} AND {} IS NULL",
            table.quoted(),
            quote_ident(role_column),
            quote_literal(role),
            quote_ident(crate::TENANT_COLUMN)
        );
        self.scalar_i64(Self::stmt(&sql, [])).await
    }
}

#[async_trait]
impl SchemaExecutor for PgCatalog {
    async fn execute(&self, ddl: &Ddl) -> Result<(), CatalogError> {
        let sql = ddl.to_sql();
        debug!(sql = %sql, "executing DDL");
        self.conn.execute_unprepared(&sql).await?;
        Ok(())
    }

    async fn check_loopback(&self, conninfo: Option<&str>) -> Result<(), CatalogError> {
        self.conn
            .query_one(Self::stmt(&loopback_check_sql(conninfo), []))
            .await?;
        Ok(())
    }
}
