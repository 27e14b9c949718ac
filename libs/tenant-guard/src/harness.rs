//! End-to-end protocol scenarios against a live database.
//!
//! Each scenario creates its own disposable rows, exercises one accept or
//! reject path, and deletes the rows whatever the outcome. Run it after
//! installation; on a database without the controls most scenarios fail.

use std::collections::BTreeMap;
use std::fmt;

use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr, Statement, Value};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::TENANT_COLUMN;
use crate::config::GuardConfig;
use crate::ddl::{QualifiedName, quote_ident, quote_literal};
use crate::policy::{PrivilegedRole, Rejection, VIOLATION_ACTION};

/// Placeholder replaced with a per-row token in configured column literals.
const NONCE_PLACEHOLDER: &str = "{nonce}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Assigned `shop_id` changed to another shop: rejected, row unchanged.
    RejectModify,
    /// Null `shop_id` assigned for the first time: accepted.
    AllowInitialAssignment,
    /// `shop_id` rewritten with its current value: accepted no-op.
    AllowSameValue,
    /// Owner inserted without a shop: rejected by the ownership constraint.
    RejectOwnerWithoutShop,
    /// Owner inserted with a shop: accepted.
    AcceptOwnerWithShop,
    /// A rejected change leaves exactly one audit record behind.
    AuditSideEffect,
}

impl Scenario {
    pub const ALL: [Self; 6] = [
        Self::RejectModify,
        Self::AllowInitialAssignment,
        Self::AllowSameValue,
        Self::RejectOwnerWithoutShop,
        Self::AcceptOwnerWithShop,
        Self::AuditSideEffect,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RejectModify => "reject_modify",
            Self::AllowInitialAssignment => "allow_initial_assignment",
            Self::AllowSameValue => "allow_same_value",
            Self::RejectOwnerWithoutShop => "reject_owner_without_shop",
            Self::AcceptOwnerWithShop => "accept_owner_with_shop",
            Self::AuditSideEffect => "audit_side_effect",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioResult {
    pub scenario: Scenario,
    pub passed: bool,
    pub detail: String,
}

/// Results of one harness run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarnessSummary {
    pub results: Vec<ScenarioResult>,
}

impl HarnessSummary {
    #[must_use]
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    /// True when every scenario ran and passed. An empty run is not a pass.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        !self.results.is_empty() && self.failed() == 0
    }
}

/// Why a scenario did not pass.
#[derive(Debug)]
enum Failure {
    /// Setup or read-back failed before the behaviour could be observed.
    Db(DbErr),
    /// The database behaved differently from the protocol.
    Mismatch(String),
}

impl From<DbErr> for Failure {
    fn from(e: DbErr) -> Self {
        Self::Db(e)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Db(e) => write!(f, "database error: {e}"),
            Self::Mismatch(m) => f.write_str(m),
        }
    }
}

type Step<T> = Result<T, Failure>;

fn mismatch<T>(msg: impl Into<String>) -> Step<T> {
    Err(Failure::Mismatch(msg.into()))
}

/// Drives the scenarios over one connection, strictly sequentially.
pub struct ProtocolHarness<'a> {
    conn: &'a DatabaseConnection,
    config: &'a GuardConfig,
    probe: QualifiedName,
    principal: QualifiedName,
    sink: QualifiedName,
}

impl<'a> ProtocolHarness<'a> {
    #[must_use]
    pub fn new(conn: &'a DatabaseConnection, config: &'a GuardConfig) -> Self {
        let schema = &config.schema.schema;
        Self {
            conn,
            config,
            probe: QualifiedName::new(schema, &config.harness.probe_table),
            principal: QualifiedName::new(schema, &config.schema.principal_table),
            sink: QualifiedName::new(schema, &config.audit.sink_table),
        }
    }

    /// Run every scenario. Never aborts early.
    pub async fn run(&self) -> HarnessSummary {
        let mut summary = HarnessSummary::default();
        for scenario in Scenario::ALL {
            summary.results.push(self.run_scenario(scenario).await);
        }
        info!(
            passed = summary.passed(),
            failed = summary.failed(),
            "protocol harness finished"
        );
        summary
    }

    /// Run a single scenario.
    pub async fn run_scenario(&self, scenario: Scenario) -> ScenarioResult {
        let outcome = match scenario {
            Scenario::RejectModify => self.reject_modify().await,
            Scenario::AllowInitialAssignment => self.allow_initial_assignment().await,
            Scenario::AllowSameValue => self.allow_same_value().await,
            Scenario::RejectOwnerWithoutShop => self.reject_owner_without_shop().await,
            Scenario::AcceptOwnerWithShop => self.accept_owner_with_shop().await,
            Scenario::AuditSideEffect => self.audit_side_effect().await,
        };
        let (passed, detail) = match outcome {
            Ok(detail) => {
                info!(%scenario, "scenario passed");
                (true, detail)
            }
            Err(failure) => {
                warn!(target: "security", %scenario, %failure, "scenario failed");
                (false, failure.to_string())
            }
        };
        ScenarioResult {
            scenario,
            passed,
            detail,
        }
    }

    async fn reject_modify(&self) -> Step<String> {
        let h = &self.config.harness;
        let id = self.insert_probe(Some(h.primary_shop_id)).await?;
        let outcome = self
            .expect_immutable(&id, h.primary_shop_id, h.foreign_shop_id)
            .await;
        self.cleanup(&self.probe, &id).await;
        outcome
    }

    async fn expect_immutable(&self, id: &str, from: i64, to: i64) -> Step<String> {
        let result = self.update_shop(id, Some(to)).await;
        let stored = self.read_shop(id).await?;
        match result {
            Ok(()) => mismatch(format!(
                "update {from} -> {to} was accepted (row now {})",
                display_shop(stored)
            )),
            Err(e) => match Rejection::classify(&e.to_string()) {
                Rejection::TenantImmutable if stored == Some(from) => Ok(format!(
                    "update {from} -> {to} rejected as tenant-immutable; row still {from}"
                )),
                Rejection::TenantImmutable => mismatch(format!(
                    "update rejected but row changed to {}",
                    display_shop(stored)
                )),
                other => mismatch(format!("update failed with {other} instead: {e}")),
            },
        }
    }

    async fn allow_initial_assignment(&self) -> Step<String> {
        let target = self.config.harness.secondary_shop_id;
        let id = self.insert_probe(None).await?;
        let outcome = self.expect_update_accepted(&id, None, target).await;
        self.cleanup(&self.probe, &id).await;
        outcome
    }

    async fn allow_same_value(&self) -> Step<String> {
        let shop = self.config.harness.primary_shop_id;
        let id = self.insert_probe(Some(shop)).await?;
        let outcome = self.expect_update_accepted(&id, Some(shop), shop).await;
        self.cleanup(&self.probe, &id).await;
        outcome
    }

    async fn expect_update_accepted(&self, id: &str, from: Option<i64>, to: i64) -> Step<String> {
        if let Err(e) = self.update_shop(id, Some(to)).await {
            return mismatch(format!(
                "update {} -> {to} was rejected: {e}",
                display_shop(from)
            ));
        }
        match self.read_shop(id).await? {
            Some(stored) if stored == to => Ok(format!(
                "update {} -> {to} accepted",
                display_shop(from)
            )),
            stored => mismatch(format!(
                "update accepted but row holds {}",
                display_shop(stored)
            )),
        }
    }

    async fn reject_owner_without_shop(&self) -> Step<String> {
        let expected = PrivilegedRole::Owner.constraint_name(&self.principal.name);
        match self.insert_principal(PrivilegedRole::Owner, None).await {
            Ok(id) => {
                self.cleanup(&self.principal, &id).await;
                mismatch("owner without shop was accepted")
            }
            Err(e) => match Rejection::classify(&e.to_string()) {
                Rejection::OwnershipConstraint { constraint } if constraint == expected => {
                    Ok(format!("owner without shop rejected by {constraint}"))
                }
                other => mismatch(format!(
                    "insert failed with {other} instead of {expected}: {e}"
                )),
            },
        }
    }

    async fn accept_owner_with_shop(&self) -> Step<String> {
        let shop = self.config.harness.primary_shop_id;
        match self.insert_principal(PrivilegedRole::Owner, Some(shop)).await {
            Ok(id) => {
                self.cleanup(&self.principal, &id).await;
                Ok(format!("owner with shop {shop} accepted"))
            }
            Err(e) => mismatch(format!("owner with shop {shop} was rejected: {e}")),
        }
    }

    async fn audit_side_effect(&self) -> Step<String> {
        let h = &self.config.harness;
        let id = self.insert_probe(Some(h.primary_shop_id)).await?;
        let outcome = self.expect_one_audit_record(&id, h.foreign_shop_id).await;
        self.cleanup(&self.probe, &id).await;
        outcome
    }

    async fn expect_one_audit_record(&self, id: &str, to: i64) -> Step<String> {
        let before = self.count_audit(id).await?;
        if self.update_shop(id, Some(to)).await.is_ok() {
            return mismatch("violating update was accepted; nothing to audit");
        }
        let after = self.count_audit(id).await?;
        match after - before {
            1 => Ok(format!(
                "one {VIOLATION_ACTION} record written to {}",
                self.sink
            )),
            n => mismatch(format!(
                "expected exactly 1 new {VIOLATION_ACTION} record in {}, found {n}",
                self.sink
            )),
        }
    }

    async fn insert_probe(&self, shop: Option<i64>) -> Step<String> {
        let sql = insert_sql(&self.probe, &[], &self.config.harness.probe_columns, &nonce());
        Ok(self.insert_returning_id(&sql, shop).await?)
    }

    async fn insert_principal(
        &self,
        role: PrivilegedRole,
        shop: Option<i64>,
    ) -> Result<String, DbErr> {
        let fixed = [(self.config.schema.role_column.as_str(), role.as_str())];
        let sql = insert_sql(
            &self.principal,
            &fixed,
            &self.config.harness.principal_columns,
            &nonce(),
        );
        self.insert_returning_id(&sql, shop).await
    }

    async fn insert_returning_id(&self, sql: &str, shop: Option<i64>) -> Result<String, DbErr> {
        let row = self
            .conn
            .query_one(stmt(sql, [Value::BigInt(shop)]))
            .await?
            .ok_or(DbErr::RecordNotInserted)?;
        row.try_get::<String>("", "id")
    }

    async fn update_shop(&self, id: &str, shop: Option<i64>) -> Result<(), DbErr> {
        let sql = format!(
            "UPDATE {} SET {col} = $1 WHERE id::text = $2",
            self.probe.quoted(),
            col = quote_ident(TENANT_COLUMN)
        );
        self.conn
            .execute(stmt(&sql, [Value::BigInt(shop), id.into()]))
            .await?;
        Ok(())
    }

    async fn read_shop(&self, id: &str) -> Result<Option<i64>, DbErr> {
        let sql = format!(
            "SELECT {col}::bigint AS shop_id FROM {} WHERE id::text = $1",
            self.probe.quoted(),
            col = quote_ident(TENANT_COLUMN)
        );
        let row = self
            .conn
            .query_one(stmt(&sql, [id.into()]))
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("{} row {id}", self.probe)))?;
        row.try_get::<Option<i64>>("", "shop_id")
    }

    async fn count_audit(&self, id: &str) -> Result<i64, DbErr> {
        let sql = format!(
            "SELECT COUNT(*)::bigint AS n FROM {} \
             WHERE action = $1 AND entity_type = $2 AND entity_id::text = $3",
            self.sink.quoted()
        );
        let row = self
            .conn
            .query_one(stmt(
                &sql,
                [
                    VIOLATION_ACTION.into(),
                    self.probe.name.as_str().into(),
                    id.into(),
                ],
            ))
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("count on {}", self.sink)))?;
        row.try_get::<i64>("", "n")
    }

    /// Delete a disposable row. Failures are logged, never propagated.
    async fn cleanup(&self, table: &QualifiedName, id: &str) {
        let sql = format!("DELETE FROM {} WHERE id::text = $1", table.quoted());
        if let Err(e) = self.conn.execute(stmt(&sql, [id.into()])).await {
            warn!(%table, id, error = %e, "failed to delete harness row");
        }
    }
}

fn stmt<I>(sql: &str, values: I) -> Statement
where
    I: IntoIterator<Item = Value>,
{
    Statement::from_sql_and_values(DatabaseBackend::Postgres, sql, values)
}

fn nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

fn display_shop(shop: Option<i64>) -> String {
    shop.map_or_else(|| "NULL".to_owned(), |s| s.to_string())
}

/// `INSERT ... RETURNING id` with `shop_id` bound as `$1` and every other
/// value inlined as a quoted literal, so enum-typed columns accept them.
fn insert_sql(
    table: &QualifiedName,
    fixed: &[(&str, &str)],
    literals: &BTreeMap<String, String>,
    nonce: &str,
) -> String {
    let mut columns = vec![quote_ident(TENANT_COLUMN)];
    let mut values = vec!["$1".to_owned()];
    let configured = literals
        .iter()
        .map(|(c, v)| (c.as_str(), v.replace(NONCE_PLACEHOLDER, nonce)));
    for (column, value) in fixed
        .iter()
        .map(|(c, v)| (*c, (*v).to_owned()))
        .chain(configured)
    {
        columns.push(quote_ident(column));
        values.push(quote_literal(&value));
    }
    format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING id::text AS id",
        table.quoted(),
        columns.join(", "),
        values.join(", ")
    )
}
