//! Installs the tenant invariants.
//!
//! Every table and constraint is applied independently and reported as its
//! own [`InstallStep`], so one table's failure never hides the state of the
//! others. Only failure to create a shared trigger function aborts a call,
//! because nothing bound to it could work.
//!
//! All DDL is create-or-replace or drop-then-create, so the installer can be
//! re-run at any time (including after an interrupted run).

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::TENANT_COLUMN;
use crate::catalog::{SchemaCatalog, SchemaExecutor};
use crate::config::GuardConfig;
use crate::ddl::{
    AUDIT_FUNCTION, AUDIT_TRIGGER, AuditWrite, DBLINK_EXTENSION, Ddl, IMMUTABILITY_FUNCTION,
    IMMUTABILITY_TRIGGER, QualifiedName, TriggerFunction,
};
use crate::error::{CatalogError, GuardError, Result};
use crate::policy::PrivilegedRole;

/// Control category a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCategory {
    Immutability,
    Ownership,
    Auditing,
}

impl fmt::Display for ControlCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Immutability => "immutability",
            Self::Ownership => "ownership",
            Self::Auditing => "auditing",
        })
    }
}

/// Why a step was deliberately not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Existing rows already violate the constraint; installing it underneath
    /// them is refused.
    LegacyViolations { role: PrivilegedRole, count: i64 },
    /// The table does not exist or has no `shop_id` column.
    TableMissing,
    /// The `dblink` extension could not be created; audit rows are written
    /// inline and roll back with the rejected statement.
    ExtensionUnavailable { error: String },
    /// `dblink` exists but the loopback connection was refused, typically
    /// because a non-superuser connected without a password.
    LoopbackUnavailable { error: String },
    /// The table is audited but not protected by the immutability trigger.
    NotProtected,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LegacyViolations { role, count } => write!(
                f,
                "{count} existing '{role}' row(s) have no {TENANT_COLUMN}; constraint deferred"
            ),
            Self::TableMissing => write!(f, "table missing or has no {TENANT_COLUMN} column"),
            Self::ExtensionUnavailable { error } => write!(
                f,
                "{DBLINK_EXTENSION} unavailable ({error}); audit rows will not survive rejected statements"
            ),
            Self::LoopbackUnavailable { error } => write!(
                f,
                "loopback connection refused ({error}); audit rows will not survive rejected \
                 statements. Set audit.loopback_conninfo with a password for non-superusers"
            ),
            Self::NotProtected => write!(
                f,
                "table has no immutability trigger; auditing it would record changes that succeed"
            ),
        }
    }
}

/// Outcome of one independent installation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    AlreadyPresent,
    Skipped(SkipReason),
    Failed { error: String },
}

impl StepOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Applied | Self::AlreadyPresent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallStep {
    pub category: ControlCategory,
    /// Object acted on, e.g. `public.customers` or `users_owner_requires_shop`.
    pub target: String,
    pub outcome: StepOutcome,
}

/// Ordered record of every step of an install or removal run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub steps: Vec<InstallStep>,
}

impl InstallReport {
    fn record(&mut self, category: ControlCategory, object: impl fmt::Display, outcome: StepOutcome) {
        let object = object.to_string();
        match &outcome {
            StepOutcome::Applied => info!(%category, %object, "applied"),
            StepOutcome::AlreadyPresent => info!(%category, %object, "already present"),
            StepOutcome::Skipped(reason) => {
                warn!(target: "security", %category, %object, %reason, "step skipped");
            }
            StepOutcome::Failed { error } => {
                warn!(target: "security", %category, %object, %error, "step failed");
            }
        }
        self.steps.push(InstallStep {
            category,
            target: object,
            outcome,
        });
    }

    pub fn merge(&mut self, other: Self) {
        self.steps.extend(other.steps);
    }

    pub fn failed(&self) -> impl Iterator<Item = &InstallStep> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&InstallStep, &SkipReason)> {
        self.steps.iter().filter_map(|s| match &s.outcome {
            StepOutcome::Skipped(reason) => Some((s, reason)),
            _ => None,
        })
    }

    /// Role constraints deferred because of legacy rows, with their count.
    pub fn deferred_roles(&self) -> impl Iterator<Item = (PrivilegedRole, i64)> + '_ {
        self.skipped().filter_map(|(_, reason)| match reason {
            SkipReason::LegacyViolations { role, count } => Some((*role, *count)),
            _ => None,
        })
    }

    /// Number of steps that ended applied or already present.
    #[must_use]
    pub fn ok_count(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.is_ok()).count()
    }

    /// Turn a run aborted on a shared function into a one-step report, so
    /// the caller can still verify and print remediation.
    ///
    /// # Errors
    /// Returns `err` unchanged unless it is [`GuardError::SharedFunction`].
    pub fn from_abort(err: GuardError, schema: &str) -> Result<Self> {
        let GuardError::SharedFunction { function, source } = err else {
            return Err(err);
        };
        let category = if function == AUDIT_FUNCTION {
            ControlCategory::Auditing
        } else {
            ControlCategory::Immutability
        };
        let mut report = Self::default();
        report.record(
            category,
            QualifiedName::new(schema, function),
            failed(source),
        );
        Ok(report)
    }
}

fn failed(e: impl fmt::Display) -> StepOutcome {
    StepOutcome::Failed {
        error: e.to_string(),
    }
}

/// Applies and removes the tenant invariants.
pub struct Installer<'a, B: ?Sized> {
    backend: &'a B,
    config: &'a GuardConfig,
}

impl<'a, B> Installer<'a, B>
where
    B: SchemaCatalog + SchemaExecutor + ?Sized,
{
    #[must_use]
    pub fn new(backend: &'a B, config: &'a GuardConfig) -> Self {
        Self { backend, config }
    }

    fn qualify(&self, name: &str) -> QualifiedName {
        QualifiedName::new(&self.config.schema.schema, name)
    }

    /// Tables carrying `shop_id` in the configured schema, as reported by the
    /// catalog.
    async fn tenant_tables(&self) -> std::result::Result<BTreeSet<String>, CatalogError> {
        self.backend
            .tables_with_column(&self.config.schema.schema, TENANT_COLUMN)
            .await
    }

    /// Candidates that exist, carry `shop_id` and are not excluded, in
    /// candidate order.
    ///
    /// # Errors
    /// Returns an error if the catalog cannot be queried.
    pub async fn discover_protected_tables(
        &self,
    ) -> std::result::Result<Vec<QualifiedName>, CatalogError> {
        let present = self.tenant_tables().await?;
        let schema = &self.config.schema;
        let mut seen = BTreeSet::new();
        Ok(schema
            .candidate_tables
            .iter()
            .filter(|t| !schema.is_excluded(t) && present.contains(t.as_str()))
            .filter(|t| seen.insert(t.as_str()))
            .map(|t| self.qualify(t))
            .collect())
    }

    /// Run all three control categories.
    ///
    /// # Errors
    /// Returns an error only if a shared trigger function cannot be created.
    pub async fn install_all(&self) -> Result<InstallReport> {
        let mut report = self.apply_immutability().await?;
        report.merge(self.apply_ownership_constraints().await);
        report.merge(self.apply_auditing().await?);
        info!(
            steps = report.steps.len(),
            ok = report.ok_count(),
            failed = report.failed().count(),
            "tenant guard installation finished"
        );
        Ok(report)
    }

    /// Create the write-once function and bind it to every protected table.
    ///
    /// # Errors
    /// Returns [`GuardError::SharedFunction`] if the function cannot be
    /// created. Table failures are recorded in the report instead.
    pub async fn apply_immutability(&self) -> Result<InstallReport> {
        let function = self.qualify(IMMUTABILITY_FUNCTION);
        self.backend
            .execute(&Ddl::CreateFunction(TriggerFunction::Immutability {
                function: function.clone(),
            }))
            .await
            .map_err(|source| GuardError::SharedFunction {
                function: IMMUTABILITY_FUNCTION,
                source,
            })?;

        let mut report = InstallReport::default();
        report.record(ControlCategory::Immutability, &function, StepOutcome::Applied);

        let tables = match self.discover_protected_tables().await {
            Ok(tables) => tables,
            Err(e) => {
                report.record(ControlCategory::Immutability, "table discovery", failed(e));
                return Ok(report);
            }
        };
        if tables.is_empty() {
            warn!(target: "security", "no candidate table carries {TENANT_COLUMN}; nothing to protect");
        }

        for table in tables {
            let outcome = self.rebind(&table, IMMUTABILITY_TRIGGER, &function).await;
            report.record(ControlCategory::Immutability, &table, outcome);
        }
        Ok(report)
    }

    /// Install one check constraint per privileged role, skipping any role
    /// whose existing rows would violate it.
    pub async fn apply_ownership_constraints(&self) -> InstallReport {
        let schema = &self.config.schema;
        let table = self.qualify(&schema.principal_table);
        let mut report = InstallReport::default();

        for role in PrivilegedRole::ALL {
            let name = role.constraint_name(&table.name);
            let outcome = self.apply_role_constraint(&table, role, &name).await;
            report.record(ControlCategory::Ownership, &name, outcome);
        }
        report
    }

    async fn apply_role_constraint(
        &self,
        table: &QualifiedName,
        role: PrivilegedRole,
        name: &str,
    ) -> StepOutcome {
        match self.backend.constraint_exists(table, name).await {
            Ok(true) => return StepOutcome::AlreadyPresent,
            Ok(false) => {}
            Err(e) => return failed(e),
        }

        let role_column = &self.config.schema.role_column;
        match self
            .backend
            .count_missing_tenant(table, role_column, role.as_str())
            .await
        {
            Ok(0) => {}
            Ok(count) => return StepOutcome::Skipped(SkipReason::LegacyViolations { role, count }),
            Err(e) => return failed(e),
        }

        let ddl = Ddl::AddOwnershipConstraint {
            table: table.clone(),
            role_column: role_column.clone(),
            role,
        };
        match self.backend.execute(&ddl).await {
            Ok(()) => StepOutcome::Applied,
            Err(e) => failed(e),
        }
    }

    /// Create the audit function and bind it to the high-sensitivity tables.
    ///
    /// # Errors
    /// Returns [`GuardError::SharedFunction`] if the audit function cannot be
    /// created.
    pub async fn apply_auditing(&self) -> Result<InstallReport> {
        let audit = &self.config.audit;
        let mut report = InstallReport::default();

        let write = if audit.autonomous {
            self.ensure_dblink(&mut report).await
        } else {
            AuditWrite::Inline
        };

        let function = self.qualify(AUDIT_FUNCTION);
        self.backend
            .execute(&Ddl::CreateFunction(TriggerFunction::Audit {
                function: function.clone(),
                sink: self.qualify(&audit.sink_table),
                write,
            }))
            .await
            .map_err(|source| GuardError::SharedFunction {
                function: AUDIT_FUNCTION,
                source,
            })?;
        report.record(ControlCategory::Auditing, &function, StepOutcome::Applied);

        let present = match self.tenant_tables().await {
            Ok(present) => present,
            Err(e) => {
                report.record(ControlCategory::Auditing, "table discovery", failed(e));
                return Ok(report);
            }
        };
        let schema = &self.config.schema;

        for name in &audit.audited_tables {
            let table = self.qualify(name);
            let protected = !schema.is_excluded(name) && schema.candidate_tables.contains(name);
            let outcome = if !present.contains(name.as_str()) {
                StepOutcome::Skipped(SkipReason::TableMissing)
            } else if protected {
                self.rebind(&table, AUDIT_TRIGGER, &function).await
            } else {
                StepOutcome::Skipped(SkipReason::NotProtected)
            };
            report.record(ControlCategory::Auditing, &table, outcome);
        }
        Ok(report)
    }

    async fn ensure_dblink(&self, report: &mut InstallReport) -> AuditWrite {
        let outcome = match self.backend.extension_installed(DBLINK_EXTENSION).await {
            Ok(true) => StepOutcome::AlreadyPresent,
            _ => match self
                .backend
                .execute(&Ddl::CreateExtension {
                    name: DBLINK_EXTENSION,
                })
                .await
            {
                Ok(()) => StepOutcome::Applied,
                Err(e) => StepOutcome::Skipped(SkipReason::ExtensionUnavailable {
                    error: e.to_string(),
                }),
            },
        };
        let extension_ok = outcome.is_ok();
        report.record(
            ControlCategory::Auditing,
            format!("extension {DBLINK_EXTENSION}"),
            outcome,
        );
        if !extension_ok {
            return AuditWrite::Inline;
        }

        let conninfo = self.config.audit.loopback_conninfo.clone();
        let outcome = match self.backend.check_loopback(conninfo.as_deref()).await {
            Ok(()) => StepOutcome::Applied,
            Err(e) => StepOutcome::Skipped(SkipReason::LoopbackUnavailable {
                error: e.to_string(),
            }),
        };
        let loopback_ok = outcome.is_ok();
        report.record(ControlCategory::Auditing, "loopback connection", outcome);
        if loopback_ok {
            AuditWrite::Autonomous { conninfo }
        } else {
            AuditWrite::Inline
        }
    }

    /// Drop `trigger` on `table` if present, then create it bound to
    /// `function`.
    async fn rebind(
        &self,
        table: &QualifiedName,
        trigger: &'static str,
        function: &QualifiedName,
    ) -> StepOutcome {
        let drop = Ddl::DropTrigger {
            table: table.clone(),
            trigger,
        };
        let create = Ddl::CreateTrigger {
            table: table.clone(),
            trigger,
            function: function.clone(),
        };
        if let Err(e) = self.backend.execute(&drop).await {
            return failed(e);
        }
        match self.backend.execute(&create).await {
            Ok(()) => StepOutcome::Applied,
            Err(e) => failed(e),
        }
    }

    /// Drop every trigger, constraint and shared function this installer
    /// creates. Safe on partially installed or clean databases.
    pub async fn remove_all(&self) -> InstallReport {
        let mut report = InstallReport::default();
        let schema = &self.config.schema;

        match self.tenant_tables().await {
            Ok(present) => {
                let bound: BTreeSet<&str> = schema
                    .candidate_tables
                    .iter()
                    .chain(&self.config.audit.audited_tables)
                    .map(String::as_str)
                    .filter(|t| present.contains(*t))
                    .collect();
                for name in bound {
                    let table = self.qualify(name);
                    for (category, trigger) in [
                        (ControlCategory::Auditing, AUDIT_TRIGGER),
                        (ControlCategory::Immutability, IMMUTABILITY_TRIGGER),
                    ] {
                        let outcome = self
                            .drop_outcome(&Ddl::DropTrigger {
                                table: table.clone(),
                                trigger,
                            })
                            .await;
                        report.record(category, format!("{table} {trigger}"), outcome);
                    }
                }
            }
            Err(e) => report.record(ControlCategory::Immutability, "table discovery", failed(e)),
        }

        let principal = self.qualify(&schema.principal_table);
        for role in PrivilegedRole::ALL {
            let name = role.constraint_name(&principal.name);
            let outcome = self
                .drop_outcome(&Ddl::DropConstraint {
                    table: principal.clone(),
                    name: name.clone(),
                })
                .await;
            report.record(ControlCategory::Ownership, name, outcome);
        }

        for (category, function) in [
            (ControlCategory::Auditing, AUDIT_FUNCTION),
            (ControlCategory::Immutability, IMMUTABILITY_FUNCTION),
        ] {
            let function = self.qualify(function);
            let outcome = self
                .drop_outcome(&Ddl::DropFunction {
                    function: function.clone(),
                })
                .await;
            report.record(category, function, outcome);
        }
        report
    }

    async fn drop_outcome(&self, ddl: &Ddl) -> StepOutcome {
        match self.backend.execute(ddl).await {
            Ok(()) => StepOutcome::Applied,
            Err(e) => failed(e),
        }
    }
}
