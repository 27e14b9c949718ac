//! Certifies from catalog metadata that the tenant invariants are active.
//!
//! The verifier never writes and never reports a category as active by
//! default: any catalog failure yields an all-false report.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::catalog::SchemaCatalog;
use crate::config::GuardConfig;
use crate::ddl::{
    AUDIT_FUNCTION, DBLINK_EXTENSION, IMMUTABILITY_FUNCTION, IMMUTABILITY_TRIGGER_PATTERN,
    QualifiedName,
};
use crate::error::CatalogError;
use crate::policy::PrivilegedRole;

/// How many of the per-role ownership constraints exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintCoverage {
    pub present: usize,
    pub expected: usize,
    /// Roles whose constraint is missing, in role order.
    pub missing: Vec<PrivilegedRole>,
}

impl Default for ConstraintCoverage {
    fn default() -> Self {
        Self {
            present: 0,
            expected: PrivilegedRole::ALL.len(),
            missing: PrivilegedRole::ALL.to_vec(),
        }
    }
}

impl ConstraintCoverage {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.present == self.expected
    }

    /// Some but not all constraints exist.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.present > 0 && !self.is_complete()
    }
}

/// Point-in-time verification result. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub triggers_active: bool,
    /// True only when every ownership constraint exists.
    pub constraints_active: bool,
    pub auditing_active: bool,
    pub constraint_coverage: ConstraintCoverage,
    /// Human-readable lines in check order.
    pub details: Vec<String>,
}

impl VerificationReport {
    /// All three categories active.
    #[must_use]
    pub fn is_enforced(&self) -> bool {
        self.triggers_active && self.constraints_active && self.auditing_active
    }

    fn fail_closed(e: &CatalogError) -> Self {
        Self {
            details: vec![format!(
                "verification failed: {e}; reporting every control as inactive"
            )],
            ..Self::default()
        }
    }
}

/// Read-only verifier.
pub struct Verifier<'a, C: ?Sized> {
    catalog: &'a C,
    config: &'a GuardConfig,
}

impl<'a, C> Verifier<'a, C>
where
    C: SchemaCatalog + ?Sized,
{
    #[must_use]
    pub fn new(catalog: &'a C, config: &'a GuardConfig) -> Self {
        Self { catalog, config }
    }

    /// Inspect the catalog. Never fails: a catalog error produces a report
    /// with every flag false.
    pub async fn verify(&self) -> VerificationReport {
        match self.inspect().await {
            Ok(report) => {
                info!(
                    triggers = report.triggers_active,
                    constraints = report.constraints_active,
                    auditing = report.auditing_active,
                    "tenant guard verification finished"
                );
                report
            }
            Err(e) => {
                error!(target: "security", error = %e, "tenant guard verification failed");
                VerificationReport::fail_closed(&e)
            }
        }
    }

    async fn inspect(&self) -> Result<VerificationReport, CatalogError> {
        let schema = &self.config.schema.schema;
        let mut report = VerificationReport::default();

        let immutability = QualifiedName::new(schema, IMMUTABILITY_FUNCTION);
        report.triggers_active = self.catalog.function_exists(&immutability).await?;
        report.details.push(if report.triggers_active {
            format!("immutability function {immutability} present")
        } else {
            format!("immutability function {immutability} MISSING: shop_id can be rewritten")
        });

        let coverage = self.constraint_coverage().await?;
        report.constraints_active = coverage.is_complete();
        report.details.push(constraint_detail(&coverage, &self.config.schema.principal_table));
        if coverage.is_partial() {
            warn!(
                target: "security",
                present = coverage.present,
                expected = coverage.expected,
                "ownership constraints incomplete"
            );
        }
        report.constraint_coverage = coverage;

        let audit = QualifiedName::new(schema, AUDIT_FUNCTION);
        report.auditing_active = self.catalog.function_exists(&audit).await?;
        report.details.push(if report.auditing_active {
            format!("audit function {audit} present")
        } else {
            format!("audit function {audit} MISSING: violations are not recorded")
        });

        if report.auditing_active {
            let source = self.catalog.function_source(&audit).await?.unwrap_or_default();
            let extension = self.catalog.extension_installed(DBLINK_EXTENSION).await?;
            report.details.push(audit_write_detail(
                &source,
                extension,
                self.config.audit.autonomous,
            ));
        }

        let bound = self
            .catalog
            .count_triggers(schema, IMMUTABILITY_TRIGGER_PATTERN)
            .await?;
        report
            .details
            .push(format!("{bound} table(s) carry the immutability trigger"));

        Ok(report)
    }

    async fn constraint_coverage(&self) -> Result<ConstraintCoverage, CatalogError> {
        let table = QualifiedName::new(
            &self.config.schema.schema,
            &self.config.schema.principal_table,
        );
        let mut coverage = ConstraintCoverage {
            present: 0,
            missing: Vec::new(),
            ..ConstraintCoverage::default()
        };
        for role in PrivilegedRole::ALL {
            let name = role.constraint_name(&table.name);
            if self.catalog.constraint_exists(&table, &name).await? {
                coverage.present += 1;
            } else {
                coverage.missing.push(role);
            }
        }
        Ok(coverage)
    }
}

/// Describe how the installed audit function writes. The loopback connection
/// itself is only checked at install time.
fn audit_write_detail(source: &str, extension: bool, autonomous: bool) -> String {
    if !source.contains("dblink_exec") {
        let note = if autonomous {
            " (dblink or its loopback connection was unavailable at install)"
        } else {
            ""
        };
        return format!(
            "audit function writes inline{note}: audit records roll back with the rejected statement"
        );
    }
    if extension {
        format!(
            "audit function writes through {DBLINK_EXTENSION}: records survive rejected statements \
             while the loopback connection authenticates (checked at install)"
        )
    } else {
        format!(
            "audit function expects {DBLINK_EXTENSION} but it is not installed: audit records roll \
             back with the rejected statement"
        )
    }
}

fn constraint_detail(coverage: &ConstraintCoverage, principal_table: &str) -> String {
    let ConstraintCoverage {
        present, expected, ..
    } = coverage;
    if coverage.is_complete() {
        format!("ownership constraints: {present} of {expected} present on {principal_table}")
    } else if coverage.is_partial() {
        let missing: Vec<_> = coverage
            .missing
            .iter()
            .map(|r| r.constraint_name(principal_table))
            .collect();
        format!(
            "ownership constraints INCOMPLETE: {present} of {expected} present on {principal_table} (missing: {})",
            missing.join(", ")
        )
    } else {
        format!("ownership constraints: 0 of {expected} present on {principal_table}")
    }
}
