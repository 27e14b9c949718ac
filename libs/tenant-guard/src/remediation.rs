//! Operator guidance for an installation that is not fully enforced.

use serde::Serialize;

use crate::TENANT_COLUMN;
use crate::config::GuardConfig;
use crate::ddl::{QualifiedName, quote_ident, quote_literal};
use crate::installer::{InstallReport, StepOutcome};
use crate::policy::PrivilegedRole;
use crate::verifier::VerificationReport;

/// Command that applies every control.
pub const APPLY_COMMAND: &str = "shopguard apply";

/// What the operator has to do next. Empty when nothing is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Remediation {
    /// Ordered human-readable actions.
    pub actions: Vec<String>,
    /// Queries listing legacy rows that block an ownership constraint.
    pub queries: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.queries.is_empty()
    }

    /// Build guidance from a verification report and, when available, the
    /// install run that preceded it.
    #[must_use]
    pub fn plan(
        report: &VerificationReport,
        install: Option<&InstallReport>,
        config: &GuardConfig,
    ) -> Self {
        let mut out = Self::default();
        let principal = QualifiedName::new(&config.schema.schema, &config.schema.principal_table);

        if let Some(install) = install {
            for step in install.failed() {
                if let StepOutcome::Failed { error } = &step.outcome {
                    out.actions.push(format!(
                        "{} step on {} failed: {error}",
                        step.category, step.target
                    ));
                    if let Some(hint) = permission_hint(error, &step.target, config) {
                        out.actions.push(hint);
                    }
                }
            }
        }

        if !report.triggers_active {
            out.actions.push(format!(
                "immutability triggers are not installed; run `{APPLY_COMMAND}`"
            ));
        }

        let coverage = &report.constraint_coverage;
        if !report.constraints_active {
            if coverage.is_partial() {
                out.actions.push(format!(
                    "SECURITY GAP: only {} of {} ownership constraints are installed; \
                     partial coverage is not enforcement",
                    coverage.present, coverage.expected
                ));
            } else {
                out.actions.push(format!(
                    "no ownership constraints are installed (0 of {})",
                    coverage.expected
                ));
            }
            for role in &coverage.missing {
                let blocked = install
                    .and_then(|i| i.deferred_roles().find(|(r, _)| r == role))
                    .map(|(_, count)| count);
                if let Some(count) = blocked {
                    out.actions.push(format!(
                        "{count} '{role}' row(s) in {principal} have no {TENANT_COLUMN}; \
                         assign a shop or delete them, then run `{APPLY_COMMAND}`"
                    ));
                }
                out.queries.push(violating_rows_query(
                    &principal,
                    &config.schema.role_column,
                    *role,
                ));
            }
            out.actions.push(format!(
                "after fixing legacy rows, run `{APPLY_COMMAND}` to create the missing constraints"
            ));
        }

        if !report.auditing_active {
            out.actions.push(format!(
                "audit trigger function is not installed; run `{APPLY_COMMAND}`"
            ));
        }
        out
    }
}

/// Concrete privilege fix for a step that failed on a permission error.
fn permission_hint(error: &str, target: &str, config: &GuardConfig) -> Option<String> {
    let schema = &config.schema.schema;
    if error.contains("permission denied for schema") {
        Some(format!(
            "grant CREATE on schema {schema} to the installing role, or run as the schema \
             owner, then run `{APPLY_COMMAND}`"
        ))
    } else if error.contains("must be owner of") {
        Some(format!(
            "run as the owner of {target}, then run `{APPLY_COMMAND}`"
        ))
    } else {
        None
    }
}

/// Query listing principals of `role` that have no tenant.
#[must_use]
pub fn violating_rows_query(
    principal: &QualifiedName,
    role_column: &str,
    role: PrivilegedRole,
) -> String {
    let role_col = quote_ident(role_column);
    format!(
        "SELECT id, {role_col} FROM {} WHERE {role_col}::text = {} AND {} IS NULL;",
        principal.quoted(),
        quote_literal(role.as_str()),
        quote_ident(TENANT_COLUMN)
    )
}
