#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Tenant-isolation enforcement for the shop database.
//!
//! Every tenant-scoped row carries a `shop_id`. This crate makes that column
//! write-once and mandatory for privileged principals at the database level,
//! and records every attempted violation in the audit sink:
//!
//! - [`installer::Installer`] creates the shared trigger functions, per-table
//!   triggers and per-role check constraints (idempotent, per-table
//!   degradation).
//! - [`verifier::Verifier`] certifies from catalog metadata alone that each
//!   control category is active (fail-closed).
//! - [`harness::ProtocolHarness`] performs real mutations against the
//!   protected tables and checks accept/reject behaviour and audit side
//!   effects.
//!
//! The database seams are the [`catalog::SchemaCatalog`] and
//! [`catalog::SchemaExecutor`] traits; [`catalog::PgCatalog`] implements both
//! over a `SeaORM` connection.
//!
//! # Example
//! ```rust,no_run
//! use tenant_guard::{GuardConfig, GuardDb, Installer, Verifier};
//!
//! # async fn run() -> tenant_guard::Result<()> {
//! let config = GuardConfig::load(None)?;
//! let db = GuardDb::connect(&config.database).await?;
//! let catalog = db.catalog();
//!
//! let install = Installer::new(&catalog, &config).install_all().await?;
//! let report = Verifier::new(&catalog, &config).verify().await;
//! assert!(install.failed().next().is_none() && report.is_enforced());
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod conn;
pub mod ddl;
pub mod error;
pub mod harness;
pub mod installer;
pub mod policy;
pub mod remediation;
pub mod verifier;

#[cfg(test)]
mod fake;

pub use catalog::{PgCatalog, SchemaCatalog, SchemaExecutor};
pub use config::{AuditConfig, DatabaseConfig, GuardConfig, HarnessConfig, SchemaConfig};
pub use conn::{GuardDb, redact_credentials_in_dsn};
pub use error::{CatalogError, ConfigError, GuardError, Result};
pub use harness::{HarnessSummary, ProtocolHarness, Scenario, ScenarioResult};
pub use installer::{ControlCategory, InstallReport, InstallStep, Installer, SkipReason, StepOutcome};
pub use policy::{ImmutabilityPolicy, OwnershipPolicy, PrivilegedRole, Rejection, Transition};
pub use remediation::{Remediation, violating_rows_query};
pub use verifier::{ConstraintCoverage, VerificationReport, Verifier};

/// The tenant identifier column guarded by every control in this crate.
pub const TENANT_COLUMN: &str = "shop_id";
