//! The tenant invariants as pure checks.
//!
//! The PL/pgSQL generated in [`crate::ddl`] is the enforcing copy of these
//! rules; the functions here evaluate the same predicates on before/after
//! values so callers and tests can reason about a transition without a
//! database.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Message tag raised by the immutability trigger. Callers match on it to
/// tell a tenant rejection apart from any other failure.
pub const IMMUTABLE_TAG: &str = "SHOP_ID_IMMUTABLE";

/// SQLSTATE raised by the immutability trigger (class `SG`, not predefined by
/// PostgreSQL).
pub const IMMUTABLE_SQLSTATE: &str = "SG001";

/// Suffix shared by every ownership constraint name.
pub const OWNERSHIP_CONSTRAINT_SUFFIX: &str = "_requires_shop";

/// Action tag written to the audit sink for an immutability violation.
pub const VIOLATION_ACTION: &str = "shop_id_change_attempt";

/// Allowed `shop_id` transitions on UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Value did not change (including null -> null).
    Unchanged,
    /// The one legal change: null -> value.
    InitialAssignment,
}

/// An attempt to change an already-assigned tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantViolation<T> {
    pub old: T,
    pub attempted: Option<T>,
}

/// Write-once rule for the tenant identifier.
pub struct ImmutabilityPolicy;

impl ImmutabilityPolicy {
    /// Evaluate an UPDATE of the tenant identifier from `old` to `new`.
    ///
    /// # Errors
    /// Returns the violation when `old` is set and `new` differs from it,
    /// including an attempt to clear it.
    pub fn check<T: PartialEq + Clone>(
        old: Option<&T>,
        new: Option<&T>,
    ) -> Result<Transition, TenantViolation<T>> {
        match (old, new) {
            (None, None) => Ok(Transition::Unchanged),
            (None, Some(_)) => Ok(Transition::InitialAssignment),
            (Some(o), Some(n)) if o == n => Ok(Transition::Unchanged),
            (Some(o), n) => Err(TenantViolation {
                old: o.clone(),
                attempted: n.cloned(),
            }),
        }
    }
}

/// Roles that act inside a single shop and therefore must carry its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegedRole {
    Owner,
    Employee,
    Kiosk,
}

impl PrivilegedRole {
    pub const ALL: [Self; 3] = [Self::Owner, Self::Employee, Self::Kiosk];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Employee => "employee",
            Self::Kiosk => "kiosk",
        }
    }

    /// Name of this role's check constraint on the principal table, e.g.
    /// `users_owner_requires_shop`.
    #[must_use]
    pub fn constraint_name(self, principal_table: &str) -> String {
        format!(
            "{principal_table}_{}{OWNERSHIP_CONSTRAINT_SUFFIX}",
            self.as_str()
        )
    }

    #[must_use]
    pub fn parse(role: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == role)
    }
}

impl fmt::Display for PrivilegedRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A privileged principal without a tenant identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipViolation {
    pub role: PrivilegedRole,
}

/// Privileged principals must belong to a shop.
pub struct OwnershipPolicy;

impl OwnershipPolicy {
    /// # Errors
    /// Returns the violation when `role` is privileged and `has_shop` is false.
    pub fn check(role: &str, has_shop: bool) -> Result<(), OwnershipViolation> {
        match PrivilegedRole::parse(role) {
            Some(role) if !has_shop => Err(OwnershipViolation { role }),
            _ => Ok(()),
        }
    }
}

/// Classification of a database error returned for a rejected mutation.
///
/// A rejection is terminal for the statement: retrying the same payload
/// fails the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    /// The immutability trigger refused a `shop_id` change.
    TenantImmutable,
    /// An ownership check constraint refused a principal without a shop.
    OwnershipConstraint { constraint: String },
    /// Anything else, including generic constraint violations.
    Other,
}

impl Rejection {
    /// Classify a driver error message.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        if message.contains(IMMUTABLE_TAG) {
            return Self::TenantImmutable;
        }
        match violated_check_constraint(message) {
            Some(name) if name.ends_with(OWNERSHIP_CONSTRAINT_SUFFIX) => {
                Self::OwnershipConstraint {
                    constraint: name.to_owned(),
                }
            }
            _ => Self::Other,
        }
    }

    #[must_use]
    pub fn is_tenant_rejection(&self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TenantImmutable => f.write_str("tenant-immutable rejection"),
            Self::OwnershipConstraint { constraint } => {
                write!(f, "ownership constraint {constraint}")
            }
            Self::Other => f.write_str("unclassified failure"),
        }
    }
}

/// Extract `name` from `... violates check constraint "name"`.
fn violated_check_constraint(message: &str) -> Option<&str> {
    const MARKER: &str = "violates check constraint \"";
    let start = message.find(MARKER)? + MARKER.len();
    let rest = &message[start..];
    rest.find('"').map(|end| &rest[..end])
}
