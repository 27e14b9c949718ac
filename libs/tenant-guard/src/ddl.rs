//! Typed DDL for every object the installer creates or drops.
//!
//! Statements are built as [`Ddl`] values and rendered to SQL only at the
//! executor boundary, which keeps installer logic testable against an
//! in-memory executor.

use std::fmt;

use serde::Serialize;

use crate::TENANT_COLUMN;
use crate::policy::{IMMUTABLE_SQLSTATE, IMMUTABLE_TAG, PrivilegedRole, VIOLATION_ACTION};

/// Shared write-once trigger function.
pub const IMMUTABILITY_FUNCTION: &str = "prevent_shop_id_change";

/// Shared audit trigger function.
pub const AUDIT_FUNCTION: &str = "audit_shop_id_change_attempt";

/// Per-table immutability trigger name.
pub const IMMUTABILITY_TRIGGER: &str = "trg_shop_id_immutable";

/// Per-table audit trigger name. PostgreSQL fires same-event triggers in name
/// order, so this must sort before [`IMMUTABILITY_TRIGGER`].
pub const AUDIT_TRIGGER: &str = "trg_shop_id_audit";

/// `LIKE` pattern matching the immutability trigger on every table.
pub const IMMUTABILITY_TRIGGER_PATTERN: &str = "trg_shop_id_immutable%";

/// Extension providing the loopback connection used for durable audit rows.
pub const DBLINK_EXTENSION: &str = "dblink";

/// Fixed tags written with every audit record.
pub const AUDIT_CATEGORY: &str = "security";
pub const AUDIT_SEVERITY: &str = "critical";

/// Quote an identifier for PostgreSQL.
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal for PostgreSQL.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Schema-qualified relation or function name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    #[must_use]
    pub fn new(schema: &str, name: &str) -> Self {
        Self {
            schema: schema.to_owned(),
            name: name.to_owned(),
        }
    }

    /// `"schema"."name"`
    #[must_use]
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// How the audit function writes its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditWrite {
    /// Through `dblink_exec` on a loopback connection: an autonomous
    /// transaction that commits even though the rejected statement rolls back.
    /// Falls back to an inline write if the loopback connection fails.
    Autonomous { conninfo: Option<String> },
    /// Plain insert in the caller's transaction.
    Inline,
}

/// Body of one of the two shared trigger functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerFunction {
    Immutability {
        function: QualifiedName,
    },
    Audit {
        function: QualifiedName,
        sink: QualifiedName,
        write: AuditWrite,
    },
}

impl TriggerFunction {
    #[must_use]
    pub fn name(&self) -> &QualifiedName {
        match self {
            Self::Immutability { function } | Self::Audit { function, .. } => function,
        }
    }

    fn body(&self) -> String {
        match self {
            Self::Immutability { .. } => immutability_body(),
            Self::Audit { sink, write, .. } => audit_body(sink, write),
        }
    }
}

/// One schema-mutating statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ddl {
    CreateExtension {
        name: &'static str,
    },
    CreateFunction(TriggerFunction),
    DropFunction {
        function: QualifiedName,
    },
    CreateTrigger {
        table: QualifiedName,
        trigger: &'static str,
        function: QualifiedName,
    },
    DropTrigger {
        table: QualifiedName,
        trigger: &'static str,
    },
    AddOwnershipConstraint {
        table: QualifiedName,
        role_column: String,
        role: PrivilegedRole,
    },
    DropConstraint {
        table: QualifiedName,
        name: String,
    },
}

impl Ddl {
    #[must_use]
    pub fn to_sql(&self) -> String {
        match self {
            Self::CreateExtension { name } => {
                format!("CREATE EXTENSION IF NOT EXISTS {}", quote_ident(name))
            }
            Self::CreateFunction(function) => format!(
                "CREATE OR REPLACE FUNCTION {}()\nRETURNS trigger\nLANGUAGE plpgsql\nAS $shopguard$\n{}$shopguard$",
                function.name().quoted(),
                function.body()
            ),
            Self::DropFunction { function } => {
                format!("DROP FUNCTION IF EXISTS {}() CASCADE", function.quoted())
            }
            Self::CreateTrigger {
                table,
                trigger,
                function,
            } => format!(
                "CREATE TRIGGER {} BEFORE UPDATE ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
                quote_ident(trigger),
                table.quoted(),
                function.quoted()
            ),
            Self::DropTrigger { table, trigger } => format!(
                "DROP TRIGGER IF EXISTS {} ON {}",
                quote_ident(trigger),
                table.quoted()
            ),
            Self::AddOwnershipConstraint {
                table,
                role_column,
                role,
            } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({} <> {} OR {} IS NOT NULL)",
                table.quoted(),
                quote_ident(&role.constraint_name(&table.name)),
                quote_ident(role_column),
                quote_literal(role.as_str()),
                quote_ident(TENANT_COLUMN)
            ),
            Self::DropConstraint { table, name } => format!(
                "ALTER TABLE IF EXISTS {} DROP CONSTRAINT IF EXISTS {}",
                table.quoted(),
                quote_ident(name)
            ),
        }
    }
}

impl fmt::Display for Ddl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// The write-once predicate shared by both trigger functions.
fn violation_predicate() -> String {
    format!("OLD.{TENANT_COLUMN} IS NOT NULL AND NEW.{TENANT_COLUMN} IS DISTINCT FROM OLD.{TENANT_COLUMN}")
}

fn immutability_body() -> String {
    let predicate = violation_predicate();
    format!(
        r"BEGIN
    IF {predicate} THEN
        RAISE EXCEPTION '{IMMUTABLE_TAG}: {TENANT_COLUMN} of %.% row % cannot change from % to %',
            TG_TABLE_SCHEMA, TG_TABLE_NAME, to_jsonb(OLD) ->> 'id',
            OLD.{TENANT_COLUMN}, coalesce(NEW.{TENANT_COLUMN}::text, 'NULL')
            USING ERRCODE = '{IMMUTABLE_SQLSTATE}',
                  HINT = '{TENANT_COLUMN} is write-once; create the record under the target shop instead';
    END IF;
    RETURN NEW;
END;
"
    )
}

/// SQL expression for the loopback connection string. Without an explicit
/// `conninfo` the connection goes to `current_database()` as `current_user`
/// over the local socket, which only authenticates for superusers.
#[must_use]
pub fn loopback_conninfo_expr(conninfo: Option<&str>) -> String {
    conninfo.map_or_else(
        || "format('dbname=%s user=%s', current_database(), current_user)".to_owned(),
        quote_literal,
    )
}

/// Opens the loopback connection once and runs a no-op through it.
#[must_use]
pub fn loopback_check_sql(conninfo: Option<&str>) -> String {
    format!(
        "SELECT dblink_exec({}, 'SELECT 1') AS status",
        loopback_conninfo_expr(conninfo)
    )
}

fn audit_body(sink: &QualifiedName, write: &AuditWrite) -> String {
    let predicate = violation_predicate();
    let sink_schema = quote_literal(&sink.schema);
    let sink_table = quote_literal(&sink.name);
    let write_stmt = match write {
        AuditWrite::Inline => "EXECUTE v_sql;".to_owned(),
        AuditWrite::Autonomous { conninfo } => {
            let conninfo = loopback_conninfo_expr(conninfo.as_deref());
            format!(
                r"BEGIN
            PERFORM dblink_exec({conninfo}, v_sql);
        EXCEPTION WHEN OTHERS THEN
            RAISE WARNING 'shopguard: autonomous audit write failed (%), writing inline', SQLERRM;
            EXECUTE v_sql;
        END;"
            )
        }
    };
    format!(
        r"DECLARE
    v_record_id text := to_jsonb(OLD) ->> 'id';
    v_details jsonb;
    v_sql text;
BEGIN
    IF {predicate} THEN
        v_details := jsonb_build_object(
            'schema', TG_TABLE_SCHEMA,
            'table', TG_TABLE_NAME,
            'old_shop_id', OLD.{TENANT_COLUMN},
            'attempted_shop_id', NEW.{TENANT_COLUMN});
        v_sql := format(
            'INSERT INTO %I.%I (category, action, entity_type, entity_id, description, details, severity) '
            'VALUES (%L, %L, %L, %L, %L, %L::jsonb, %L)',
            {sink_schema}, {sink_table},
            '{AUDIT_CATEGORY}', '{VIOLATION_ACTION}', TG_TABLE_NAME, v_record_id,
            format('Attempt to change {TENANT_COLUMN} on %s.%s row %s from %s to %s',
                   TG_TABLE_SCHEMA, TG_TABLE_NAME, coalesce(v_record_id, '?'),
                   OLD.{TENANT_COLUMN}, coalesce(NEW.{TENANT_COLUMN}::text, 'NULL')),
            v_details::text,
            '{AUDIT_SEVERITY}');
        {write_stmt}
    END IF;
    RETURN NEW;
END;
"
    )
}
