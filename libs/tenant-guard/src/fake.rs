//! In-memory schema used by the unit tests of the installer and verifier.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::catalog::{SchemaCatalog, SchemaExecutor};
use crate::ddl::{Ddl, QualifiedName};
use crate::error::CatalogError;

/// Objects the installer manages, as currently installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// function name -> rendered SQL
    pub functions: BTreeMap<String, String>,
    /// (table, trigger) -> function name
    pub triggers: BTreeMap<(String, String), String>,
    pub constraints: BTreeSet<String>,
    pub extensions: BTreeSet<String>,
}

impl Snapshot {
    pub fn is_clean(&self) -> bool {
        self.functions.is_empty() && self.triggers.is_empty() && self.constraints.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct FakeSchema {
    tenant_tables: BTreeSet<String>,
    null_tenant_rows: BTreeMap<String, i64>,
    fail_tables: BTreeSet<String>,
    fail_functions: BTreeSet<String>,
    fail_queries: BTreeSet<&'static str>,
    no_dblink: bool,
    loopback_error: Option<String>,
    state: Mutex<Snapshot>,
    add_constraint_calls: AtomicUsize,
}

const ALL_QUERIES: [&str; 7] = [
    "tables_with_column",
    "function_exists",
    "function_source",
    "constraint_exists",
    "count_triggers",
    "extension_installed",
    "count_missing_tenant",
];

impl FakeSchema {
    /// Tables that exist and carry `shop_id`.
    pub fn with_tables(tables: &[&str]) -> Self {
        Self {
            tenant_tables: tables.iter().map(|t| (*t).to_owned()).collect(),
            ..Default::default()
        }
    }

    pub fn without_tenant_column(mut self, table: &str) -> Self {
        self.tenant_tables.remove(table);
        self
    }

    pub fn failing_on_table(mut self, table: &str) -> Self {
        self.fail_tables.insert(table.to_owned());
        self
    }

    pub fn failing_on_function(mut self, function: &str) -> Self {
        self.fail_functions.insert(function.to_owned());
        self
    }

    pub fn with_null_tenant_rows(mut self, role: &str, count: i64) -> Self {
        self.null_tenant_rows.insert(role.to_owned(), count);
        self
    }

    pub fn without_dblink(mut self) -> Self {
        self.no_dblink = true;
        self
    }

    /// dblink is available but the loopback connection is refused.
    pub fn refusing_loopback(mut self, error: &str) -> Self {
        self.loopback_error = Some(error.to_owned());
        self
    }

    /// Make one catalog query fail.
    pub fn failing_query(mut self, query: &'static str) -> Self {
        self.fail_queries.insert(query);
        self
    }

    /// Make every catalog query fail.
    pub fn catalog_down(mut self) -> Self {
        self.fail_queries.extend(ALL_QUERIES);
        self
    }

    /// Pretend a constraint was created outside the installer.
    pub fn with_constraint(self, name: &str) -> Self {
        self.state.lock().unwrap().constraints.insert(name.to_owned());
        self
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().unwrap().clone()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.state.lock().unwrap().functions.contains_key(name)
    }

    pub fn has_trigger(&self, table: &str, trigger: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .triggers
            .contains_key(&(table.to_owned(), trigger.to_owned()))
    }

    pub fn has_constraint(&self, name: &str) -> bool {
        self.state.lock().unwrap().constraints.contains(name)
    }

    pub fn add_constraint_calls(&self) -> usize {
        self.add_constraint_calls.load(Ordering::SeqCst)
    }

    pub fn audit_write_is_autonomous(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .functions
            .get(crate::ddl::AUDIT_FUNCTION)
            .is_some_and(|sql| sql.contains("dblink_exec"))
    }

    fn query(&self, name: &'static str) -> Result<(), CatalogError> {
        if self.fail_queries.contains(name) {
            Err(CatalogError::Unavailable(format!("injected failure in {name}")))
        } else {
            Ok(())
        }
    }

    fn table_exists(&self, table: &QualifiedName) -> Result<(), CatalogError> {
        if self.tenant_tables.contains(&table.name) {
            Ok(())
        } else {
            Err(CatalogError::Unavailable(format!(
                "relation \"{table}\" does not exist"
            )))
        }
    }
}

#[async_trait]
impl SchemaCatalog for FakeSchema {
    async fn tables_with_column(
        &self,
        _schema: &str,
        _column: &str,
    ) -> Result<BTreeSet<String>, CatalogError> {
        self.query("tables_with_column")?;
        Ok(self.tenant_tables.clone())
    }

    async fn function_exists(&self, function: &QualifiedName) -> Result<bool, CatalogError> {
        self.query("function_exists")?;
        Ok(self.has_function(&function.name))
    }

    async fn function_source(
        &self,
        function: &QualifiedName,
    ) -> Result<Option<String>, CatalogError> {
        self.query("function_source")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .functions
            .get(&function.name)
            .cloned())
    }

    async fn constraint_exists(
        &self,
        _table: &QualifiedName,
        constraint: &str,
    ) -> Result<bool, CatalogError> {
        self.query("constraint_exists")?;
        Ok(self.has_constraint(constraint))
    }

    async fn count_triggers(&self, _schema: &str, pattern: &str) -> Result<i64, CatalogError> {
        self.query("count_triggers")?;
        let prefix = pattern.trim_end_matches('%');
        let n = self
            .state
            .lock()
            .unwrap()
            .triggers
            .keys()
            .filter(|(_, trigger)| trigger.starts_with(prefix))
            .count();
        Ok(i64::try_from(n).unwrap())
    }

    async fn extension_installed(&self, name: &str) -> Result<bool, CatalogError> {
        self.query("extension_installed")?;
        Ok(self.state.lock().unwrap().extensions.contains(name))
    }

    async fn count_missing_tenant(
        &self,
        table: &QualifiedName,
        _role_column: &str,
        role: &str,
    ) -> Result<i64, CatalogError> {
        self.query("count_missing_tenant")?;
        self.table_exists(table)?;
        Ok(self.null_tenant_rows.get(role).copied().unwrap_or(0))
    }
}

#[async_trait]
impl SchemaExecutor for FakeSchema {
    async fn execute(&self, ddl: &Ddl) -> Result<(), CatalogError> {
        let mut state = self.state.lock().unwrap();
        match ddl {
            Ddl::CreateExtension { name } => {
                if self.no_dblink {
                    return Err(CatalogError::Unavailable(format!(
                        "could not open extension control file \"{name}.control\""
                    )));
                }
                state.extensions.insert((*name).to_owned());
            }
            Ddl::CreateFunction(function) => {
                let name = &function.name().name;
                if self.fail_functions.contains(name) {
                    return Err(CatalogError::Unavailable(format!(
                        "permission denied to create function {name}"
                    )));
                }
                state.functions.insert(name.clone(), ddl.to_sql());
            }
            Ddl::DropFunction { function } => {
                state.functions.remove(&function.name);
                // CASCADE
                state.triggers.retain(|_, f| *f != function.name);
            }
            Ddl::CreateTrigger {
                table,
                trigger,
                function,
            } => {
                self.table_exists(table)?;
                if self.fail_tables.contains(&table.name) {
                    return Err(CatalogError::Unavailable(format!(
                        "must be owner of table {}",
                        table.name
                    )));
                }
                if !state.functions.contains_key(&function.name) {
                    return Err(CatalogError::Unavailable(format!(
                        "function {function}() does not exist"
                    )));
                }
                let key = (table.name.clone(), (*trigger).to_owned());
                if state.triggers.contains_key(&key) {
                    return Err(CatalogError::Unavailable(format!(
                        "trigger \"{trigger}\" for relation \"{}\" already exists",
                        table.name
                    )));
                }
                state.triggers.insert(key, function.name.clone());
            }
            Ddl::DropTrigger { table, trigger } => {
                self.table_exists(table)?;
                state
                    .triggers
                    .remove(&(table.name.clone(), (*trigger).to_owned()));
            }
            Ddl::AddOwnershipConstraint { table, role, .. } => {
                self.table_exists(table)?;
                self.add_constraint_calls.fetch_add(1, Ordering::SeqCst);
                let name = role.constraint_name(&table.name);
                if !state.constraints.insert(name.clone()) {
                    return Err(CatalogError::Unavailable(format!(
                        "constraint \"{name}\" for relation \"{}\" already exists",
                        table.name
                    )));
                }
            }
            Ddl::DropConstraint { name, .. } => {
                state.constraints.remove(name);
            }
        }
        Ok(())
    }

    async fn check_loopback(&self, _conninfo: Option<&str>) -> Result<(), CatalogError> {
        if !self.state.lock().unwrap().extensions.contains(crate::ddl::DBLINK_EXTENSION) {
            return Err(CatalogError::Unavailable(
                "function dblink_exec(text, unknown) does not exist".to_owned(),
            ));
        }
        match &self.loopback_error {
            Some(error) => Err(CatalogError::Unavailable(error.clone())),
            None => Ok(()),
        }
    }
}
