use crate::schema::TableDef;
use crate::sql::{render_create_table, render_insert, Dialect};
use crate::value::Row;
use crate::AuditError;

/// Execution context a migration runner hands to step listeners.
///
/// In text-emission mode (`as_sql() == true`) statements are rendered
/// instead of executed; callers pick `emit_create_table` over
/// `create_table` accordingly. `bulk_insert` covers both modes.
pub trait MigrationContext {
    fn as_sql(&self) -> bool;

    fn dialect(&self) -> Dialect;

    /// Creates `table` unless it already exists.
    #[allow(clippy::missing_errors_doc)]
    fn create_table(&mut self, table: &TableDef) -> Result<(), AuditError>;

    #[allow(clippy::missing_errors_doc)]
    fn emit_create_table(&mut self, table: &TableDef) -> Result<(), AuditError>;

    #[allow(clippy::missing_errors_doc)]
    fn bulk_insert(&mut self, table: &TableDef, rows: &[Row]) -> Result<(), AuditError>;
}

/// Offline context collecting rendered SQL statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlScript {
    dialect: Dialect,
    statements: Vec<String>,
}

impl SqlScript {
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            statements: Vec::new(),
        }
    }

    #[must_use]
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Appends a statement produced outside the history table, such as the
    /// runner's own DDL.
    pub fn push_statement(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }

    /// The whole script, one `;`-terminated statement per paragraph.
    #[must_use]
    pub fn render(&self) -> String {
        self.statements
            .iter()
            .map(|statement| format!("{statement};\n"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl MigrationContext for SqlScript {
    fn as_sql(&self) -> bool {
        true
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn create_table(&mut self, table: &TableDef) -> Result<(), AuditError> {
        Err(AuditError::Execution(format!(
            "cannot create {} physically while emitting SQL text",
            table.qualified_name()
        )))
    }

    fn emit_create_table(&mut self, table: &TableDef) -> Result<(), AuditError> {
        self.statements
            .push(render_create_table(table, self.dialect, false));
        Ok(())
    }

    fn bulk_insert(&mut self, table: &TableDef, rows: &[Row]) -> Result<(), AuditError> {
        for row in rows {
            let statement = render_insert(table, row, self.dialect)?;
            self.statements.push(statement);
        }
        Ok(())
    }
}
