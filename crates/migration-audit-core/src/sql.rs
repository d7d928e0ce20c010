//! SQL text rendering for history tables.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::schema::{ColumnDef, ColumnType, TableDef};
use crate::value::{ColumnValue, Row};
use crate::{format_rfc3339, AuditError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Sqlite,
    Postgresql,
}

#[must_use]
pub fn render_column_type(column: &ColumnDef, dialect: Dialect) -> String {
    match (column.column_type, dialect) {
        // SQLite only aliases the rowid for a column declared exactly INTEGER.
        (ColumnType::Integer | ColumnType::BigInteger, Dialect::Sqlite) => "INTEGER".to_string(),
        (ColumnType::Integer, Dialect::Postgresql) if column.primary_key => "SERIAL".to_string(),
        (ColumnType::BigInteger, Dialect::Postgresql) if column.primary_key => {
            "BIGSERIAL".to_string()
        }
        (ColumnType::Integer, Dialect::Postgresql) => "INTEGER".to_string(),
        (ColumnType::BigInteger, Dialect::Postgresql) => "BIGINT".to_string(),
        (ColumnType::String(length), _) => format!("VARCHAR({length})"),
        (ColumnType::Text, _) => "TEXT".to_string(),
        (ColumnType::Boolean, _) => "BOOLEAN".to_string(),
        (ColumnType::Float, Dialect::Sqlite) => "REAL".to_string(),
        (ColumnType::Float, Dialect::Postgresql) => "DOUBLE PRECISION".to_string(),
        (ColumnType::DateTime, Dialect::Sqlite) => "DATETIME".to_string(),
        (ColumnType::DateTime, Dialect::Postgresql) => "TIMESTAMP WITHOUT TIME ZONE".to_string(),
    }
}

/// Renders the `CREATE TABLE` statement for `table`.
#[must_use]
pub fn render_create_table(table: &TableDef, dialect: Dialect, if_not_exists: bool) -> String {
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut line = format!(
                "\t{} {}",
                quote_identifier(&column.name),
                render_column_type(column, dialect)
            );
            if !column.nullable {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect();

    let primary_key: Vec<String> = table
        .columns
        .iter()
        .filter(|column| column.primary_key)
        .map(|column| quote_identifier(&column.name))
        .collect();
    if !primary_key.is_empty() {
        lines.push(format!("\tPRIMARY KEY ({})", primary_key.join(", ")));
    }

    for constraint in &table.constraints {
        let line = match &constraint.name {
            Some(name) => format!(
                "\tCONSTRAINT {} CHECK ({})",
                quote_identifier(name),
                constraint.expression
            ),
            None => format!("\tCHECK ({})", constraint.expression),
        };
        lines.push(line);
    }

    let mut ddl = String::from("CREATE TABLE ");
    if if_not_exists {
        ddl.push_str("IF NOT EXISTS ");
    }
    let _ = write!(ddl, "{} (\n{}\n)", quoted_table_name(table), lines.join(",\n"));
    ddl
}

/// Wraps a name in double quotes so keywords and mixed case survive as-is.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The table name, schema-qualified when a schema is set, quoted per part.
#[must_use]
pub fn quoted_table_name(table: &TableDef) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&table.name)),
        None => quote_identifier(&table.name),
    }
}

/// Orders the row's columns by table position.
///
/// # Errors
/// Returns [`AuditError::Runtime`] when the row names a column the table
/// does not have.
pub fn insert_columns<'t>(table: &'t TableDef, row: &Row) -> Result<Vec<&'t ColumnDef>, AuditError> {
    let unknown: Vec<&str> = row
        .keys()
        .filter(|name| table.column(name).is_none())
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(AuditError::Runtime(format!(
            "unconsumed column names for table {}: {}",
            table.qualified_name(),
            unknown.join(", ")
        )));
    }

    Ok(table
        .columns
        .iter()
        .filter(|column| row.contains_key(&column.name))
        .collect())
}

/// Renders an `INSERT` with every value embedded as a literal.
///
/// # Errors
/// Returns [`AuditError::Runtime`] for unknown columns and values that
/// have no literal form.
pub fn render_insert(table: &TableDef, row: &Row, dialect: Dialect) -> Result<String, AuditError> {
    let columns = insert_columns(table, row)?;
    if columns.is_empty() {
        return Ok(format!("INSERT INTO {} DEFAULT VALUES", quoted_table_name(table)));
    }
    let names: Vec<String> = columns
        .iter()
        .map(|column| quote_identifier(&column.name))
        .collect();
    let values = columns
        .iter()
        .map(|column| match row.get(&column.name) {
            Some(value) => render_literal(value, dialect),
            None => Ok("NULL".to_string()),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quoted_table_name(table),
        names.join(", "),
        values.join(", ")
    ))
}

/// Renders one value as an SQL literal.
///
/// # Errors
/// Returns [`AuditError::Runtime`] for non-finite reals and timestamps that
/// cannot be formatted.
pub fn render_literal(value: &ColumnValue, dialect: Dialect) -> Result<String, AuditError> {
    Ok(match value {
        ColumnValue::Null => "NULL".to_string(),
        ColumnValue::Bool(flag) => match dialect {
            Dialect::Sqlite => String::from(if *flag { "1" } else { "0" }),
            Dialect::Postgresql => String::from(if *flag { "true" } else { "false" }),
        },
        ColumnValue::Integer(number) => number.to_string(),
        ColumnValue::Real(number) => {
            if !number.is_finite() {
                return Err(AuditError::Runtime(format!(
                    "cannot render non-finite value {number} as a literal"
                )));
            }
            format!("{number:?}")
        }
        ColumnValue::Text(text) | ColumnValue::InlineLiteral(text) => quote(text),
        ColumnValue::Timestamp(at) => quote(&format_rfc3339(*at)?),
    })
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CheckConstraint, SchemaBuilder};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn history_table_ddl_matches_expected_shape() {
        let schema = must_ok(SchemaBuilder::new("alembic_version_history").build());
        let ddl = render_create_table(&schema.table, Dialect::Sqlite, false);
        assert_eq!(
            ddl,
            "CREATE TABLE \"alembic_version_history\" (\n\
             \t\"id\" INTEGER NOT NULL,\n\
             \t\"alembic_version\" VARCHAR(255),\n\
             \t\"prev_alembic_version\" VARCHAR(255),\n\
             \t\"operation_type\" VARCHAR(32) NOT NULL,\n\
             \t\"operation_direction\" VARCHAR(32) NOT NULL,\n\
             \t\"user_version\" VARCHAR(255),\n\
             \t\"changed_at\" DATETIME,\n\
             \tPRIMARY KEY (\"id\"),\n\
             \tCONSTRAINT \"alembic_versions_nonnull\" CHECK (coalesce(\"alembic_version\", \"prev_alembic_version\") IS NOT NULL)\n\
             )"
        );
    }

    #[test]
    fn postgres_ddl_uses_serial_keys_and_timestamps() {
        let schema = must_ok(
            SchemaBuilder::new("history")
                .schema(Some("audit".to_string()))
                .build(),
        );
        let ddl = render_create_table(&schema.table, Dialect::Postgresql, true);
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"audit\".\"history\" ("));
        assert!(ddl.contains("\t\"id\" BIGSERIAL NOT NULL"));
        assert!(ddl.contains("\t\"changed_at\" TIMESTAMP WITHOUT TIME ZONE"));
    }

    #[test]
    fn unnamed_constraints_render_bare_checks() {
        let table = TableDef::new("t")
            .with_column(ColumnDef::new("a", ColumnType::Integer))
            .with_constraint(CheckConstraint {
                name: None,
                expression: "a > 0".to_string(),
            });
        assert_eq!(
            render_create_table(&table, Dialect::Sqlite, false),
            "CREATE TABLE \"t\" (\n\t\"a\" INTEGER,\n\tCHECK (a > 0)\n)"
        );
    }

    #[test]
    fn insert_follows_table_order_and_quotes_text() {
        let schema = must_ok(SchemaBuilder::new("history").build());
        let row = Row::from([
            ("user_version".to_string(), ColumnValue::from("it's v1")),
            ("alembic_version".to_string(), ColumnValue::from("B")),
            ("prev_alembic_version".to_string(), ColumnValue::Null),
        ]);
        let sql = must_ok(render_insert(&schema.table, &row, Dialect::Sqlite));
        assert_eq!(
            sql,
            "INSERT INTO \"history\" (\"alembic_version\", \"prev_alembic_version\", \"user_version\") \
             VALUES ('B', NULL, 'it''s v1')"
        );
    }

    #[test]
    fn keywords_and_embedded_quotes_are_quoted() {
        assert_eq!(quote_identifier("order"), "\"order\"");
        assert_eq!(quote_identifier("odd\"name"), "\"odd\"\"name\"");

        let table = TableDef::new("select")
            .with_column(ColumnDef::new("order", ColumnType::Text).not_null());
        assert_eq!(
            render_create_table(&table, Dialect::Sqlite, false),
            "CREATE TABLE \"select\" (\n\t\"order\" TEXT NOT NULL\n)"
        );
        let row = Row::from([("order".to_string(), ColumnValue::from("first"))]);
        assert_eq!(
            must_ok(render_insert(&table, &row, Dialect::Postgresql)),
            "INSERT INTO \"select\" (\"order\") VALUES ('first')"
        );
    }

    #[test]
    fn empty_row_inserts_default_values() {
        let schema = must_ok(SchemaBuilder::new("history").build());
        assert_eq!(
            must_ok(render_insert(&schema.table, &Row::new(), Dialect::Sqlite)),
            "INSERT INTO \"history\" DEFAULT VALUES"
        );
    }

    #[test]
    fn insert_rejects_columns_missing_from_table() {
        let schema = must_ok(SchemaBuilder::new("history").build());
        let row = Row::from([("nope".to_string(), ColumnValue::Integer(1))]);
        let err = match render_insert(&schema.table, &row, Dialect::Sqlite) {
            Ok(sql) => panic!("expected runtime error, got {sql}"),
            Err(err) => err,
        };
        assert!(matches!(err, AuditError::Runtime(ref message) if message.contains("nope")));
    }

    #[test]
    fn literals_follow_dialect() {
        assert_eq!(must_ok(render_literal(&ColumnValue::Bool(true), Dialect::Sqlite)), "1");
        assert_eq!(
            must_ok(render_literal(&ColumnValue::Bool(false), Dialect::Postgresql)),
            "false"
        );
        assert_eq!(must_ok(render_literal(&ColumnValue::Real(1.5), Dialect::Sqlite)), "1.5");
        assert!(render_literal(&ColumnValue::Real(f64::NAN), Dialect::Sqlite).is_err());
        assert_eq!(
            must_ok(render_literal(
                &ColumnValue::InlineLiteral("2026-02-07T12:00:00Z".to_string()),
                Dialect::Sqlite
            )),
            "'2026-02-07T12:00:00Z'"
        );
    }
}
