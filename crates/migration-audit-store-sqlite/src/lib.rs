#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use migration_audit_core::sql::{
    insert_columns, quote_identifier, quoted_table_name, render_create_table,
};
use migration_audit_core::{
    format_rfc3339, AuditError, ColumnValue, Dialect, HistoryColumns, HistoryRow,
    MigrationContext, Row, TableDef, ID_COLUMN_NAME,
};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Layouts SQLite itself writes for `CURRENT_TIMESTAMP` and `datetime()`.
const SQLITE_DATETIME_FORMATS: [&str; 2] = [
    "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]",
    "[year]-[month]-[day] [hour]:[minute]:[second]",
];

/// SQLite database that history tables live in.
///
/// The store doubles as the physical [`MigrationContext`] handed to
/// auditors: DDL runs with `IF NOT EXISTS` and rows are inserted with bound
/// parameters.
#[derive(Debug)]
pub struct SqliteAuditStore {
    conn: Connection,
}

impl SqliteAuditStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        tracing::debug!(path = %path.display(), "opened audit store");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1
                 FROM sqlite_master
                 WHERE type = 'table' AND name = ?1
                 LIMIT 1",
                params![table_name],
                |_| Ok(()),
            )
            .optional()
            .context("failed to query sqlite_master")?
            .is_some();

        Ok(exists)
    }

    /// Runs a script produced in text-emission mode.
    pub fn apply_script(&self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .context("failed to apply emitted migration script")
    }

    /// Reads every recorded step from `table_name`, oldest first.
    ///
    /// `table_name` is a single unqualified name; it is quoted as a whole.
    /// `changed_at` values may be RFC3339 with any offset or SQLite's own
    /// `YYYY-MM-DD HH:MM:SS[.SSS]` layout, read as UTC.
    pub fn read_history(
        &self,
        table_name: &str,
        columns: &HistoryColumns,
    ) -> Result<Vec<HistoryRow>> {
        let id = quote_identifier(ID_COLUMN_NAME);
        let sql = format!(
            "SELECT {id}, {}, {}, {}, {}, {}, {}
             FROM {}
             ORDER BY {id} ASC",
            quote_identifier(&columns.alembic_version),
            quote_identifier(&columns.prev_alembic_version),
            quote_identifier(&columns.operation_type),
            quote_identifier(&columns.operation_direction),
            quote_identifier(&columns.user_version),
            quote_identifier(&columns.changed_at),
            quote_identifier(table_name),
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare history query for {table_name}"))?;
        let mut rows = stmt
            .query([])
            .with_context(|| format!("failed to query history from {table_name}"))?;

        let mut history = Vec::new();
        while let Some(row) = rows.next()? {
            history.push(parse_history_row(row)?);
        }
        Ok(history)
    }
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> Result<HistoryRow> {
    let id: i64 = row.get(0)?;
    let changed_at_raw: Option<String> = row.get(6)?;
    let changed_at = changed_at_raw
        .as_deref()
        .map(parse_changed_at)
        .transpose()
        .with_context(|| format!("invalid changed_at in history row {id}"))?;

    Ok(HistoryRow {
        id,
        alembic_version: row.get(1)?,
        prev_alembic_version: row.get(2)?,
        operation_type: row.get(3)?,
        operation_direction: row.get(4)?,
        user_version: column_value_from_sql(row.get(5)?)
            .with_context(|| format!("invalid user_version in history row {id}"))?,
        changed_at,
    })
}

fn parse_changed_at(raw: &str) -> Result<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }

    for layout in SQLITE_DATETIME_FORMATS {
        let items = time::format_description::parse(layout)
            .with_context(|| format!("invalid datetime layout {layout}"))?;
        if let Ok(parsed) = PrimitiveDateTime::parse(raw, &items[..]) {
            return Ok(parsed.assume_utc());
        }
    }

    Err(anyhow!(
        "unrecognized timestamp {raw:?}: expected RFC3339 or YYYY-MM-DD HH:MM:SS"
    ))
}

fn column_value_from_sql(value: Value) -> Result<ColumnValue> {
    match value {
        Value::Null => Ok(ColumnValue::Null),
        Value::Integer(number) => Ok(ColumnValue::Integer(number)),
        Value::Real(number) => Ok(ColumnValue::Real(number)),
        Value::Text(text) => Ok(ColumnValue::Text(text)),
        Value::Blob(bytes) => Err(anyhow!(
            "blob values are not supported ({} bytes)",
            bytes.len()
        )),
    }
}

fn column_value_to_sql(value: &ColumnValue) -> Result<Value, AuditError> {
    Ok(match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Bool(flag) => Value::Integer(i64::from(*flag)),
        ColumnValue::Integer(number) => Value::Integer(*number),
        ColumnValue::Real(number) => Value::Real(*number),
        ColumnValue::Text(text) | ColumnValue::InlineLiteral(text) => Value::Text(text.clone()),
        ColumnValue::Timestamp(at) => Value::Text(format_rfc3339(*at)?),
    })
}

fn execution_error(action: &str, table: &TableDef, err: &rusqlite::Error) -> AuditError {
    AuditError::Execution(format!(
        "failed to {action} {}: {err}",
        table.qualified_name()
    ))
}

impl MigrationContext for SqliteAuditStore {
    fn as_sql(&self) -> bool {
        false
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn create_table(&mut self, table: &TableDef) -> Result<(), AuditError> {
        self.conn
            .execute_batch(&render_create_table(table, Dialect::Sqlite, true))
            .map_err(|err| execution_error("create", table, &err))?;
        tracing::debug!(table = %table.qualified_name(), "ensured history table");
        Ok(())
    }

    fn emit_create_table(&mut self, table: &TableDef) -> Result<(), AuditError> {
        Err(AuditError::Execution(format!(
            "cannot emit DDL for {} on a live sqlite connection",
            table.qualified_name()
        )))
    }

    fn bulk_insert(&mut self, table: &TableDef, rows: &[Row]) -> Result<(), AuditError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| execution_error("start insert transaction on", table, &err))?;

        let target = quoted_table_name(table);
        for row in rows {
            let columns = insert_columns(table, row)?;
            if columns.is_empty() {
                tx.execute(&format!("INSERT INTO {target} DEFAULT VALUES"), [])
                    .map_err(|err| execution_error("insert into", table, &err))?;
                continue;
            }

            let names: Vec<String> = columns
                .iter()
                .map(|column| quote_identifier(&column.name))
                .collect();
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|index| format!("?{index}")).collect();
            let values = columns
                .iter()
                .map(|column| match row.get(&column.name) {
                    Some(value) => column_value_to_sql(value),
                    None => Ok(Value::Null),
                })
                .collect::<Result<Vec<_>, _>>()?;

            tx.execute(
                &format!(
                    "INSERT INTO {target} ({}) VALUES ({})",
                    names.join(", "),
                    placeholders.join(", ")
                ),
                rusqlite::params_from_iter(values),
            )
            .map_err(|err| execution_error("insert into", table, &err))?;
        }

        tx.commit()
            .map_err(|err| execution_error("commit insert into", table, &err))
    }
}
