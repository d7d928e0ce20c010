use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::column_values;
use crate::config::{
    DEFAULT_ALEMBIC_VERSION_COLUMN, DEFAULT_CHANGE_TIME_COLUMN, DEFAULT_DIRECTION_COLUMN,
    DEFAULT_OPERATION_COLUMN, DEFAULT_PREV_ALEMBIC_VERSION_COLUMN, DEFAULT_SEPARATOR,
    DEFAULT_USER_VERSION_COLUMN, DEFAULT_USER_VERSION_LENGTH,
};
use crate::resolve::ValueSpec;
use crate::sql::quote_identifier;
use crate::AuditError;

pub const ID_COLUMN_NAME: &str = "id";
pub const VERSIONS_NONNULL_CONSTRAINT: &str = "alembic_versions_nonnull";

const REVISION_COLUMN_LENGTH: u32 = 255;
const OPERATION_COLUMN_LENGTH: u32 = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    BigInteger,
    String(u32),
    Text,
    Boolean,
    Float,
    DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckConstraint {
    pub name: Option<String>,
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub schema: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<CheckConstraint>,
}

impl TableDef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: CheckConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.name),
            None => self.name.clone(),
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }
}

/// Namespace that history tables are registered in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    schema: Option<String>,
    tables: BTreeMap<String, TableDef>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_schema(schema: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            tables: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Registers a table definition under its qualified name.
    ///
    /// # Errors
    /// Returns [`AuditError::Construct`] when a table with the same
    /// qualified name is already registered.
    pub fn register(&mut self, table: TableDef) -> Result<&TableDef, AuditError> {
        let key = table.qualified_name();
        if self.tables.contains_key(&key) {
            return Err(AuditError::Construct(format!(
                "table {key} is already defined in this metadata"
            )));
        }
        Ok(self.tables.entry(key).or_insert(table))
    }

    #[must_use]
    pub fn table(&self, qualified_name: &str) -> Option<&TableDef> {
        self.tables.get(qualified_name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }
}

/// Names of the six fixed history columns.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryColumns {
    pub alembic_version: String,
    pub prev_alembic_version: String,
    pub operation_type: String,
    pub operation_direction: String,
    pub user_version: String,
    pub changed_at: String,
}

impl Default for HistoryColumns {
    fn default() -> Self {
        Self {
            alembic_version: DEFAULT_ALEMBIC_VERSION_COLUMN.to_string(),
            prev_alembic_version: DEFAULT_PREV_ALEMBIC_VERSION_COLUMN.to_string(),
            operation_type: DEFAULT_OPERATION_COLUMN.to_string(),
            operation_direction: DEFAULT_DIRECTION_COLUMN.to_string(),
            user_version: DEFAULT_USER_VERSION_COLUMN.to_string(),
            changed_at: DEFAULT_CHANGE_TIME_COLUMN.to_string(),
        }
    }
}

impl HistoryColumns {
    fn in_table_order(&self) -> [&str; 6] {
        [
            &self.alembic_version,
            &self.prev_alembic_version,
            &self.operation_type,
            &self.operation_direction,
            &self.user_version,
            &self.changed_at,
        ]
    }
}

/// A history table together with the value spec of every column.
#[derive(Debug, Clone)]
pub struct HistorySchema {
    pub table: TableDef,
    pub values: BTreeMap<String, ValueSpec>,
}

impl HistorySchema {
    #[must_use]
    pub fn row_spec(&self) -> ValueSpec {
        ValueSpec::Row(self.values.clone())
    }
}

pub struct SchemaBuilder {
    table_name: String,
    schema: Option<String>,
    columns: HistoryColumns,
    user_version_type: ColumnType,
    separator: String,
    user_version: ValueSpec,
    extra_columns: Vec<(ColumnDef, ValueSpec)>,
}

impl SchemaBuilder {
    #[must_use]
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            schema: None,
            columns: HistoryColumns::default(),
            user_version_type: ColumnType::String(DEFAULT_USER_VERSION_LENGTH),
            separator: DEFAULT_SEPARATOR.to_string(),
            user_version: ValueSpec::null(),
            extra_columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn schema(mut self, schema: Option<String>) -> Self {
        self.schema = schema;
        self
    }

    #[must_use]
    pub fn columns(mut self, columns: HistoryColumns) -> Self {
        self.columns = columns;
        self
    }

    #[must_use]
    pub fn user_version_type(mut self, column_type: ColumnType) -> Self {
        self.user_version_type = column_type;
        self
    }

    #[must_use]
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    #[must_use]
    pub fn user_version(mut self, spec: ValueSpec) -> Self {
        self.user_version = spec;
        self
    }

    #[must_use]
    pub fn extra_column(mut self, column: ColumnDef, spec: ValueSpec) -> Self {
        self.extra_columns.push((column, spec));
        self
    }

    /// Assembles the history table and its per-column value specs.
    ///
    /// # Errors
    /// Returns [`AuditError::Construct`] when a column name is not a plain
    /// identifier, when two columns share a name, or when a column value is
    /// given as a row mapping instead of a constant or derivation.
    pub fn build(self) -> Result<HistorySchema, AuditError> {
        let Self {
            table_name,
            schema,
            columns,
            user_version_type,
            separator,
            user_version,
            extra_columns,
        } = self;

        ensure_identifier("table", &table_name)?;
        if let Some(schema) = &schema {
            ensure_identifier("schema", schema)?;
        }

        // SQLite matches column names case-insensitively, quoted or not.
        let mut seen = BTreeSet::from([ID_COLUMN_NAME.to_string()]);
        for name in columns.in_table_order() {
            ensure_identifier("column", name)?;
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(duplicate_column(name));
            }
        }

        let revision_type = ColumnType::String(REVISION_COLUMN_LENGTH);
        let operation_type = ColumnType::String(OPERATION_COLUMN_LENGTH);
        let mut table = TableDef {
            name: table_name,
            schema,
            columns: vec![
                ColumnDef::new(ID_COLUMN_NAME, ColumnType::BigInteger).primary_key(),
                ColumnDef::new(&columns.alembic_version, revision_type),
                ColumnDef::new(&columns.prev_alembic_version, revision_type),
                ColumnDef::new(&columns.operation_type, operation_type).not_null(),
                ColumnDef::new(&columns.operation_direction, operation_type).not_null(),
                ColumnDef::new(&columns.user_version, user_version_type),
                ColumnDef::new(&columns.changed_at, ColumnType::DateTime),
            ],
            constraints: vec![CheckConstraint {
                name: Some(VERSIONS_NONNULL_CONSTRAINT.to_string()),
                expression: format!(
                    "coalesce({}, {}) IS NOT NULL",
                    quote_identifier(&columns.alembic_version),
                    quote_identifier(&columns.prev_alembic_version)
                ),
            }],
        };

        ensure_column_spec(&columns.user_version, &user_version)?;

        let after_separator = separator.clone();
        let mut values = BTreeMap::from([
            (
                columns.alembic_version.clone(),
                ValueSpec::derived(move |ctx| {
                    Ok(column_values::new_alembic_version(ctx, &after_separator))
                }),
            ),
            (
                columns.prev_alembic_version.clone(),
                ValueSpec::derived(move |ctx| {
                    Ok(column_values::old_alembic_version(ctx, &separator))
                }),
            ),
            (
                columns.operation_type.clone(),
                ValueSpec::derived(column_values::operation_type),
            ),
            (
                columns.operation_direction.clone(),
                ValueSpec::derived(|ctx| Ok(column_values::operation_direction(ctx))),
            ),
            (columns.user_version.clone(), user_version),
            (
                columns.changed_at.clone(),
                ValueSpec::derived(column_values::change_time),
            ),
        ]);

        for (column, spec) in extra_columns {
            ensure_identifier("column", &column.name)?;
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(duplicate_column(&column.name));
            }
            ensure_column_spec(&column.name, &spec)?;
            values.insert(column.name.clone(), spec);
            table.columns.push(column);
        }

        Ok(HistorySchema { table, values })
    }
}

/// Returns whether `value` can be used unquoted as a table or column name.
#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn ensure_identifier(kind: &str, value: &str) -> Result<(), AuditError> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(AuditError::Construct(format!(
            "invalid {kind} name {value:?}"
        )))
    }
}

fn ensure_column_spec(column: &str, spec: &ValueSpec) -> Result<(), AuditError> {
    if spec.is_row() {
        return Err(AuditError::Construct(format!(
            "value for column {column} must be a constant or a derivation, not a row mapping"
        )));
    }
    Ok(())
}

fn duplicate_column(name: &str) -> AuditError {
    AuditError::Construct(format!("value {name} used twice"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T: std::fmt::Debug>(result: Result<T, AuditError>) -> AuditError {
        match result {
            Ok(value) => panic!("expected an error, got {value:?}"),
            Err(err) => err,
        }
    }

    #[test]
    fn fixed_columns_come_in_declared_order() {
        let schema = must_ok(SchemaBuilder::new("alembic_version_history").build());
        let names: Vec<&str> = schema.table.column_names().collect();
        assert_eq!(
            names,
            vec![
                "id",
                "alembic_version",
                "prev_alembic_version",
                "operation_type",
                "operation_direction",
                "user_version",
                "changed_at",
            ]
        );

        let id = must_ok(schema.table.column("id").ok_or("missing id"));
        assert!(id.primary_key);
        assert!(!must_ok(schema.table.column("operation_type").ok_or("missing")).nullable);
        assert!(!must_ok(schema.table.column("operation_direction").ok_or("missing")).nullable);
        assert!(must_ok(schema.table.column("alembic_version").ok_or("missing")).nullable);
        assert_eq!(schema.values.len(), 6);
    }

    #[test]
    fn versions_constraint_names_both_version_columns() {
        let columns = HistoryColumns {
            alembic_version: "after".to_string(),
            prev_alembic_version: "before".to_string(),
            ..HistoryColumns::default()
        };
        let schema = must_ok(SchemaBuilder::new("history").columns(columns).build());
        assert_eq!(
            schema.table.constraints,
            vec![CheckConstraint {
                name: Some(VERSIONS_NONNULL_CONSTRAINT.to_string()),
                expression: "coalesce(\"after\", \"before\") IS NOT NULL".to_string(),
            }]
        );
    }

    #[test]
    fn extra_column_named_like_a_fixed_field_is_rejected() {
        let err = must_err(
            SchemaBuilder::new("history")
                .extra_column(
                    ColumnDef::new("user_version", ColumnType::Text),
                    ValueSpec::constant("x"),
                )
                .build(),
        );
        assert!(matches!(err, AuditError::Construct(ref message) if message.contains("user_version")));
    }

    #[test]
    fn names_differing_only_in_case_collide() {
        let err = must_err(
            SchemaBuilder::new("history")
                .extra_column(
                    ColumnDef::new("USER_VERSION", ColumnType::Text),
                    ValueSpec::constant("x"),
                )
                .build(),
        );
        assert!(matches!(err, AuditError::Construct(ref message) if message.contains("USER_VERSION")));

        let columns = HistoryColumns {
            changed_at: "Alembic_Version".to_string(),
            ..HistoryColumns::default()
        };
        assert!(matches!(
            SchemaBuilder::new("history").columns(columns).build(),
            Err(AuditError::Construct(_))
        ));
        assert!(matches!(
            SchemaBuilder::new("history")
                .extra_column(ColumnDef::new("ID", ColumnType::Integer), ValueSpec::null())
                .build(),
            Err(AuditError::Construct(_))
        ));
    }

    #[test]
    fn keyword_column_names_are_accepted() {
        let schema = must_ok(
            SchemaBuilder::new("order")
                .extra_column(ColumnDef::new("select", ColumnType::Text), ValueSpec::null())
                .build(),
        );
        assert!(schema.table.column("select").is_some());
    }

    #[test]
    fn renamed_fixed_column_collides_with_extra() {
        let columns = HistoryColumns {
            alembic_version: "foo".to_string(),
            ..HistoryColumns::default()
        };
        let err = must_err(
            SchemaBuilder::new("history")
                .columns(columns)
                .extra_column(ColumnDef::new("foo", ColumnType::Text), ValueSpec::constant("bar"))
                .build(),
        );
        assert!(matches!(err, AuditError::Construct(_)));
    }

    #[test]
    fn extras_collide_with_each_other_and_with_id() {
        let twice = SchemaBuilder::new("history")
            .extra_column(ColumnDef::new("custom", ColumnType::Text), ValueSpec::null())
            .extra_column(ColumnDef::new("custom", ColumnType::Integer), ValueSpec::null())
            .build();
        assert!(matches!(twice, Err(AuditError::Construct(_))));

        let id = SchemaBuilder::new("history")
            .extra_column(ColumnDef::new("id", ColumnType::Integer), ValueSpec::null())
            .build();
        assert!(matches!(id, Err(AuditError::Construct(_))));
    }

    #[test]
    fn extras_are_appended_after_fixed_columns() {
        let schema = must_ok(
            SchemaBuilder::new("history")
                .extra_column(
                    ColumnDef::new("custom_data", ColumnType::String(32)),
                    ValueSpec::constant("x"),
                )
                .build(),
        );
        assert_eq!(schema.table.columns.last().map(|c| c.name.as_str()), Some("custom_data"));
        assert!(schema.values.contains_key("custom_data"));
    }

    #[test]
    fn row_shaped_column_value_is_rejected() {
        let err = must_err(
            SchemaBuilder::new("history")
                .user_version(ValueSpec::row([("x", ValueSpec::null())]))
                .build(),
        );
        assert!(matches!(err, AuditError::Construct(_)));
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        assert!(is_valid_identifier("_history_2"));
        assert!(!is_valid_identifier("2history"));
        assert!(!is_valid_identifier("drop table;"));
        assert!(!is_valid_identifier(""));

        let err = must_err(SchemaBuilder::new("bad name").build());
        assert!(matches!(err, AuditError::Construct(_)));
    }

    #[test]
    fn metadata_rejects_duplicate_tables() {
        let mut metadata = Metadata::with_schema("audit");
        let mut table = TableDef::new("history");
        table.schema = metadata.schema().map(str::to_string);

        let registered = must_ok(metadata.register(table.clone()));
        assert_eq!(registered.qualified_name(), "audit.history");
        assert!(matches!(
            metadata.register(table),
            Err(AuditError::Construct(_))
        ));
        assert_eq!(metadata.tables().count(), 1);
        assert!(metadata.table("audit.history").is_some());
    }
}
