use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{is_valid_identifier, ColumnType, HistoryColumns};
use crate::AuditError;

pub const DEFAULT_TABLE_NAME: &str = "alembic_version_history";
pub const DEFAULT_SEPARATOR: &str = "##";
pub const DEFAULT_USER_VERSION_LENGTH: u32 = 255;

pub(crate) const DEFAULT_ALEMBIC_VERSION_COLUMN: &str = "alembic_version";
pub(crate) const DEFAULT_PREV_ALEMBIC_VERSION_COLUMN: &str = "prev_alembic_version";
pub(crate) const DEFAULT_OPERATION_COLUMN: &str = "operation_type";
pub(crate) const DEFAULT_DIRECTION_COLUMN: &str = "operation_direction";
pub(crate) const DEFAULT_USER_VERSION_COLUMN: &str = "user_version";
pub(crate) const DEFAULT_CHANGE_TIME_COLUMN: &str = "changed_at";

/// Settings for an auto-created history table.
///
/// Extra columns and the user version itself are code, not configuration,
/// and are supplied through [`AuditorBuilder`](crate::AuditorBuilder).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AuditorConfig {
    pub table_name: String,
    pub schema: Option<String>,
    pub user_version_column_name: String,
    pub user_version_type: ColumnType,
    pub user_version_nullable: bool,
    pub direction_column_name: String,
    pub operation_column_name: String,
    pub alembic_version_column_name: String,
    pub prev_alembic_version_column_name: String,
    pub change_time_column_name: String,
    pub alembic_version_separator: String,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            schema: None,
            user_version_column_name: DEFAULT_USER_VERSION_COLUMN.to_string(),
            user_version_type: ColumnType::String(DEFAULT_USER_VERSION_LENGTH),
            user_version_nullable: false,
            direction_column_name: DEFAULT_DIRECTION_COLUMN.to_string(),
            operation_column_name: DEFAULT_OPERATION_COLUMN.to_string(),
            alembic_version_column_name: DEFAULT_ALEMBIC_VERSION_COLUMN.to_string(),
            prev_alembic_version_column_name: DEFAULT_PREV_ALEMBIC_VERSION_COLUMN.to_string(),
            change_time_column_name: DEFAULT_CHANGE_TIME_COLUMN.to_string(),
            alembic_version_separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}

impl AuditorConfig {
    #[must_use]
    pub fn columns(&self) -> HistoryColumns {
        HistoryColumns {
            alembic_version: self.alembic_version_column_name.clone(),
            prev_alembic_version: self.prev_alembic_version_column_name.clone(),
            operation_type: self.operation_column_name.clone(),
            operation_direction: self.direction_column_name.clone(),
            user_version: self.user_version_column_name.clone(),
            changed_at: self.change_time_column_name.clone(),
        }
    }

    /// Validates names and the version separator.
    ///
    /// # Errors
    /// Returns [`AuditError::Configuration`] when a table, schema or column
    /// name is not a plain identifier, or the separator is empty.
    pub fn validate(&self) -> Result<(), AuditError> {
        let mut names = vec![
            ("table_name", self.table_name.as_str()),
            (
                "user_version_column_name",
                self.user_version_column_name.as_str(),
            ),
            ("direction_column_name", self.direction_column_name.as_str()),
            ("operation_column_name", self.operation_column_name.as_str()),
            (
                "alembic_version_column_name",
                self.alembic_version_column_name.as_str(),
            ),
            (
                "prev_alembic_version_column_name",
                self.prev_alembic_version_column_name.as_str(),
            ),
            (
                "change_time_column_name",
                self.change_time_column_name.as_str(),
            ),
        ];
        if let Some(schema) = &self.schema {
            names.push(("schema", schema.as_str()));
        }

        for (field, value) in names {
            if !is_valid_identifier(value) {
                return Err(AuditError::Configuration(format!(
                    "{field} MUST be a plain SQL identifier, got {value:?}"
                )));
            }
        }

        if self.alembic_version_separator.is_empty() {
            return Err(AuditError::Configuration(
                "alembic_version_separator MUST NOT be empty".to_string(),
            ));
        }

        if let ColumnType::String(0) = self.user_version_type {
            return Err(AuditError::Configuration(
                "user_version_type string length MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`AuditError::Configuration`] when decoding fails or decoded
    /// values are invalid.
    pub fn from_json(value: &Value) -> Result<Self, AuditError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AuditError::Configuration(format!("invalid auditor config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}
