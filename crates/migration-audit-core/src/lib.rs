#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

mod auditor;
pub mod column_values;
mod config;
mod context;
mod environment;
mod resolve;
mod schema;
mod session;
pub mod sql;
mod step;
mod value;

pub use auditor::{Auditor, AuditorBuilder};
pub use config::{
    AuditorConfig, DEFAULT_SEPARATOR, DEFAULT_TABLE_NAME, DEFAULT_USER_VERSION_LENGTH,
};
pub use context::{MigrationContext, SqlScript};
pub use environment::{
    supports_step_listeners, ListenerId, ListenerRegistration, MigrationEnvironment,
    RunnerCapabilities, StepListener,
};
pub use resolve::{resolve_row, resolve_value, DeriveFn, ValueSpec};
pub use schema::{
    is_valid_identifier, CheckConstraint, ColumnDef, ColumnType, HistoryColumns, HistorySchema,
    Metadata, SchemaBuilder, TableDef, ID_COLUMN_NAME, VERSIONS_NONNULL_CONSTRAINT,
};
pub use session::{AuditSession, SessionState};
pub use sql::Dialect;
pub use step::{MigrationStep, StepContext, StepEvent};
pub use value::{ColumnValue, Row};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AuditError {
    #[error("construct error: {0}")]
    Construct(String),
    #[error("setup error: {0}")]
    Setup(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("execution error: {0}")]
    Execution(String),
}

/// Raised when a history row is about to carry a null user version.
///
/// A missing user version is legal but ties the recorded migration to no
/// point in the application's own history, so it is reported rather than
/// silently stored.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserVersionWarning {
    pub column: String,
}

impl Display for UserVersionWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "null user version for column {}", self.column)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Migration,
    Stamp,
}

impl OperationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Stamp => "stamp",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "migration" => Some(Self::Migration),
            "stamp" => Some(Self::Stamp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationDirection {
    Up,
    Down,
}

impl OperationDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

/// One persisted audit record, as read back from a history table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryRow {
    pub id: i64,
    pub alembic_version: Option<String>,
    pub prev_alembic_version: Option<String>,
    pub operation_type: String,
    pub operation_direction: String,
    pub user_version: ColumnValue,
    pub changed_at: Option<OffsetDateTime>,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AuditError::Runtime`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AuditError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AuditError::Runtime(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AuditError::Runtime(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AuditError::Runtime`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AuditError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| AuditError::Runtime(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_enums_round_trip_their_column_text() {
        for kind in [OperationType::Migration, OperationType::Stamp] {
            assert_eq!(OperationType::parse(kind.as_str()), Some(kind));
        }
        for direction in [OperationDirection::Up, OperationDirection::Down] {
            assert_eq!(OperationDirection::parse(direction.as_str()), Some(direction));
        }
        assert_eq!(OperationType::parse("merge"), None);
    }

    #[test]
    fn rfc3339_helpers_reject_non_utc_offsets() {
        let err = match parse_rfc3339_utc("2026-02-07T12:00:00+02:00") {
            Ok(_) => panic!("non-UTC timestamp should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, AuditError::Runtime(_)));

        let parsed = match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("expected UTC timestamp to parse: {err}"),
        };
        let formatted = match format_rfc3339(parsed) {
            Ok(value) => value,
            Err(err) => panic!("expected timestamp to format: {err}"),
        };
        assert_eq!(formatted, "2026-02-07T12:00:00Z");
    }
}
