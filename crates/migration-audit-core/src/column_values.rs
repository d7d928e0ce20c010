//! Derivations used for the fixed history columns.
//!
//! Each function has the shape of a [`ValueSpec`](crate::ValueSpec)
//! derivation so callers maintaining their own history table can reuse them
//! in a row spec.

use crate::step::StepContext;
use crate::value::ColumnValue;
use crate::{format_rfc3339, now_utc, AuditError, OperationDirection, OperationType};

/// Current UTC time; an inline literal when the context only emits SQL text.
///
/// # Errors
/// Returns [`AuditError::Runtime`] when the timestamp cannot be formatted.
pub fn change_time(ctx: &StepContext<'_>) -> Result<ColumnValue, AuditError> {
    if ctx.as_sql() {
        change_time_literal(ctx)
    } else {
        Ok(ColumnValue::Timestamp(now_utc()))
    }
}

/// Current UTC time, always rendered as an inline literal.
///
/// # Errors
/// Returns [`AuditError::Runtime`] when the timestamp cannot be formatted.
pub fn change_time_literal(_ctx: &StepContext<'_>) -> Result<ColumnValue, AuditError> {
    Ok(ColumnValue::InlineLiteral(format_rfc3339(now_utc())?))
}

/// Classifies the step as a stamp or an executed migration.
///
/// # Errors
/// Returns [`AuditError::Runtime`] when the step is flagged as neither.
pub fn operation_kind(ctx: &StepContext<'_>) -> Result<OperationType, AuditError> {
    let step = ctx.step();
    if step.is_stamp {
        Ok(OperationType::Stamp)
    } else if step.is_migration {
        Ok(OperationType::Migration)
    } else {
        Err(AuditError::Runtime(format!(
            "Unknown migration type {}",
            step.up_revision_id().unwrap_or("<none>")
        )))
    }
}

/// # Errors
/// Returns [`AuditError::Runtime`] when the step is neither a stamp nor a
/// migration.
pub fn operation_type(ctx: &StepContext<'_>) -> Result<ColumnValue, AuditError> {
    operation_kind(ctx).map(|kind| kind.as_str().into())
}

#[must_use]
pub fn operation_direction(ctx: &StepContext<'_>) -> ColumnValue {
    let direction = if ctx.step().is_upgrade {
        OperationDirection::Up
    } else {
        OperationDirection::Down
    };
    direction.as_str().into()
}

/// Revisions after the step, joined by `separator`. No revisions give `""`.
#[must_use]
pub fn new_alembic_version(ctx: &StepContext<'_>, separator: &str) -> ColumnValue {
    ctx.step().destination_revision_ids().join(separator).into()
}

/// Revisions before the step, joined by `separator`. No revisions give `""`.
#[must_use]
pub fn old_alembic_version(ctx: &StepContext<'_>, separator: &str) -> ColumnValue {
    ctx.step().source_revision_ids().join(separator).into()
}
