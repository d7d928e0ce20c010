use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use crate::step::StepContext;
use crate::value::{ColumnValue, Row};
use crate::AuditError;

pub type DeriveFn = Rc<dyn Fn(&StepContext<'_>) -> Result<ValueSpec, AuditError>>;

/// Declarative description of how a history row, or one of its columns, is
/// computed for a step.
#[derive(Clone)]
pub enum ValueSpec {
    Constant(ColumnValue),
    Derived(DeriveFn),
    Row(BTreeMap<String, ValueSpec>),
}

impl ValueSpec {
    #[must_use]
    pub fn constant(value: impl Into<ColumnValue>) -> Self {
        Self::Constant(value.into())
    }

    #[must_use]
    pub fn null() -> Self {
        Self::Constant(ColumnValue::Null)
    }

    /// Wraps a per-column derivation.
    pub fn derived<F>(derive: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> Result<ColumnValue, AuditError> + 'static,
    {
        Self::Derived(Rc::new(move |ctx| derive(ctx).map(Self::Constant)))
    }

    /// Wraps a derivation producing another spec, typically a whole row.
    pub fn derived_spec<F>(derive: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> Result<ValueSpec, AuditError> + 'static,
    {
        Self::Derived(Rc::new(derive))
    }

    pub fn row<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, ValueSpec)>,
        K: Into<String>,
    {
        Self::Row(
            entries
                .into_iter()
                .map(|(column, spec)| (column.into(), spec))
                .collect(),
        )
    }

    #[must_use]
    pub fn is_derived(&self) -> bool {
        matches!(self, Self::Derived(_))
    }

    #[must_use]
    pub fn is_row(&self) -> bool {
        matches!(self, Self::Row(_))
    }
}

impl Debug for ValueSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
            Self::Row(entries) => f.debug_tuple("Row").field(entries).finish(),
        }
    }
}

impl From<ColumnValue> for ValueSpec {
    fn from(value: ColumnValue) -> Self {
        Self::Constant(value)
    }
}

impl From<&str> for ValueSpec {
    fn from(value: &str) -> Self {
        Self::constant(value)
    }
}

impl From<String> for ValueSpec {
    fn from(value: String) -> Self {
        Self::constant(value)
    }
}

/// Resolves a row-level spec into concrete column values.
///
/// A derived spec is invoked first and must yield a row mapping; every entry
/// of that mapping is then resolved with the same context.
///
/// # Errors
/// Returns [`AuditError::Runtime`] when the value spec does not produce a row
/// mapping or an entry resolves to something other than a scalar, and
/// propagates any error raised by a derivation.
pub fn resolve_row(spec: &ValueSpec, ctx: &StepContext<'_>) -> Result<Row, AuditError> {
    let produced;
    let entries = match spec {
        ValueSpec::Row(entries) => entries,
        ValueSpec::Derived(derive) => {
            produced = derive(ctx)?;
            match &produced {
                ValueSpec::Row(entries) => entries,
                other => return Err(not_a_row(other)),
            }
        }
        ValueSpec::Constant(_) => return Err(not_a_row(spec)),
    };

    entries
        .iter()
        .map(|(column, entry)| Ok((column.clone(), resolve_value(column, entry, ctx)?)))
        .collect()
}

/// Resolves one column's spec, following chained derivations.
///
/// # Errors
/// Returns [`AuditError::Runtime`] when the value spec resolves to a row mapping
/// and propagates any error raised by a derivation.
pub fn resolve_value(
    column: &str,
    spec: &ValueSpec,
    ctx: &StepContext<'_>,
) -> Result<ColumnValue, AuditError> {
    match spec {
        ValueSpec::Constant(value) => Ok(value.clone()),
        ValueSpec::Derived(derive) => resolve_value(column, &derive(ctx)?, ctx),
        ValueSpec::Row(_) => Err(AuditError::Runtime(format!(
            "value for column {column} should be a scalar, instead got {spec:?}"
        ))),
    }
}

fn not_a_row(spec: &ValueSpec) -> AuditError {
    AuditError::Runtime(format!(
        "make_row should produce a row mapping, instead got {spec:?}"
    ))
}
