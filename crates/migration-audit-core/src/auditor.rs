use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use crate::config::AuditorConfig;
use crate::context::MigrationContext;
use crate::environment::{MigrationEnvironment, StepListener};
use crate::resolve::{resolve_row, resolve_value, ValueSpec};
use crate::schema::{ColumnDef, Metadata, SchemaBuilder, TableDef};
use crate::session::AuditSession;
use crate::step::{StepContext, StepEvent};
use crate::value::{ColumnValue, Row};
use crate::{AuditError, UserVersionWarning};

type WarningHandler = Rc<dyn Fn(&UserVersionWarning)>;

/// Appends one history row per applied migration step.
///
/// The table is created (or its DDL emitted) the first time the auditor
/// hears about a step and never again for the lifetime of the value.
pub struct Auditor {
    table: TableDef,
    make_row: ValueSpec,
    created: Cell<bool>,
}

impl Auditor {
    /// Wraps a caller-maintained table.
    ///
    /// # Errors
    /// Returns [`AuditError::Construct`] when `make_row` is a plain constant
    /// instead of a row mapping or a derivation producing one.
    pub fn new(table: TableDef, make_row: ValueSpec) -> Result<Self, AuditError> {
        if let ValueSpec::Constant(value) = &make_row {
            return Err(AuditError::Construct(format!(
                "invalid make_row argument for table {}: expected a row mapping or a derivation, got {value:?}",
                table.qualified_name()
            )));
        }
        Ok(Self {
            table,
            make_row,
            created: Cell::new(false),
        })
    }

    /// Starts an auditor over an auto-created history table.
    #[must_use]
    pub fn builder(user_version: impl Into<ValueSpec>) -> AuditorBuilder {
        AuditorBuilder::new(user_version.into())
    }

    #[must_use]
    pub fn table(&self) -> &TableDef {
        &self.table
    }

    #[must_use]
    pub fn is_created(&self) -> bool {
        self.created.get()
    }

    /// Computes the row that would be recorded for `ctx` without touching
    /// the database.
    ///
    /// # Errors
    /// Propagates resolution errors, see [`resolve_row`].
    pub fn make_row(&self, ctx: &StepContext<'_>) -> Result<Row, AuditError> {
        resolve_row(&self.make_row, ctx)
    }

    /// Records one applied step.
    ///
    /// # Errors
    /// Propagates failures from table creation, row resolution and the
    /// insert itself.
    pub fn listen(
        &self,
        ctx: &mut dyn MigrationContext,
        event: &StepEvent,
    ) -> Result<(), AuditError> {
        if !self.created.get() {
            if ctx.as_sql() {
                ctx.emit_create_table(&self.table)?;
            } else {
                ctx.create_table(&self.table)?;
            }
            self.created.set(true);
            tracing::debug!(
                table = %self.table.qualified_name(),
                as_sql = ctx.as_sql(),
                "history table ready"
            );
        }

        let row = self.make_row(&StepContext::new(event, &*ctx))?;
        ctx.bulk_insert(&self.table, std::slice::from_ref(&row))?;
        tracing::debug!(
            table = %self.table.qualified_name(),
            up_revision = event.step.up_revision_id().unwrap_or("<none>"),
            "history row recorded"
        );
        Ok(())
    }

    /// Starts listening on `env` until the returned session is dropped.
    ///
    /// # Errors
    /// Returns [`AuditError::Setup`] when another auditor is already active
    /// on `env` or the runner cannot deliver step notifications.
    pub fn setup(self: &Rc<Self>, env: &MigrationEnvironment) -> Result<AuditSession, AuditError> {
        AuditSession::install(self, env)
    }

    /// Runs `run` with this auditor listening on `env`.
    ///
    /// # Errors
    /// Returns setup failures converted into `E`, or whatever `run` returns.
    pub fn scoped<T, E, F>(self: &Rc<Self>, env: &MigrationEnvironment, run: F) -> Result<T, E>
    where
        F: FnOnce(&MigrationEnvironment) -> Result<T, E>,
        E: From<AuditError>,
    {
        let _session = self.setup(env)?;
        run(env)
    }
}

impl StepListener for Auditor {
    fn on_step_applied(
        &self,
        ctx: &mut dyn MigrationContext,
        event: &StepEvent,
    ) -> Result<(), AuditError> {
        self.listen(ctx, event)
    }
}

impl Debug for Auditor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auditor")
            .field("table", &self.table.qualified_name())
            .field("make_row", &self.make_row)
            .field("created", &self.created.get())
            .finish()
    }
}

pub struct AuditorBuilder {
    user_version: ValueSpec,
    config: AuditorConfig,
    extra_columns: Vec<(ColumnDef, ValueSpec)>,
    on_warning: Option<WarningHandler>,
}

impl AuditorBuilder {
    fn new(user_version: ValueSpec) -> Self {
        Self {
            user_version,
            config: AuditorConfig::default(),
            extra_columns: Vec::new(),
            on_warning: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: AuditorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.config.table_name = table_name.into();
        self
    }

    #[must_use]
    pub fn user_version_nullable(mut self, nullable: bool) -> Self {
        self.config.user_version_nullable = nullable;
        self
    }

    #[must_use]
    pub fn extra_column(mut self, column: ColumnDef, value: impl Into<ValueSpec>) -> Self {
        self.extra_columns.push((column, value.into()));
        self
    }

    /// Receives every null user version warning in addition to the log.
    #[must_use]
    pub fn on_warning<F>(mut self, handler: F) -> Self
    where
        F: Fn(&UserVersionWarning) + 'static,
    {
        self.on_warning = Some(Rc::new(handler));
        self
    }

    /// Builds the auditor against a fresh [`Metadata`].
    ///
    /// # Errors
    /// See [`build_in`](Self::build_in).
    pub fn build(self) -> Result<Auditor, AuditError> {
        self.build_in(&mut Metadata::new())
    }

    /// Builds the auditor and registers its table in `metadata`.
    ///
    /// # Errors
    /// Returns [`AuditError::Configuration`] for an invalid config and
    /// [`AuditError::Construct`] when the table cannot be assembled or is
    /// already registered.
    pub fn build_in(self, metadata: &mut Metadata) -> Result<Auditor, AuditError> {
        let Self {
            user_version,
            config,
            extra_columns,
            on_warning,
        } = self;
        config.validate()?;

        let reporter = NullVersionReporter {
            column: config.user_version_column_name.clone(),
            handler: on_warning,
        };
        let warn_now = !config.user_version_nullable
            && matches!(user_version, ValueSpec::Constant(ColumnValue::Null));
        let user_version = match user_version {
            ValueSpec::Derived(_) if !config.user_version_nullable => {
                reporter.clone().watch(user_version)
            }
            other => other,
        };

        let schema = config
            .schema
            .clone()
            .or_else(|| metadata.schema().map(str::to_string));
        let mut builder = SchemaBuilder::new(&config.table_name)
            .schema(schema)
            .columns(config.columns())
            .user_version_type(config.user_version_type)
            .separator(&config.alembic_version_separator)
            .user_version(user_version);
        for (column, value) in extra_columns {
            builder = builder.extra_column(column, value);
        }
        let history = builder.build()?;
        let make_row = history.row_spec();
        let table = metadata.register(history.table)?.clone();

        if warn_now {
            reporter.report();
        }

        Auditor::new(table, make_row)
    }
}

#[derive(Clone)]
struct NullVersionReporter {
    column: String,
    handler: Option<WarningHandler>,
}

impl NullVersionReporter {
    fn report(&self) {
        let warning = UserVersionWarning {
            column: self.column.clone(),
        };
        tracing::warn!(column = %warning.column, "{warning}");
        if let Some(handler) = &self.handler {
            handler(&warning);
        }
    }

    /// Wraps a derivation so every null it produces is reported.
    fn watch(self, spec: ValueSpec) -> ValueSpec {
        ValueSpec::derived(move |ctx| {
            let value = resolve_value(&self.column, &spec, ctx)?;
            if value.is_null() {
                self.report();
            }
            Ok(value)
        })
    }
}
