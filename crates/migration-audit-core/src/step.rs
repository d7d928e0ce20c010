use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::MigrationContext;

/// Descriptor of one applied migration step, as reported by the runner.
///
/// `up_revision_ids` are the revisions on the newer side of the step and
/// `down_revision_ids` those on the older side, regardless of direction.
/// Several ids on one side describe a merge point.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationStep {
    pub up_revision_ids: Vec<String>,
    pub down_revision_ids: Vec<String>,
    pub is_upgrade: bool,
    pub is_migration: bool,
    pub is_stamp: bool,
}

impl MigrationStep {
    #[must_use]
    pub fn upgrade(source: &[&str], destination: &[&str]) -> Self {
        Self {
            up_revision_ids: to_ids(destination),
            down_revision_ids: to_ids(source),
            is_upgrade: true,
            is_migration: true,
            is_stamp: false,
        }
    }

    #[must_use]
    pub fn downgrade(source: &[&str], destination: &[&str]) -> Self {
        Self {
            up_revision_ids: to_ids(source),
            down_revision_ids: to_ids(destination),
            is_upgrade: false,
            is_migration: true,
            is_stamp: false,
        }
    }

    #[must_use]
    pub fn stamp(source: &[&str], destination: &[&str], is_upgrade: bool) -> Self {
        let mut step = if is_upgrade {
            Self::upgrade(source, destination)
        } else {
            Self::downgrade(source, destination)
        };
        step.is_migration = false;
        step.is_stamp = true;
        step
    }

    /// Revisions the database was at before the step applied.
    #[must_use]
    pub fn source_revision_ids(&self) -> &[String] {
        if self.is_upgrade {
            &self.down_revision_ids
        } else {
            &self.up_revision_ids
        }
    }

    /// Revisions the database is at after the step applied.
    #[must_use]
    pub fn destination_revision_ids(&self) -> &[String] {
        if self.is_upgrade {
            &self.up_revision_ids
        } else {
            &self.down_revision_ids
        }
    }

    #[must_use]
    pub fn up_revision_id(&self) -> Option<&str> {
        self.up_revision_ids.first().map(String::as_str)
    }
}

fn to_ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| (*id).to_string()).collect()
}

/// Notification payload handed to step listeners once per applied step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepEvent {
    pub step: MigrationStep,
    pub heads: Vec<String>,
    pub run_args: Value,
}

impl StepEvent {
    #[must_use]
    pub fn new(step: MigrationStep) -> Self {
        let heads = step.destination_revision_ids().to_vec();
        Self {
            step,
            heads,
            run_args: Value::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn with_heads(mut self, heads: Vec<String>) -> Self {
        self.heads = heads;
        self
    }

    #[must_use]
    pub fn with_run_args(mut self, run_args: Value) -> Self {
        self.run_args = run_args;
        self
    }
}

/// Everything a value derivation may look at while a row is built.
pub struct StepContext<'a> {
    pub event: &'a StepEvent,
    pub context: &'a dyn MigrationContext,
}

impl<'a> StepContext<'a> {
    #[must_use]
    pub fn new(event: &'a StepEvent, context: &'a dyn MigrationContext) -> Self {
        Self { event, context }
    }

    #[must_use]
    pub fn step(&self) -> &'a MigrationStep {
        &self.event.step
    }

    #[must_use]
    pub fn heads(&self) -> &'a [String] {
        &self.event.heads
    }

    #[must_use]
    pub fn run_args(&self) -> &'a Value {
        &self.event.run_args
    }

    #[must_use]
    pub fn as_sql(&self) -> bool {
        self.context.as_sql()
    }
}
