use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::context::MigrationContext;
use crate::step::StepEvent;
use crate::AuditError;

/// Callback invoked by the runner after every applied step.
pub trait StepListener {
    #[allow(clippy::missing_errors_doc)]
    fn on_step_applied(
        &self,
        ctx: &mut dyn MigrationContext,
        event: &StepEvent,
    ) -> Result<(), AuditError>;
}

impl<F> StepListener for F
where
    F: Fn(&mut dyn MigrationContext, &StepEvent) -> Result<(), AuditError>,
{
    fn on_step_applied(
        &self,
        ctx: &mut dyn MigrationContext,
        event: &StepEvent,
    ) -> Result<(), AuditError> {
        self(ctx, event)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ListenerId(pub Ulid);

impl ListenerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the runner declares it can do.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunnerCapabilities {
    pub runner_version: String,
    pub step_listeners: bool,
}

impl RunnerCapabilities {
    #[must_use]
    pub fn new(runner_version: impl Into<String>, step_listeners: bool) -> Self {
        Self {
            runner_version: runner_version.into(),
            step_listeners,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum ListenerRole {
    Observer,
    Auditor,
}

struct Registered {
    id: ListenerId,
    role: ListenerRole,
    listener: Rc<dyn StepListener>,
}

#[derive(Default)]
struct ListenerSlot {
    configured: Vec<(ListenerId, Rc<dyn StepListener>)>,
    registered: Vec<Registered>,
}

/// Handle to a migration runner's step-listener slot.
///
/// Listeners passed to [`configure`](Self::configure) run first, followed by
/// registered listeners in registration order.
pub struct MigrationEnvironment {
    capabilities: RunnerCapabilities,
    slot: Rc<RefCell<ListenerSlot>>,
}

impl MigrationEnvironment {
    #[must_use]
    pub fn new(capabilities: RunnerCapabilities) -> Self {
        Self {
            capabilities,
            slot: Rc::new(RefCell::new(ListenerSlot::default())),
        }
    }

    #[must_use]
    pub fn capabilities(&self) -> &RunnerCapabilities {
        &self.capabilities
    }

    /// Replaces the caller-supplied `on_version_apply` listeners.
    pub fn configure<I>(&self, on_version_apply: I)
    where
        I: IntoIterator<Item = Rc<dyn StepListener>>,
    {
        self.slot.borrow_mut().configured = on_version_apply
            .into_iter()
            .map(|listener| (ListenerId::new(), listener))
            .collect();
    }

    /// Appends `listener` until the returned guard is dropped.
    ///
    /// # Errors
    /// Returns [`AuditError::Setup`] when the runner does not support step
    /// listeners.
    pub fn register_listener(
        &self,
        listener: Rc<dyn StepListener>,
    ) -> Result<ListenerRegistration, AuditError> {
        self.ensure_step_listeners()?;
        Ok(self.push(ListenerRole::Observer, listener))
    }

    pub(crate) fn has_auditor(&self) -> bool {
        self.slot
            .borrow()
            .registered
            .iter()
            .any(|entry| entry.role == ListenerRole::Auditor)
    }

    pub(crate) fn register_auditor(
        &self,
        listener: Rc<dyn StepListener>,
    ) -> Result<ListenerRegistration, AuditError> {
        if self.has_auditor() {
            return Err(AuditError::Setup(
                "an auditor is already listening on this migration environment".to_string(),
            ));
        }
        self.ensure_step_listeners()?;
        Ok(self.push(ListenerRole::Auditor, listener))
    }

    fn ensure_step_listeners(&self) -> Result<(), AuditError> {
        if self.capabilities.step_listeners {
            Ok(())
        } else {
            Err(AuditError::Setup(format!(
                "migration runner version {} does not support step listeners",
                self.capabilities.runner_version
            )))
        }
    }

    fn push(&self, role: ListenerRole, listener: Rc<dyn StepListener>) -> ListenerRegistration {
        let id = ListenerId::new();
        self.slot
            .borrow_mut()
            .registered
            .push(Registered { id, role, listener });
        ListenerRegistration {
            id,
            slot: Rc::downgrade(&self.slot),
        }
    }

    /// Ids of every active listener, in notification order.
    #[must_use]
    pub fn listener_ids(&self) -> Vec<ListenerId> {
        let slot = self.slot.borrow();
        slot.configured
            .iter()
            .map(|(id, _)| *id)
            .chain(slot.registered.iter().map(|entry| entry.id))
            .collect()
    }

    /// Runner side: notifies every listener that `event` was applied.
    ///
    /// # Errors
    /// Returns the first listener error; later listeners are not called.
    pub fn notify_step_applied(
        &self,
        ctx: &mut dyn MigrationContext,
        event: &StepEvent,
    ) -> Result<(), AuditError> {
        let listeners: Vec<Rc<dyn StepListener>> = {
            let slot = self.slot.borrow();
            slot.configured
                .iter()
                .map(|(_, listener)| Rc::clone(listener))
                .chain(slot.registered.iter().map(|entry| Rc::clone(&entry.listener)))
                .collect()
        };

        for listener in listeners {
            listener.on_step_applied(ctx, event)?;
        }
        Ok(())
    }
}

/// Whether `env` can deliver step notifications at all.
#[must_use]
pub fn supports_step_listeners(env: &MigrationEnvironment) -> bool {
    env.capabilities().step_listeners
}

/// Guard that removes its listener from the slot when dropped.
#[must_use = "dropping the registration removes the listener immediately"]
pub struct ListenerRegistration {
    id: ListenerId,
    slot: Weak<RefCell<ListenerSlot>>,
}

impl ListenerRegistration {
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.borrow_mut()
                .registered
                .retain(|entry| entry.id != self.id);
        }
    }
}
