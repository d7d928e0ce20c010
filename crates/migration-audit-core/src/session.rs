use std::rc::Rc;

use crate::auditor::Auditor;
use crate::environment::{ListenerRegistration, MigrationEnvironment, StepListener};
use crate::AuditError;

/// Lifecycle of an [`AuditSession`].
///
/// A live session always reports `Installed` through
/// [`AuditSession::state`]. `Installing` and `Restoring` only exist while a
/// session is being set up or dropped; they are visible in the `debug` trace
/// emitted on every transition.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Installing,
    Installed,
    Restoring,
}

impl SessionState {
    /// The state that follows `self` when nothing fails.
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Idle => Self::Installing,
            Self::Installing => Self::Installed,
            Self::Installed => Self::Restoring,
            Self::Restoring => Self::Idle,
        }
    }
}

/// Scope during which an auditor receives step notifications.
///
/// Only one session may be active per environment. Dropping the session
/// removes exactly the listener it installed, whether the scope ended
/// normally, through `?` or by unwinding.
#[must_use = "the auditor stops listening as soon as the session is dropped"]
pub struct AuditSession {
    table: String,
    state: SessionState,
    registration: Option<ListenerRegistration>,
}

impl AuditSession {
    pub(crate) fn install(
        auditor: &Rc<Auditor>,
        env: &MigrationEnvironment,
    ) -> Result<Self, AuditError> {
        let mut session = Self {
            table: auditor.table().qualified_name(),
            state: SessionState::Idle,
            registration: None,
        };

        session.enter(SessionState::Installing);
        let listener: Rc<dyn StepListener> = Rc::clone(auditor) as Rc<dyn StepListener>;
        let registration = match env.register_auditor(listener) {
            Ok(registration) => registration,
            Err(err) => {
                tracing::debug!(table = %session.table, error = %err, "audit listener not installed");
                session.enter(SessionState::Idle);
                return Err(err);
            }
        };

        session.registration = Some(registration);
        session.enter(SessionState::Installed);
        tracing::debug!(
            table = %session.table,
            runner_version = %env.capabilities().runner_version,
            "audit listener installed"
        );
        Ok(session)
    }

    fn enter(&mut self, next: SessionState) {
        tracing::debug!(table = %self.table, from = ?self.state, to = ?next, "audit session state");
        self.state = next;
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Ends the session now instead of at scope exit.
    pub fn close(self) {}
}

impl Drop for AuditSession {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            self.enter(SessionState::Restoring);
            drop(registration);
            tracing::debug!(table = %self.table, "audit listener removed");
        }
        self.enter(SessionState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::environment::RunnerCapabilities;
    use crate::resolve::ValueSpec;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_auditor() -> Rc<Auditor> {
        Rc::new(must_ok(Auditor::builder(ValueSpec::constant("v1")).build()))
    }

    fn fixture_env() -> MigrationEnvironment {
        MigrationEnvironment::new(RunnerCapabilities::new("1.13.0", true))
    }

    #[test]
    fn session_installs_and_restores_listener_slot() {
        let env = fixture_env();
        let before = env.listener_ids();

        let session = must_ok(fixture_auditor().setup(&env));
        assert_eq!(session.state(), SessionState::Installed);
        assert_eq!(env.listener_ids().len(), before.len() + 1);

        session.close();
        assert_eq!(env.listener_ids(), before);
    }

    #[test]
    fn nested_session_is_rejected_and_outer_stays_installed() {
        let env = fixture_env();
        let outer = must_ok(fixture_auditor().setup(&env));
        let installed = env.listener_ids();

        let err = match fixture_auditor().setup(&env) {
            Ok(_) => panic!("nested setup should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, AuditError::Setup(_)));
        assert_eq!(env.listener_ids(), installed);
        assert_eq!(outer.state(), SessionState::Installed);

        drop(outer);
        assert!(env.listener_ids().is_empty());
        let again = must_ok(fixture_auditor().setup(&env));
        assert_eq!(again.state(), SessionState::Installed);
    }

    #[test]
    fn lifecycle_cycles_back_to_idle() {
        let mut state = SessionState::Idle;
        let mut visited = Vec::new();
        for _ in 0..4 {
            state = state.next();
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                SessionState::Installing,
                SessionState::Installed,
                SessionState::Restoring,
                SessionState::Idle,
            ]
        );
    }

    #[test]
    fn unsupported_runner_is_a_setup_error() {
        let env = MigrationEnvironment::new(RunnerCapabilities::new("0.8.0", false));
        let err = match fixture_auditor().setup(&env) {
            Ok(_) => panic!("setup should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, AuditError::Setup(ref message) if message.contains("0.8.0")));
    }

    #[test]
    fn scoped_restores_on_error_and_on_panic() {
        let env = fixture_env();
        let before = env.listener_ids();
        let auditor = fixture_auditor();

        let result: Result<(), AuditError> = auditor.scoped(&env, |inner| {
            assert_eq!(inner.listener_ids().len(), 1);
            Err(AuditError::Runtime("step failed".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(env.listener_ids(), before);

        let seen = RefCell::new(0_usize);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = auditor.scoped(&env, |inner| -> Result<(), AuditError> {
                *seen.borrow_mut() = inner.listener_ids().len();
                panic!("runner crashed");
            });
        }));
        assert!(outcome.is_err());
        assert_eq!(*seen.borrow(), 1);
        assert_eq!(env.listener_ids(), before);
    }
}
