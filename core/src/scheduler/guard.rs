use tokio_util::sync::CancellationToken;

use crate::error::GuardError;
use crate::testing::CaseState;

/// How an operation wants to hold a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// A long operation that can be cancelled (run, stress, ...).
    Cancellable,
    /// A short edit that must not overlap a cancellable operation.
    Update,
    /// A short edit allowed while a cancellable operation is in progress.
    CompatibleUpdate,
}

/// Cancel token XOR busy flag; both at once is unrepresentable.
#[derive(Debug, Clone, Default)]
enum Phase {
    #[default]
    Idle,
    Busy,
    Running(CancellationToken),
}

#[derive(Debug)]
pub struct Grant {
    pub token: Option<CancellationToken>,
    /// Whether this grant took the guard out of idle, and so must put it back.
    pub owns: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Guard {
    phase: Phase,
}

impl Guard {
    /// `parent` links the new cancel token to an enclosing batch.
    pub fn acquire(
        &mut self,
        access: Access,
        parent: Option<&CancellationToken>,
        what: &str,
    ) -> Result<Grant, GuardError> {
        match (&self.phase, access) {
            (Phase::Idle, Access::Cancellable) => {
                let token = parent.map_or_else(CancellationToken::new, |p| p.child_token());
                self.phase = Phase::Running(token.clone());
                Ok(Grant {
                    token: Some(token),
                    owns: true,
                })
            }
            (Phase::Idle, Access::Update | Access::CompatibleUpdate) => {
                self.phase = Phase::Busy;
                Ok(Grant {
                    token: None,
                    owns: true,
                })
            }
            (Phase::Running(_), Access::CompatibleUpdate) => Ok(Grant {
                token: None,
                owns: false,
            }),
            _ => Err(GuardError::Busy {
                what: what.to_owned(),
            }),
        }
    }

    pub fn release(&mut self) {
        self.phase = Phase::Idle;
    }

    /// Returns false when there was nothing to cancel.
    pub fn cancel(&self) -> bool {
        match &self.phase {
            Phase::Running(token) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn state(&self) -> CaseState {
        match self.phase {
            Phase::Idle => CaseState::Idle,
            Phase::Busy => CaseState::Busy,
            Phase::Running(_) => CaseState::Running,
        }
    }
}
