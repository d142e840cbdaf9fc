//! Authentication retry ladder
//!
//! A read or write rejected for insufficient authentication or encryption is resubmitted
//! with a stronger security requirement: first without MITM protection, then with it.
//! After the second escalation the failure is delivered.

use super::status::GattStatus;
use log::debug;

/// Security requirement attached to an attribute submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthRequirement {
    #[default]
    None,
    /// Encrypted link, no MITM protection
    NoMitm,
    /// Authenticated (MITM protected) link
    Mitm,
}

/// Ladder position for the operation in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthRetryState {
    #[default]
    Idle,
    EscalatedNoMitm,
    EscalatedMitm,
}

/// What to do with a read/write completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Resubmit the same operation with this requirement; do not deliver
    Retry(AuthRequirement),
    /// Hand the completion to the listener
    Deliver,
}

#[derive(Debug, Default)]
pub struct AuthRetryLadder {
    state: AuthRetryState,
}

impl AuthRetryLadder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AuthRetryState {
        self.state
    }

    /// Requirement the operation was last submitted with.
    pub fn current_requirement(&self) -> AuthRequirement {
        match self.state {
            AuthRetryState::Idle => AuthRequirement::None,
            AuthRetryState::EscalatedNoMitm => AuthRequirement::NoMitm,
            AuthRetryState::EscalatedMitm => AuthRequirement::Mitm,
        }
    }

    /// Classifies a completion status and advances the ladder.
    ///
    /// On `Deliver` the ladder is already back at `Idle`. On `Retry` the caller must
    /// either resubmit or call [`reset`](Self::reset) and deliver the failure.
    pub fn on_completion(&mut self, status: GattStatus) -> AuthDecision {
        if !status.is_auth_failure() {
            self.reset();
            return AuthDecision::Deliver;
        }

        let next = match self.state {
            AuthRetryState::Idle => AuthRetryState::EscalatedNoMitm,
            AuthRetryState::EscalatedNoMitm => AuthRetryState::EscalatedMitm,
            AuthRetryState::EscalatedMitm => {
                debug!("Auth retries exhausted ({})", status);
                self.reset();
                return AuthDecision::Deliver;
            }
        };

        debug!("Escalating auth after {}: {:?} -> {:?}", status, self.state, next);
        self.state = next;
        AuthDecision::Retry(self.current_requirement())
    }

    pub fn reset(&mut self) {
        self.state = AuthRetryState::Idle;
    }
}
