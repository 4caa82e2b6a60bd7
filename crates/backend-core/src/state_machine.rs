use crate::{
    error::{BackendError, BackendErrorCategory},
    types::{SessionEvent, SessionState},
};

/// Session lifecycle: `Anonymous -> Authenticating -> Authenticated -> Anonymous`.
///
/// Failed authentication falls back from `Authenticating` to `Anonymous`.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Anonymous,
        }
    }
}

impl SessionStateMachine {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Enter `Authenticating` for a login or restore flow.
    ///
    /// A flow already in flight is rejected with `auth_in_flight` rather than
    /// interleaved.
    pub fn begin_auth(&mut self, action: &str) -> Result<SessionEvent, BackendError> {
        match self.state {
            SessionState::Anonymous => {
                self.state = SessionState::Authenticating;
                Ok(SessionEvent::StateChanged {
                    state: SessionState::Authenticating,
                })
            }
            SessionState::Authenticating => Err(BackendError::new(
                BackendErrorCategory::Conflict,
                "auth_in_flight",
                format!("cannot run '{action}' while another login or restore is in flight"),
            )),
            SessionState::Authenticated => Err(BackendError::invalid_state(self.state, action)),
        }
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<SessionEvent, BackendError> {
        if self.state != SessionState::Authenticating {
            return Err(BackendError::invalid_state(self.state, "on_auth_result"));
        }

        let next = if success {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        };

        self.state = next;
        Ok(SessionEvent::StateChanged { state: next })
    }

    /// Logout and invalidation are accepted from every state.
    pub fn on_logout(&mut self) -> Option<SessionEvent> {
        if self.state == SessionState::Anonymous {
            return None;
        }
        self.state = SessionState::Anonymous;
        Some(SessionEvent::StateChanged {
            state: SessionState::Anonymous,
        })
    }

    pub fn require_authenticated(&self, action: &str) -> Result<(), BackendError> {
        if self.state == SessionState::Authenticated {
            Ok(())
        } else {
            Err(BackendError::invalid_state(self.state, action))
        }
    }
}
